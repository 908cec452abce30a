//! Raw UART capability used by physical ports
//!
//! The mux never talks to hardware directly. A physical link is anything that
//! can hand over received bytes from its FIFO, push single bytes out, and call
//! a handler when receive data is pending.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Handler invoked from the link's interrupt context
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Shared reference to a physical link
pub type UartRef = Arc<dyn UartDevice>;

/// Byte-level access to a real UART
///
/// `fifo_read`, `irq_update` and `irq_rx_ready` are called from the
/// interrupt handler and must not block.
pub trait UartDevice: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Read whatever the receive FIFO holds into `buf`, returning the count
    fn fifo_read(&self, buf: &mut [u8]) -> usize;

    /// Transmit one byte, waiting for room in the transmitter
    fn poll_out(&self, byte: u8);

    /// Latch interrupt status before the `irq_*_ready` queries
    fn irq_update(&self) -> bool {
        true
    }

    /// Whether received data is waiting in the FIFO
    fn irq_rx_ready(&self) -> bool;

    /// Enable the receive interrupt
    fn irq_rx_enable(&self);

    /// Disable the receive interrupt
    fn irq_rx_disable(&self);

    /// Disable the transmit interrupt
    fn irq_tx_disable(&self);

    /// Install or clear the interrupt handler
    fn irq_callback_set(&self, handler: Option<IrqHandler>);
}

/// Whether two references point at the same physical link
pub(crate) fn same_device(a: &UartRef, b: &UartRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowControl {
    #[default]
    None,
    RtsCts,
}

/// Serial line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl fmt::Display for LineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}
