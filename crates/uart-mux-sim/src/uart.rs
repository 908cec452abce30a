//! Simulated UART
//!
//! Provides a UART whose receive FIFO is filled by the test and whose
//! transmitted bytes are captured. Interrupts are raised synchronously on the
//! injecting thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::trace;
use uart_mux::{IrqHandler, UartDevice};

use crate::lock;

/// A UART with a scriptable receive side and captured transmit side
pub struct SimUart {
    /// Name reported to the mux
    name: String,
    /// Bytes waiting in the simulated receive FIFO
    rx_fifo: Mutex<VecDeque<u8>>,
    /// Every byte written with `poll_out` and not yet taken
    tx_log: Mutex<Vec<u8>>,
    /// Installed interrupt handler
    handler: Mutex<Option<IrqHandler>>,
    rx_irq_enabled: AtomicBool,
    tx_irq_enabled: AtomicBool,
    /// Feed transmitted bytes back into the receive FIFO
    loopback: AtomicBool,
}

impl SimUart {
    /// Create a simulated UART
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rx_fifo: Mutex::new(VecDeque::new()),
            tx_log: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            rx_irq_enabled: AtomicBool::new(false),
            tx_irq_enabled: AtomicBool::new(true),
            loopback: AtomicBool::new(false),
        }
    }

    /// Create a UART that receives everything it transmits
    pub fn loopback(name: impl Into<String>) -> Self {
        let uart = Self::new(name);
        uart.set_loopback(true);
        uart
    }

    /// Enable or disable loopback
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::Release);
    }

    /// Put bytes on the wire towards the mux and raise the receive interrupt
    pub fn inject(&self, data: &[u8]) {
        lock(&self.rx_fifo).extend(data.iter().copied());
        self.raise_rx();
    }

    /// Put bytes in the FIFO without raising an interrupt
    pub fn preload(&self, data: &[u8]) {
        lock(&self.rx_fifo).extend(data.iter().copied());
    }

    /// Raise the receive interrupt if it is enabled and a handler is set
    pub fn raise_rx(&self) {
        if !self.rx_irq_enabled.load(Ordering::Acquire) {
            return;
        }
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Take every byte transmitted so far
    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.tx_log))
    }

    /// Copy of every byte transmitted so far
    pub fn tx_bytes(&self) -> Vec<u8> {
        lock(&self.tx_log).clone()
    }

    /// Bytes still waiting in the receive FIFO
    pub fn fifo_len(&self) -> usize {
        lock(&self.rx_fifo).len()
    }

    pub fn rx_irq_enabled(&self) -> bool {
        self.rx_irq_enabled.load(Ordering::Acquire)
    }

    pub fn tx_irq_enabled(&self) -> bool {
        self.tx_irq_enabled.load(Ordering::Acquire)
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.handler).is_some()
    }
}

impl UartDevice for SimUart {
    fn name(&self) -> &str {
        &self.name
    }

    fn fifo_read(&self, buf: &mut [u8]) -> usize {
        let mut fifo = lock(&self.rx_fifo);
        let n = buf.len().min(fifo.len());
        for (slot, byte) in buf.iter_mut().zip(fifo.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn poll_out(&self, byte: u8) {
        trace!("{} out {:02X}", self.name, byte);
        lock(&self.tx_log).push(byte);
        if self.loopback.load(Ordering::Acquire) {
            self.inject(&[byte]);
        }
    }

    fn irq_rx_ready(&self) -> bool {
        !lock(&self.rx_fifo).is_empty()
    }

    fn irq_rx_enable(&self) {
        self.rx_irq_enabled.store(true, Ordering::Release);
    }

    fn irq_rx_disable(&self) {
        self.rx_irq_enabled.store(false, Ordering::Release);
    }

    fn irq_tx_disable(&self) {
        self.tx_irq_enabled.store(false, Ordering::Release);
    }

    fn irq_callback_set(&self, handler: Option<IrqHandler>) {
        *lock(&self.handler) = handler;
    }
}

impl std::fmt::Debug for SimUart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimUart")
            .field("name", &self.name)
            .field("fifo", &self.fifo_len())
            .field("loopback", &self.loopback.load(Ordering::Acquire))
            .finish()
    }
}
