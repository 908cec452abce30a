//! Host serial port as a physical link
//!
//! A host serial port has no receive interrupt the mux could hook, so a
//! reader thread plays that role: it moves bytes from the OS into a small
//! software FIFO and calls the installed handler, which drains the FIFO the
//! same way it would drain a hardware one. The handler only ever runs on the
//! reader thread; enabling the interrupt with data already buffered asks that
//! thread to raise it.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::lock;
use crate::uart::{FlowControl, IrqHandler, LineConfig, Parity, UartDevice};

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 64;

/// Bytes the software FIFO holds before it overruns
pub const FIFO_CAPACITY: usize = 4096;

/// A serial port the host can open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub name: String,
    /// USB product string, if known
    pub product: Option<String>,
}

/// List the serial ports present on this host
pub fn available_ports() -> Result<Vec<PortInfo>, MuxError> {
    let ports = serialport::available_ports()?;
    let result: Vec<_> = ports
        .into_iter()
        .map(|p| PortInfo {
            product: match &p.port_type {
                SerialPortType::UsbPort(usb) => usb.product.clone(),
                _ => None,
            },
            name: p.port_name,
        })
        .collect();
    info!("Found {} serial port(s)", result.len());
    Ok(result)
}

/// Bounded receive FIFO that counts the bytes it had to drop
#[derive(Debug)]
struct SoftFifo {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
    overruns: AtomicUsize,
}

impl SoftFifo {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overruns: AtomicUsize::new(0),
        }
    }

    /// Append what fits, returning the number of bytes dropped
    fn push(&self, data: &[u8]) -> usize {
        let mut bytes = lock(&self.bytes);
        let n = data.len().min(self.capacity - bytes.len());
        bytes.extend(&data[..n]);
        let dropped = data.len() - n;
        if dropped > 0 {
            self.overruns.fetch_add(dropped, Ordering::AcqRel);
        }
        dropped
    }

    fn pop_into(&self, buf: &mut [u8]) -> usize {
        let mut bytes = lock(&self.bytes);
        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn is_empty(&self) -> bool {
        lock(&self.bytes).is_empty()
    }
}

/// Raw UART backed by a host serial port
pub struct SerialLink {
    name: String,
    writer: Mutex<Box<dyn SerialPort>>,
    fifo: SoftFifo,
    handler: Mutex<Option<IrqHandler>>,
    rx_enabled: AtomicBool,
    /// Raise the handler on the next reader pass even without new data
    kick: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl SerialLink {
    /// Open `path` with `config` and start its reader thread
    pub fn open(path: &str, config: &LineConfig) -> Result<Arc<Self>, MuxError> {
        let port = serialport::new(path, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .stop_bits(stop_bits(config.stop_bits)?)
            .parity(match config.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .flow_control(match config.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::RtsCts => serialport::FlowControl::Hardware,
            })
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;

        let link = Arc::new(Self {
            name: path.to_string(),
            writer: Mutex::new(port),
            fifo: SoftFifo::new(FIFO_CAPACITY),
            handler: Mutex::new(None),
            rx_enabled: AtomicBool::new(false),
            kick: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
        });

        let weak = Arc::downgrade(&link);
        let stop = Arc::clone(&link.stop);
        thread::Builder::new()
            .name(format!("{}-rx", path))
            .spawn(move || read_loop(weak, reader, stop))
            .map_err(|e| MuxError::Link(e.to_string()))?;

        info!("Opened {} at {}", path, config);
        Ok(link)
    }

    /// Bytes dropped because the software FIFO was full
    pub fn overrun_count(&self) -> usize {
        self.fifo.overruns.load(Ordering::Acquire)
    }

    fn raise(&self) {
        if !self.rx_enabled.load(Ordering::Acquire) {
            return;
        }
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

fn data_bits(bits: u8) -> Result<serialport::DataBits, MuxError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(MuxError::InvalidArgument(format!("{} data bits", other))),
    }
}

fn stop_bits(bits: u8) -> Result<serialport::StopBits, MuxError> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(MuxError::InvalidArgument(format!("{} stop bits", other))),
    }
}

fn read_loop(link: Weak<SerialLink>, mut port: Box<dyn SerialPort>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; READ_CHUNK];
    while !stop.load(Ordering::Acquire) {
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => 0,
            Err(e) if e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                warn!("Read from serial link failed: {}", e);
                break;
            }
        };
        let Some(link) = link.upgrade() else {
            break;
        };
        if n > 0 {
            let dropped = link.fifo.push(&buf[..n]);
            if dropped > 0 {
                warn!("{} receive FIFO overrun, drop {} bytes", link.name, dropped);
            }
        }
        if link.kick.swap(false, Ordering::AcqRel) || n > 0 {
            link.raise();
        }
    }
    debug!("Serial reader stopped");
}

impl UartDevice for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn fifo_read(&self, buf: &mut [u8]) -> usize {
        self.fifo.pop_into(buf)
    }

    fn poll_out(&self, byte: u8) {
        if let Err(e) = lock(&self.writer).write_all(&[byte]) {
            warn!("Write to {} failed: {}", self.name, e);
        }
    }

    fn irq_rx_ready(&self) -> bool {
        !self.fifo.is_empty()
    }

    fn irq_rx_enable(&self) {
        self.rx_enabled.store(true, Ordering::Release);
        // Data may have arrived while disabled
        if self.irq_rx_ready() {
            self.kick.store(true, Ordering::Release);
        }
    }

    fn irq_rx_disable(&self) {
        self.rx_enabled.store(false, Ordering::Release);
    }

    fn irq_tx_disable(&self) {}

    fn irq_callback_set(&self, handler: Option<IrqHandler>) {
        *lock(&self.handler) = handler;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("rx_enabled", &self.rx_enabled.load(Ordering::Acquire))
            .field("overruns", &self.overrun_count())
            .finish()
    }
}
