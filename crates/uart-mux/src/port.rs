//! Physical ports
//!
//! A physical port wraps one real UART shared by every virtual channel bound
//! to it. It owns the framing session for that link (created once, on the
//! first successful attach), the receive ring filled from interrupt context,
//! and the lock that keeps frames from different channels from interleaving
//! on the wire.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::engine::{FramingEngine, FramingSession, PortLink};
use crate::error::MuxError;
use crate::lock;
use crate::ring_buffer::RingBuffer;
use crate::uart::{same_device, UartRef};
use crate::worker::{submit_once, WorkItem, WorkSender};

/// Size of the stack buffer the interrupt handler drains the FIFO through
pub const TEMP_BUF_SIZE: usize = 32;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// Index of a port in the fixed port pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortIndex(pub usize);

/// One real UART carrying muxed traffic
pub struct PhysicalPort {
    index: PortIndex,
    link: Mutex<Option<UartRef>>,
    session: OnceLock<Arc<dyn FramingSession>>,
    init: AtomicU8,
    pub(crate) rx: RingBuffer,
    pub(crate) rx_pending: AtomicBool,
    write_lock: Mutex<()>,
    irq_lock: Mutex<()>,
    work: WorkSender,
    verbose: bool,
}

impl PhysicalPort {
    pub(crate) fn new(index: PortIndex, ringbuf_size: usize, work: WorkSender, verbose: bool) -> Self {
        Self {
            index,
            link: Mutex::new(None),
            session: OnceLock::new(),
            init: AtomicU8::new(UNINITIALIZED),
            rx: RingBuffer::new(ringbuf_size),
            rx_pending: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            irq_lock: Mutex::new(()),
            work,
            verbose,
        }
    }

    /// Position in the port pool
    pub fn index(&self) -> PortIndex {
        self.index
    }

    /// The link this slot is bound to, if any
    pub fn link(&self) -> Option<UartRef> {
        lock(&self.link).clone()
    }

    /// Link name, or `<unbound>`
    pub fn name(&self) -> String {
        self.link()
            .map_or_else(|| "<unbound>".to_string(), |link| link.name().to_string())
    }

    fn is_bound_to(&self, link: &UartRef) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|bound| same_device(bound, link))
    }

    /// Whether the framing session exists and interrupts are wired up
    pub fn is_ready(&self) -> bool {
        self.init.load(Ordering::Acquire) == READY
    }

    /// Bytes received but not yet demultiplexed
    pub fn rx_buffered(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn session(&self) -> Option<&Arc<dyn FramingSession>> {
        self.session.get()
    }

    /// Create the framing session for `link` exactly once
    ///
    /// Only the caller that moves the port from uninitialized to initializing
    /// builds the session. Concurrent callers wait until the port is ready.
    /// If session creation fails the slot is unbound and the port goes back
    /// to uninitialized, so a waiting caller (or a later attach, possibly for
    /// another link) makes its own attempt.
    pub fn ensure_session_once(
        self: &Arc<Self>,
        engine: &dyn FramingEngine,
        link: &UartRef,
    ) -> Result<(), MuxError> {
        loop {
            match self.init.compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.initialize(engine, link),
                Err(READY) if self.is_bound_to(link) => return Ok(()),
                Err(READY) => return Err(self.rebound(link)),
                Err(_) => {
                    while self.init.load(Ordering::Acquire) == INITIALIZING {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    fn rebound(&self, link: &UartRef) -> MuxError {
        MuxError::Unavailable(format!(
            "port {} was rebound before {} initialized",
            self.index.0,
            link.name()
        ))
    }

    fn initialize(self: &Arc<Self>, engine: &dyn FramingEngine, link: &UartRef) -> Result<(), MuxError> {
        let bound_elsewhere = {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some(bound) => !same_device(bound, link),
                // Unbound by an earlier failed attempt
                None => {
                    *slot = Some(Arc::clone(link));
                    false
                }
            }
        };
        if bound_elsewhere {
            self.init.store(UNINITIALIZED, Ordering::Release);
            return Err(self.rebound(link));
        }

        let session = match engine.create_session(PortLink::new(self, link.name().to_string())) {
            Ok(session) => session,
            Err(e) => {
                debug!("Cannot create framing session on {}: {}", link.name(), e);
                *lock(&self.link) = None;
                self.init.store(UNINITIALIZED, Ordering::Release);
                return Err(MuxError::OutOfMemory(format!(
                    "framing session on {}: {}",
                    link.name(),
                    e
                )));
            }
        };
        // Only the initializing caller reaches this point, and a session is
        // never stored on failure
        let _ = self.session.set(session);

        info!("Initializing UART {} for muxing", link.name());

        link.irq_rx_disable();
        link.irq_tx_disable();
        let mut byte = [0u8; 1];
        while link.fifo_read(&mut byte) > 0 {}

        let port = Arc::downgrade(self);
        link.irq_callback_set(Some(Arc::new(move || {
            if let Some(port) = port.upgrade() {
                port.on_interrupt();
            }
        })));
        link.irq_rx_enable();

        self.init.store(READY, Ordering::Release);
        Ok(())
    }

    /// Write framed bytes to the link, one byte at a time
    ///
    /// Holds the port lock for the whole write. Must not be called from
    /// interrupt context.
    pub fn raw_write(&self, data: &[u8]) -> Result<(), MuxError> {
        if data.is_empty() {
            return Ok(());
        }
        let link = match self.link() {
            Some(link) if self.init.load(Ordering::Acquire) != UNINITIALIZED => link,
            _ => {
                return Err(MuxError::Unavailable(format!(
                    "port {} not initialized",
                    self.index.0
                )))
            }
        };

        if self.verbose {
            debug!("SEND muxed {}: {:02X?}", link.name(), data);
        }

        let _guard = lock(&self.write_lock);
        for byte in data {
            link.poll_out(*byte);
        }
        Ok(())
    }

    /// Interrupt handler shared by all channels on this link
    ///
    /// Drains the hardware FIFO into the receive ring and schedules the
    /// demux task. Bytes that do not fit are dropped and logged. Handler runs
    /// are serialized, so this is the only producer on the receive ring no
    /// matter how many threads the link raises it from.
    pub fn on_interrupt(&self) {
        let _irq = lock(&self.irq_lock);
        let Some(link) = self.link() else {
            return;
        };
        let mut buf = [0u8; TEMP_BUF_SIZE];

        while link.irq_update() && link.irq_rx_ready() {
            let n = link.fifo_read(&mut buf);
            if n == 0 {
                continue;
            }

            match self.rx.try_put(&buf[..n]) {
                Some(wrote) if wrote < n => {
                    error!("Ring buffer full, drop {} bytes", n - wrote);
                }
                Some(_) => {}
                None => {
                    warn!("Receive ring of {} busy, drop {} bytes", link.name(), n);
                    break;
                }
            }

            submit_once(&self.work, &self.rx_pending, WorkItem::RxDemux(self.index));
        }
    }
}

impl std::fmt::Debug for PhysicalPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalPort")
            .field("index", &self.index)
            .field("link", &self.name())
            .field("ready", &self.is_ready())
            .field("rx", &self.rx)
            .finish()
    }
}

/// Fixed pool of physical ports
///
/// Slots are claimed on first use and released only when creating the
/// framing session fails.
#[derive(Debug)]
pub struct PortPool {
    ports: Box<[Arc<PhysicalPort>]>,
}

impl PortPool {
    pub(crate) fn new(count: usize, ringbuf_size: usize, work: &WorkSender, verbose: bool) -> Self {
        Self {
            ports: (0..count)
                .map(|i| Arc::new(PhysicalPort::new(PortIndex(i), ringbuf_size, work.clone(), verbose)))
                .collect(),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether the pool has no slots
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Port at `index`
    pub fn get(&self, index: PortIndex) -> Option<&Arc<PhysicalPort>> {
        self.ports.get(index.0)
    }

    /// Iterate over all slots
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PhysicalPort>> {
        self.ports.iter()
    }

    /// Port already bound to `link`
    pub fn find(&self, link: &UartRef) -> Option<&Arc<PhysicalPort>> {
        self.ports.iter().find(|port| port.is_bound_to(link))
    }

    /// Return the port bound to `link`, claiming a free slot if needed
    pub fn bind_if_needed(&self, link: &UartRef) -> Result<Arc<PhysicalPort>, MuxError> {
        if let Some(port) = self.find(link) {
            return Ok(Arc::clone(port));
        }

        for port in self.ports.iter() {
            // Another caller may claim the slot first, possibly for this link
            let mut slot = lock(&port.link);
            let claimed = match slot.as_ref() {
                Some(bound) => same_device(bound, link),
                None => {
                    *slot = Some(Arc::clone(link));
                    true
                }
            };
            if claimed {
                debug!("Bound {} to port {}", link.name(), port.index.0);
                return Ok(Arc::clone(port));
            }
        }

        Err(MuxError::NotFound(format!(
            "no free port for {}",
            link.name()
        )))
    }
}
