//! Virtual channels
//!
//! A virtual channel looks like a full-duplex serial device to its user, but
//! its bytes travel as one logical channel of a framing engine session over a
//! shared physical port.
//!
//! # Lifecycle
//!
//! ```text
//! Unbound -> Allocated -> Configured -> Connected <-> Disconnected
//! ```
//!
//! `allocate` claims an unbound channel, `attach` binds it to a link and
//! creates its engine channel, and the engine drives the connected and
//! disconnected transitions.
//!
//! # Flow control
//!
//! Each channel emulates interrupt-driven device semantics with four flags.
//! `rx_ready` is set when the engine delivers data and cleared when the
//! receive ring empties. `tx_ready` is cleared when a send is queued and set
//! again once the worker has handed the bytes to the engine. When the
//! matching enable flag is set and a data-ready callback is registered, the
//! worker calls it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::config::MuxConfig;
use crate::engine::{ChannelSink, EngineChannel, FramingEngine};
use crate::error::MuxError;
use crate::lock;
use crate::notify::{schedule_ready, Callbacks, IrqCallback, StateCallback};
use crate::port::{PhysicalPort, PortPool};
use crate::ring_buffer::RingBuffer;
use crate::uart::{same_device, LineConfig, UartRef};
use crate::worker::{submit_once, WorkItem, WorkSender};

/// Index of a channel in the channel registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub usize);

/// Lifecycle state of a virtual channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// Not handed out yet
    Unbound = 0,
    /// Handed out by the registry, not attached
    Allocated = 1,
    /// Bound to a link, waiting for the engine to connect
    Configured = 2,
    /// Engine reports the channel open
    Connected = 3,
    /// Engine reports the channel closed
    Disconnected = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Allocated,
            2 => ChannelState::Configured,
            3 => ChannelState::Connected,
            4 => ChannelState::Disconnected,
            _ => ChannelState::Unbound,
        }
    }

    /// Short lowercase name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ChannelState::Unbound => "unbound",
            ChannelState::Allocated => "allocated",
            ChannelState::Configured => "configured",
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a channel is attached to
struct Binding {
    port: Arc<PhysicalPort>,
    channel_id: u8,
    /// Absent when engine channel creation failed
    engine: Option<Arc<dyn EngineChannel>>,
}

/// One logical serial channel
pub struct VirtualChannel {
    handle: ChannelHandle,
    name: String,
    in_use: AtomicBool,
    state: AtomicU8,
    rx_enabled: AtomicBool,
    tx_enabled: AtomicBool,
    rx_ready: AtomicBool,
    tx_ready: AtomicBool,
    pub(crate) tx: RingBuffer,
    pub(crate) rx: RingBuffer,
    pub(crate) tx_pending: AtomicBool,
    binding: Mutex<Option<Binding>>,
    attach_lock: Mutex<()>,
    pub(crate) callbacks: Callbacks,
    pub(crate) work: WorkSender,
    verbose: bool,
}

impl VirtualChannel {
    pub(crate) fn new(handle: ChannelHandle, config: &MuxConfig, work: WorkSender) -> Self {
        Self {
            handle,
            name: config.channel_name(handle.0),
            in_use: AtomicBool::new(false),
            state: AtomicU8::new(ChannelState::Unbound as u8),
            rx_enabled: AtomicBool::new(false),
            tx_enabled: AtomicBool::new(false),
            rx_ready: AtomicBool::new(false),
            tx_ready: AtomicBool::new(false),
            tx: RingBuffer::new(config.ringbuf_size),
            rx: RingBuffer::new(config.ringbuf_size),
            tx_pending: AtomicBool::new(false),
            binding: Mutex::new(None),
            attach_lock: Mutex::new(()),
            callbacks: Callbacks::default(),
            work,
            verbose: config.verbose_debug,
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the registry has handed this channel out
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Claim the channel for a caller of `allocate`
    pub(crate) fn claim(&self) -> bool {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.set_state(ChannelState::Allocated);
        true
    }

    /// Engine channel id, once attach has stored a binding
    pub fn channel_id(&self) -> Option<u8> {
        lock(&self.binding).as_ref().map(|b| b.channel_id)
    }

    /// Physical port this channel is bound to
    pub fn port(&self) -> Option<Arc<PhysicalPort>> {
        lock(&self.binding).as_ref().map(|b| Arc::clone(&b.port))
    }

    pub(crate) fn engine_channel(&self) -> Option<Arc<dyn EngineChannel>> {
        lock(&self.binding).as_ref().and_then(|b| b.engine.clone())
    }

    /// Id reported by the engine channel, if one exists
    pub(crate) fn engine_id(&self) -> Option<u8> {
        self.engine_channel().map(|engine| engine.id())
    }

    fn is_attached(&self) -> bool {
        lock(&self.binding).is_some()
    }

    /// Bind this channel to `link` and create engine channel `channel_id`
    ///
    /// A channel with a working engine channel cannot be attached again.
    /// After a failed engine channel creation the channel may retry, but only
    /// on the link it is already bound to.
    pub(crate) fn attach(
        self: &Arc<Self>,
        ports: &PortPool,
        engine: &dyn FramingEngine,
        link: &UartRef,
        channel_id: u8,
        state_callback: Option<StateCallback>,
    ) -> Result<(), MuxError> {
        let _attaching = lock(&self.attach_lock);

        if let Some(binding) = lock(&self.binding).as_ref() {
            let bound = binding.port.name().to_string();
            let same_link = binding
                .port
                .link()
                .is_some_and(|existing| same_device(&existing, link));
            if binding.engine.is_some() || !same_link {
                return Err(MuxError::AlreadyAttached {
                    channel: self.name.clone(),
                    link: bound,
                });
            }
        }

        let port = ports.bind_if_needed(link)?;
        port.ensure_session_once(engine, link)?;
        let session = port
            .session()
            .cloned()
            .ok_or_else(|| MuxError::Unavailable(format!("{} has no session", port.name())))?;

        *lock(&self.binding) = Some(Binding {
            port: Arc::clone(&port),
            channel_id,
            engine: None,
        });
        self.callbacks.set_state(state_callback);
        self.tx_enabled.store(true, Ordering::Release);
        self.rx_enabled.store(true, Ordering::Release);
        self.tx_ready.store(true, Ordering::Release);
        self.set_state(ChannelState::Configured);

        // The engine may report the channel connected before this returns
        match session.create_channel(channel_id, ChannelSink::new(self)) {
            Ok(engine_channel) => {
                if let Some(binding) = lock(&self.binding).as_mut() {
                    binding.engine = Some(engine_channel);
                }
                info!(
                    "Attached {} to {} as channel {}",
                    self.name,
                    port.name(),
                    channel_id
                );
                Ok(())
            }
            Err(e) => {
                debug!(
                    "Cannot create engine channel {} for {}: {}",
                    channel_id, self.name, e
                );
                Err(e.into())
            }
        }
    }

    /// Engine report that the channel connected or disconnected
    pub fn on_framing_state_change(&self, connected: bool) {
        let state = if connected {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        };
        self.set_state(state);

        // The engine may report before its channel handle is stored
        let channel_id = self
            .engine_id()
            .or_else(|| self.channel_id())
            .unwrap_or_default();
        info!("{} channel {} {}", self.name, channel_id, state);
        self.callbacks
            .notify_state(self.handle, channel_id, connected);
    }

    /// Queue `data` for transmission, returning the number of bytes accepted
    ///
    /// Never blocks. Returns 0 unless the channel is connected; bytes that do
    /// not fit the transmit ring are dropped.
    pub fn send(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.state() != ChannelState::Connected {
            warn!("{} not connected, drop {} bytes", self.name, data.len());
            return 0;
        }

        self.tx_ready.store(false, Ordering::Release);
        let wrote = self.tx.put(data);
        if wrote < data.len() {
            warn!(
                "{} transmit ring full, drop {} bytes",
                self.name,
                data.len() - wrote
            );
        }
        if self.verbose {
            debug!("{} queued {:02X?}", self.name, &data[..wrote]);
        }

        submit_once(&self.work, &self.tx_pending, WorkItem::TxSend(self.handle));
        wrote
    }

    /// Copy received bytes into `buf`, returning the count
    pub fn receive(&self, buf: &mut [u8]) -> usize {
        let n = self.rx.get(buf);
        if self.rx.is_empty() {
            self.rx_ready.store(false, Ordering::Release);
            // Data delivered between the check and the store
            if !self.rx.is_empty() {
                self.rx_ready.store(true, Ordering::Release);
            }
        }
        n
    }

    /// Demultiplexed payload from the engine, returning the count accepted
    pub fn deliver_from_engine(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let wrote = self.rx.put(data);
        if wrote < data.len() {
            error!(
                "{} receive ring full, drop {} bytes",
                self.name,
                data.len() - wrote
            );
        }
        if self.verbose {
            debug!("RECV {}: {:02X?}", self.name, &data[..wrote]);
        }

        self.rx_ready.store(true, Ordering::Release);
        if self.rx_enabled() && self.callbacks.has_irq() {
            schedule_ready(&self.work, self.handle);
        }
        wrote
    }

    pub fn rx_enabled(&self) -> bool {
        self.rx_enabled.load(Ordering::Acquire)
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled.load(Ordering::Acquire)
    }

    pub fn rx_ready(&self) -> bool {
        self.rx_ready.load(Ordering::Acquire)
    }

    pub fn tx_ready(&self) -> bool {
        self.tx_ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_tx_ready(&self, ready: bool) {
        self.tx_ready.store(ready, Ordering::Release);
    }

    /// Bytes waiting to be read
    pub fn rx_available(&self) -> usize {
        self.rx.len()
    }

    /// Bytes waiting to be handed to the engine
    pub fn tx_queued(&self) -> usize {
        self.tx.len()
    }

    pub fn enable_rx(&self) {
        self.rx_enabled.store(true, Ordering::Release);
        if self.rx_ready() && self.callbacks.has_irq() {
            schedule_ready(&self.work, self.handle);
        }
    }

    pub fn disable_rx(&self) {
        self.rx_enabled.store(false, Ordering::Release);
    }

    pub fn enable_tx(&self) {
        self.tx_enabled.store(true, Ordering::Release);
        if self.tx_ready() && self.callbacks.has_irq() {
            schedule_ready(&self.work, self.handle);
        }
    }

    pub fn disable_tx(&self) {
        self.tx_enabled.store(false, Ordering::Release);
    }

    /// Register or clear the data-ready callback
    pub fn irq_callback_set(&self, callback: Option<IrqCallback>) {
        self.callbacks.set_irq(callback);
    }

    /// Always true; flags are kept current without latching
    pub fn irq_update(&self) -> bool {
        true
    }

    pub fn irq_rx_ready(&self) -> Result<bool, MuxError> {
        self.require_attached()?;
        Ok(self.rx_ready())
    }

    pub fn irq_tx_ready(&self) -> Result<bool, MuxError> {
        self.require_attached()?;
        Ok(self.tx_ready())
    }

    /// Whether an enabled direction is ready
    pub fn irq_is_pending(&self) -> bool {
        (self.tx_ready() && self.tx_enabled()) || (self.rx_ready() && self.rx_enabled())
    }

    pub fn irq_err_enable(&self) {}

    pub fn irq_err_disable(&self) {}

    pub fn irq_tx_complete(&self) -> Result<bool, MuxError> {
        Err(MuxError::NotSupported)
    }

    /// Send one byte straight through the engine channel
    ///
    /// Bypasses the transmit ring. Does nothing if the channel has no engine
    /// channel.
    pub fn poll_out(&self, byte: u8) {
        let Some(engine) = self.engine_channel() else {
            debug!("{} not attached, drop polled byte", self.name);
            return;
        };
        if let Err(e) = engine.send(&[byte]) {
            warn!("{} cannot send polled byte: {}", self.name, e);
        }
    }

    /// Blocking reads are not available on a muxed channel
    pub fn poll_in(&self) -> Result<u8, MuxError> {
        Err(MuxError::NotSupported)
    }

    pub fn err_check(&self) -> Result<(), MuxError> {
        Err(MuxError::NotSupported)
    }

    /// Line settings belong to the physical link, not to a channel
    pub fn configure(&self, _config: &LineConfig) -> Result<(), MuxError> {
        Err(MuxError::NotSupported)
    }

    pub fn config_get(&self) -> Result<LineConfig, MuxError> {
        Err(MuxError::NotSupported)
    }

    fn require_attached(&self) -> Result<(), MuxError> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(MuxError::Unavailable(format!("{} not attached", self.name)))
        }
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("rx_ready", &self.rx_ready())
            .field("tx_ready", &self.tx_ready())
            .finish()
    }
}
