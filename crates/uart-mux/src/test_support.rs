//! In-crate test doubles for the UART and framing engine

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::engine::{ChannelSink, EngineChannel, FramingEngine, FramingSession, PortLink};
use crate::error::EngineError;
use crate::lock;
use crate::uart::{IrqHandler, UartDevice};

/// UART with a scripted receive FIFO and captured output
pub(crate) struct NullUart {
    name: String,
    rx: Mutex<VecDeque<u8>>,
    tx: Mutex<Vec<u8>>,
    handler: Mutex<Option<IrqHandler>>,
    rx_enabled: AtomicBool,
    tx_disabled: AtomicBool,
}

impl NullUart {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rx: Mutex::new(VecDeque::new()),
            tx: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            rx_enabled: AtomicBool::new(false),
            tx_disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn push_rx(&self, data: &[u8]) {
        lock(&self.rx).extend(data.iter().copied());
    }

    /// Raise the receive interrupt if it is enabled
    pub(crate) fn fire(&self) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler.filter(|_| self.rx_enabled.load(Ordering::Acquire)) {
            handler();
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        lock(&self.tx).clone()
    }

    pub(crate) fn rx_enabled(&self) -> bool {
        self.rx_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn tx_disabled(&self) -> bool {
        self.tx_disabled.load(Ordering::Acquire)
    }

    pub(crate) fn has_handler(&self) -> bool {
        lock(&self.handler).is_some()
    }
}

impl UartDevice for NullUart {
    fn name(&self) -> &str {
        &self.name
    }

    fn fifo_read(&self, buf: &mut [u8]) -> usize {
        let mut rx = lock(&self.rx);
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn poll_out(&self, byte: u8) {
        lock(&self.tx).push(byte);
    }

    fn irq_rx_ready(&self) -> bool {
        !lock(&self.rx).is_empty()
    }

    fn irq_rx_enable(&self) {
        self.rx_enabled.store(true, Ordering::Release);
    }

    fn irq_rx_disable(&self) {
        self.rx_enabled.store(false, Ordering::Release);
    }

    fn irq_tx_disable(&self) {
        self.tx_disabled.store(true, Ordering::Release);
    }

    fn irq_callback_set(&self, handler: Option<IrqHandler>) {
        *lock(&self.handler) = handler;
    }
}

/// Engine that counts sessions and hands out [`RecordingSession`]s
#[derive(Default)]
pub(crate) struct CountingEngine {
    sessions: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
    last: Mutex<Option<Arc<RecordingSession>>>,
}

impl CountingEngine {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub(crate) fn last_session(&self) -> Option<Arc<RecordingSession>> {
        lock(&self.last).clone()
    }
}

impl FramingEngine for CountingEngine {
    fn create_session(&self, link: PortLink) -> Result<Arc<dyn FramingSession>, EngineError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::Acquire) {
            return Err(EngineError::OutOfMemory);
        }
        self.sessions.fetch_add(1, Ordering::AcqRel);
        let session = Arc::new(RecordingSession {
            link,
            demuxed: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            fail_channels: AtomicBool::new(false),
            id_offset: AtomicU8::new(0),
        });
        *lock(&self.last) = Some(Arc::clone(&session));
        Ok(session)
    }
}

/// Session that records demuxed bytes and routes them all to the first channel
pub(crate) struct RecordingSession {
    link: PortLink,
    demuxed: Mutex<Vec<u8>>,
    sinks: Mutex<Vec<(u8, ChannelSink)>>,
    fail_channels: AtomicBool,
    id_offset: AtomicU8,
}

impl RecordingSession {
    pub(crate) fn demuxed(&self) -> Vec<u8> {
        lock(&self.demuxed).clone()
    }

    pub(crate) fn set_fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::Release);
    }

    /// Make engine channel ids differ from the requested ones
    pub(crate) fn set_id_offset(&self, offset: u8) {
        self.id_offset.store(offset, Ordering::Release);
    }
}

impl FramingSession for RecordingSession {
    fn create_channel(
        &self,
        channel_id: u8,
        sink: ChannelSink,
    ) -> Result<Arc<dyn EngineChannel>, EngineError> {
        if self.fail_channels.load(Ordering::Acquire) {
            return Err(EngineError::OutOfMemory);
        }
        lock(&self.sinks).push((channel_id, sink));
        Ok(Arc::new(RawChannel {
            id: channel_id.wrapping_add(self.id_offset.load(Ordering::Acquire)),
            link: self.link.clone(),
        }))
    }

    fn demultiplex(&self, data: &[u8]) {
        lock(&self.demuxed).extend_from_slice(data);
        let first = lock(&self.sinks).first().map(|(_, sink)| sink.clone());
        if let Some(sink) = first {
            sink.deliver(data);
        }
    }
}

/// Channel that writes payload to the link without framing
pub(crate) struct RawChannel {
    id: u8,
    link: PortLink,
}

impl EngineChannel for RawChannel {
    fn id(&self) -> u8 {
        self.id
    }

    fn send(&self, data: &[u8]) -> Result<(), EngineError> {
        self.link
            .write(data)
            .map_err(|e| EngineError::SendFailed(e.to_string()))
    }
}
