//! Toy framing engine
//!
//! Frames are `F9 id len payload F9` with a one-byte length and no escaping.
//! This is enough to route bytes between channels in tests; it is not a
//! real multiplexing protocol.
//!
//! Channels start disconnected. Tests open and close them with
//! [`SimSession::connect`] and [`SimSession::disconnect`], or build the
//! engine with [`SimFramingEngine::with_auto_connect`] to have every new
//! channel connect as soon as it is created.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};
use uart_mux::{
    ChannelSink, EngineChannel, EngineError, FramingEngine, FramingSession, PortLink,
};

use crate::lock;

/// Frame delimiter
pub const FLAG: u8 = 0xF9;

/// Largest payload carried by one frame
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Encode `data` for channel `id`, split into as many frames as needed
pub fn encode_frames(id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4 * (data.len() / MAX_PAYLOAD + 1));
    for chunk in data.chunks(MAX_PAYLOAD) {
        out.push(FLAG);
        out.push(id);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
        out.push(FLAG);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Flag,
    Id,
    Len,
    Payload,
    End,
}

/// Incremental frame parser
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    id: u8,
    len: usize,
    payload: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self {
            state: ParseState::Flag,
            id: 0,
            len: 0,
            payload: Vec::new(),
        }
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every frame they complete
    pub fn feed(&mut self, data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        for &byte in data {
            match self.state {
                ParseState::Flag => {
                    if byte == FLAG {
                        self.state = ParseState::Id;
                    }
                }
                // Repeated flags between frames
                ParseState::Id if byte == FLAG => {}
                ParseState::Id => {
                    self.id = byte;
                    self.state = ParseState::Len;
                }
                ParseState::Len => {
                    self.len = byte as usize;
                    self.payload.clear();
                    self.state = if self.len == 0 {
                        ParseState::End
                    } else {
                        ParseState::Payload
                    };
                }
                ParseState::Payload => {
                    self.payload.push(byte);
                    if self.payload.len() == self.len {
                        self.state = ParseState::End;
                    }
                }
                ParseState::End => {
                    if byte == FLAG {
                        frames.push((self.id, std::mem::take(&mut self.payload)));
                    } else {
                        debug!("Bad frame end {:02X} for channel {}", byte, self.id);
                    }
                    self.state = ParseState::Flag;
                }
            }
        }
        frames
    }
}

struct Slot {
    sink: ChannelSink,
    connected: Arc<AtomicBool>,
}

/// Framing state for one simulated link
pub struct SimSession {
    link: PortLink,
    parser: Mutex<FrameParser>,
    channels: Mutex<BTreeMap<u8, Slot>>,
    auto_connect: bool,
    fail_channels: Arc<AtomicBool>,
}

impl SimSession {
    /// Name of the link this session runs on
    pub fn link_name(&self) -> &str {
        self.link.name()
    }

    /// Identifiers of every channel created so far
    pub fn channel_ids(&self) -> Vec<u8> {
        lock(&self.channels).keys().copied().collect()
    }

    /// Mark channel `id` connected, returning false if it does not exist
    pub fn connect(&self, id: u8) -> bool {
        self.set_connected(id, true)
    }

    /// Mark channel `id` disconnected, returning false if it does not exist
    pub fn disconnect(&self, id: u8) -> bool {
        self.set_connected(id, false)
    }

    pub fn is_connected(&self, id: u8) -> bool {
        lock(&self.channels)
            .get(&id)
            .is_some_and(|slot| slot.connected.load(Ordering::Acquire))
    }

    fn set_connected(&self, id: u8, connected: bool) -> bool {
        let sink = {
            let channels = lock(&self.channels);
            let Some(slot) = channels.get(&id) else {
                return false;
            };
            slot.connected.store(connected, Ordering::Release);
            slot.sink.clone()
        };
        sink.set_connected(connected);
        true
    }
}

impl FramingSession for SimSession {
    fn create_channel(
        &self,
        channel_id: u8,
        sink: ChannelSink,
    ) -> Result<Arc<dyn EngineChannel>, EngineError> {
        if self.fail_channels.load(Ordering::Acquire) {
            return Err(EngineError::OutOfMemory);
        }

        let connected = Arc::new(AtomicBool::new(false));
        {
            let mut channels = lock(&self.channels);
            if channels.contains_key(&channel_id) {
                return Err(EngineError::ChannelExists(channel_id));
            }
            channels.insert(
                channel_id,
                Slot {
                    sink,
                    connected: Arc::clone(&connected),
                },
            );
        }
        debug!("Created channel {} on {}", channel_id, self.link.name());

        if self.auto_connect {
            self.connect(channel_id);
        }

        Ok(Arc::new(SimChannel {
            id: channel_id,
            link: self.link.clone(),
            connected,
        }))
    }

    fn demultiplex(&self, data: &[u8]) {
        let frames = lock(&self.parser).feed(data);
        for (id, payload) in frames {
            let sink = lock(&self.channels).get(&id).map(|slot| slot.sink.clone());
            match sink {
                Some(sink) => {
                    sink.deliver(&payload);
                }
                None => debug!("Frame for unknown channel {} dropped", id),
            }
        }
    }
}

impl std::fmt::Debug for SimSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSession")
            .field("link", &self.link.name())
            .field("channels", &self.channel_ids())
            .finish()
    }
}

/// One channel of a [`SimSession`]
#[derive(Debug)]
pub struct SimChannel {
    id: u8,
    link: PortLink,
    connected: Arc<AtomicBool>,
}

impl EngineChannel for SimChannel {
    fn id(&self) -> u8 {
        self.id
    }

    fn send(&self, data: &[u8]) -> Result<(), EngineError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(EngineError::NotConnected(self.id));
        }
        self.link
            .write(&encode_frames(self.id, data))
            .map_err(|e| EngineError::SendFailed(e.to_string()))
    }
}

/// Engine producing [`SimSession`]s
#[derive(Default)]
pub struct SimFramingEngine {
    auto_connect: bool,
    session_delay: Duration,
    fail_sessions: AtomicBool,
    fail_channels: Arc<AtomicBool>,
    created: AtomicUsize,
    sessions: Mutex<Vec<Arc<SimSession>>>,
}

impl SimFramingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every channel as soon as it is created
    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Sleep this long inside every session creation
    pub fn with_session_delay(mut self, delay: Duration) -> Self {
        self.session_delay = delay;
        self
    }

    /// Make session creation fail until cleared
    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::Release);
    }

    /// Make channel creation fail on every session until cleared
    pub fn fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::Release);
    }

    /// Number of sessions created successfully
    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Session number `index`, in creation order
    pub fn session(&self, index: usize) -> Option<Arc<SimSession>> {
        lock(&self.sessions).get(index).cloned()
    }

    /// Session running on the link called `name`
    pub fn session_for(&self, name: &str) -> Option<Arc<SimSession>> {
        lock(&self.sessions)
            .iter()
            .find(|session| session.link_name() == name)
            .cloned()
    }
}

impl FramingEngine for SimFramingEngine {
    fn create_session(&self, link: PortLink) -> Result<Arc<dyn FramingSession>, EngineError> {
        if !self.session_delay.is_zero() {
            thread::sleep(self.session_delay);
        }
        if self.fail_sessions.load(Ordering::Acquire) {
            return Err(EngineError::OutOfMemory);
        }

        info!("Simulated framing session on {}", link.name());
        let session = Arc::new(SimSession {
            link,
            parser: Mutex::new(FrameParser::new()),
            channels: Mutex::new(BTreeMap::new()),
            auto_connect: self.auto_connect,
            fail_channels: Arc::clone(&self.fail_channels),
        });
        lock(&self.sessions).push(Arc::clone(&session));
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(session)
    }
}

impl std::fmt::Debug for SimFramingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFramingEngine")
            .field("auto_connect", &self.auto_connect)
            .field("sessions", &self.sessions_created())
            .finish()
    }
}
