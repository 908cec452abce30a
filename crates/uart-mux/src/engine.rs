//! Framing engine interface
//!
//! The mux does not know the multiplexing wire protocol. A [`FramingEngine`]
//! owns framing, demultiplexing and per-channel connection state; the mux
//! hands it raw received bytes and per-channel payloads, and the engine calls
//! back through [`PortLink`] (raw transmit) and [`ChannelSink`] (received
//! payloads and connection changes).

use std::sync::{Arc, Weak};

use crate::channel::VirtualChannel;
use crate::error::{EngineError, MuxError};
use crate::port::PhysicalPort;

/// Factory for per-link framing sessions
pub trait FramingEngine: Send + Sync {
    /// Create the session that will own all channels on `link`
    fn create_session(&self, link: PortLink) -> Result<Arc<dyn FramingSession>, EngineError>;
}

/// Framing state for one physical link
pub trait FramingSession: Send + Sync {
    /// Create logical channel `channel_id`, delivering its traffic to `sink`
    fn create_channel(
        &self,
        channel_id: u8,
        sink: ChannelSink,
    ) -> Result<Arc<dyn EngineChannel>, EngineError>;

    /// Parse received link bytes, calling [`ChannelSink::deliver`] for payloads
    fn demultiplex(&self, data: &[u8]);
}

/// One logical channel inside a session
pub trait EngineChannel: Send + Sync {
    /// Identifier assigned by the engine
    fn id(&self) -> u8;

    /// Frame `data` for this channel and write it to the link
    fn send(&self, data: &[u8]) -> Result<(), EngineError>;
}

/// Transmit handle the engine uses to reach the physical link
#[derive(Clone)]
pub struct PortLink {
    port: Weak<PhysicalPort>,
    name: String,
}

impl PortLink {
    pub(crate) fn new(port: &Arc<PhysicalPort>, name: String) -> Self {
        Self {
            port: Arc::downgrade(port),
            name,
        }
    }

    /// Name of the underlying link
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write already-framed bytes to the link
    ///
    /// Blocks while another channel's frame is being written.
    pub fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        let port = self
            .port
            .upgrade()
            .ok_or_else(|| MuxError::Unavailable(format!("{} released", self.name)))?;
        port.raw_write(data)
    }
}

impl std::fmt::Debug for PortLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLink").field("name", &self.name).finish()
    }
}

/// Upcall handle the engine uses to reach a virtual channel
#[derive(Clone)]
pub struct ChannelSink {
    channel: Weak<VirtualChannel>,
}

impl ChannelSink {
    pub(crate) fn new(channel: &Arc<VirtualChannel>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
        }
    }

    /// Hand demultiplexed payload to the channel, returning the accepted count
    pub fn deliver(&self, data: &[u8]) -> usize {
        self.channel
            .upgrade()
            .map_or(0, |channel| channel.deliver_from_engine(data))
    }

    /// Report that the channel's connection came up or went down
    pub fn set_connected(&self, connected: bool) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_framing_state_change(connected);
        }
    }
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.channel.upgrade().map(|c| c.name().to_string());
        f.debug_struct("ChannelSink").field("channel", &name).finish()
    }
}
