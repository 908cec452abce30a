//! Fixed set of virtual channels

use std::sync::Arc;

use tracing::debug;

use crate::channel::{ChannelHandle, VirtualChannel};
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::worker::WorkSender;

/// Every virtual channel a mux can hand out
///
/// The set is sized at construction. Channels are claimed by [`allocate`]
/// and never returned.
///
/// [`allocate`]: ChannelRegistry::allocate
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: Box<[Arc<VirtualChannel>]>,
}

impl ChannelRegistry {
    pub(crate) fn new(config: &MuxConfig, work: &WorkSender) -> Self {
        Self {
            channels: (0..config.device_count)
                .map(|i| Arc::new(VirtualChannel::new(ChannelHandle(i), config, work.clone())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Claim the first channel not yet in use
    pub fn allocate(&self) -> Result<Arc<VirtualChannel>, MuxError> {
        let channel = self
            .channels
            .iter()
            .find(|channel| channel.claim())
            .ok_or_else(|| {
                MuxError::NotFound(format!("all {} channels in use", self.channels.len()))
            })?;
        debug!("Allocated {}", channel.name());
        Ok(Arc::clone(channel))
    }

    /// In-use channel whose engine channel has identifier `channel_id`
    pub fn find_by_channel_id(&self, channel_id: u8) -> Result<Arc<VirtualChannel>, MuxError> {
        self.channels
            .iter()
            .find(|channel| channel.is_in_use() && channel.engine_id() == Some(channel_id))
            .cloned()
            .ok_or_else(|| MuxError::NotFound(format!("no channel with id {}", channel_id)))
    }

    /// Channel at `handle`
    pub fn get(&self, handle: ChannelHandle) -> Result<&Arc<VirtualChannel>, MuxError> {
        self.channels
            .get(handle.0)
            .ok_or_else(|| MuxError::InvalidArgument(format!("no channel {}", handle.0)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtualChannel>> {
        self.channels.iter()
    }
}
