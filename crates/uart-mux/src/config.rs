//! Multiplexer configuration

use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Sizing and diagnostics knobs for a multiplexer context
///
/// Pool sizes are fixed for the lifetime of a [`UartMux`](crate::UartMux);
/// nothing grows after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Number of physical UARTs that may carry muxed traffic
    pub real_device_count: usize,
    /// Number of virtual channels in the pool
    pub device_count: usize,
    /// Capacity of every ring buffer in bytes
    pub ringbuf_size: usize,
    /// Maximum number of queued worker items
    pub work_queue_depth: usize,
    /// Prefix for virtual channel names (`GSM_0`, `GSM_1`, ...)
    pub device_name: String,
    /// Log every payload crossing the mux as hex
    pub verbose_debug: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            real_device_count: 1,
            device_count: 4,
            ringbuf_size: 256,
            work_queue_depth: 64,
            device_name: "GSM".to_string(),
            verbose_debug: false,
        }
    }
}

impl MuxConfig {
    /// Check that every pool and buffer has a usable size
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.device_count == 0 {
            return Err(MuxError::InvalidArgument(
                "device_count tells number of channels to create and must be > 0".into(),
            ));
        }
        if self.real_device_count == 0 {
            return Err(MuxError::InvalidArgument(
                "real_device_count must be > 0".into(),
            ));
        }
        if self.ringbuf_size == 0 {
            return Err(MuxError::InvalidArgument("ringbuf_size must be > 0".into()));
        }
        if self.work_queue_depth == 0 {
            return Err(MuxError::InvalidArgument(
                "work_queue_depth must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Name of the virtual channel at `index`
    pub fn channel_name(&self, index: usize) -> String {
        format!("{}_{}", self.device_name, index)
    }
}
