//! Consumer callbacks for data-ready and connection changes
//!
//! Data-ready callbacks always run on the worker, never in interrupt context.
//! State callbacks run on whichever thread the framing engine reports the
//! change from.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::channel::ChannelHandle;
use crate::lock;
use crate::worker::{WorkItem, WorkSender};

/// Called when a channel has data to read or room to write
pub type IrqCallback = Arc<dyn Fn(ChannelHandle) + Send + Sync>;

/// Called with `(channel, engine channel id, connected)` on connection changes
pub type StateCallback = Arc<dyn Fn(ChannelHandle, u8, bool) + Send + Sync>;

/// Callback slots of one virtual channel
#[derive(Default)]
pub struct Callbacks {
    irq: Mutex<Option<IrqCallback>>,
    state: Mutex<Option<StateCallback>>,
}

impl Callbacks {
    pub fn set_irq(&self, callback: Option<IrqCallback>) {
        *lock(&self.irq) = callback;
    }

    pub fn irq(&self) -> Option<IrqCallback> {
        lock(&self.irq).clone()
    }

    pub fn has_irq(&self) -> bool {
        lock(&self.irq).is_some()
    }

    pub fn set_state(&self, callback: Option<StateCallback>) {
        *lock(&self.state) = callback;
    }

    /// Invoke the state callback, if any
    ///
    /// The slot lock is released before the callback runs, so the callback
    /// may replace itself.
    pub fn notify_state(&self, handle: ChannelHandle, channel_id: u8, connected: bool) {
        let callback = lock(&self.state).clone();
        if let Some(callback) = callback {
            callback(handle, channel_id, connected);
        }
    }

    /// Invoke the data-ready callback, if any
    pub fn notify_ready(&self, handle: ChannelHandle) {
        if let Some(callback) = self.irq() {
            callback(handle);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("irq", &self.has_irq())
            .field("state", &lock(&self.state).is_some())
            .finish()
    }
}

/// Post a data-ready notification for `handle` to the worker
pub(crate) fn schedule_ready(work: &WorkSender, handle: ChannelHandle) {
    trace!("Schedule ready notification for channel {}", handle.0);
    work.submit(WorkItem::Notify(handle));
}
