//! Deferred work queue
//!
//! Everything that must not run in interrupt context or on the caller's
//! thread goes through a single worker task: demultiplexing received link
//! bytes, handing queued channel bytes to the framing engine, and calling
//! data-ready callbacks. Items run one at a time in submission order.
//!
//! Demux and send requests are coalesced: while one is queued for a port or
//! channel, further requests for the same source are dropped. Notifications
//! are queued individually.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::error::MuxError;
use crate::notify::schedule_ready;
use crate::port::{PortIndex, PortPool};
use crate::registry::ChannelRegistry;

/// One unit of deferred work
#[derive(Debug)]
pub(crate) enum WorkItem {
    /// Demultiplex the receive ring of a port
    RxDemux(PortIndex),
    /// Hand the transmit ring of a channel to its engine channel
    TxSend(ChannelHandle),
    /// Call the data-ready callback of a channel
    Notify(ChannelHandle),
    /// Reply whether the queue was empty once this item was reached
    Flush(oneshot::Sender<bool>),
    /// Stop the worker
    Shutdown,
}

/// Submission side of the work queue
#[derive(Debug, Clone)]
pub(crate) struct WorkSender {
    tx: mpsc::Sender<WorkItem>,
}

impl WorkSender {
    /// Queue `item` without blocking, returning whether it was accepted
    pub(crate) fn submit(&self, item: WorkItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!("Work queue full, drop {:?}", item);
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                debug!("Worker stopped, drop {:?}", item);
                false
            }
        }
    }

    /// Queue `item`, waiting for room
    pub(crate) async fn send(&self, item: WorkItem) -> Result<(), MuxError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| MuxError::Unavailable("worker stopped".to_string()))
    }
}

/// Create a work queue holding up to `depth` items
pub(crate) fn work_queue(depth: usize) -> (WorkSender, mpsc::Receiver<WorkItem>) {
    let (tx, rx) = mpsc::channel(depth);
    (WorkSender { tx }, rx)
}

/// Submit `item` unless one is already pending for the same source
///
/// The task clears `pending` before it starts draining, so data arriving
/// during the drain schedules a fresh run.
pub(crate) fn submit_once(work: &WorkSender, pending: &AtomicBool, item: WorkItem) {
    if pending.swap(true, Ordering::AcqRel) {
        return;
    }
    if !work.submit(item) {
        pending.store(false, Ordering::Release);
    }
}

/// The single worker of a mux
///
/// Work items block: link writes wait for the transmitter, and engines and
/// callbacks may take their time. [`Worker::spawn`] therefore runs the worker
/// on tokio's blocking pool; [`Worker::run`] suits a dedicated thread, and
/// [`Worker::run_pending`] drives it by hand.
pub struct Worker {
    rx: mpsc::Receiver<WorkItem>,
    ports: Arc<PortPool>,
    registry: Arc<ChannelRegistry>,
    verbose: bool,
}

impl Worker {
    pub(crate) fn new(
        rx: mpsc::Receiver<WorkItem>,
        ports: Arc<PortPool>,
        registry: Arc<ChannelRegistry>,
        verbose: bool,
    ) -> Self {
        Self {
            rx,
            ports,
            registry,
            verbose,
        }
    }

    /// Run the worker on the blocking pool of the current tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Process work until shut down or every sender is gone
    ///
    /// Blocks the calling thread. Must not be called from async context.
    pub fn run(mut self) {
        info!("Mux worker started");
        while let Some(item) = self.rx.blocking_recv() {
            if !self.process(item) {
                break;
            }
        }
        info!("Mux worker stopped");
    }

    /// Process everything currently queued, returning the number of items run
    ///
    /// Stops early on a shutdown request.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(item) = self.rx.try_recv() {
            count += 1;
            if !self.process(item) {
                break;
            }
        }
        count
    }

    fn process(&self, item: WorkItem) -> bool {
        match item {
            WorkItem::RxDemux(index) => self.rx_demux(index),
            WorkItem::TxSend(handle) => self.tx_send(handle),
            WorkItem::Notify(handle) => self.notify(handle),
            WorkItem::Flush(reply) => {
                let _ = reply.send(self.rx.is_empty());
            }
            WorkItem::Shutdown => return false,
        }
        true
    }

    fn rx_demux(&self, index: PortIndex) {
        let Some(port) = self.ports.get(index) else {
            warn!("Demux requested for unknown port {}", index.0);
            return;
        };
        port.rx_pending.store(false, Ordering::Release);

        let Some(session) = port.session() else {
            debug!("No framing session on {}", port.name());
            return;
        };

        loop {
            let claim = port.rx.claim();
            if claim.is_empty() {
                break;
            }
            if self.verbose {
                debug!("RECV muxed {}: {:02X?}", port.name(), &claim[..]);
            }
            session.demultiplex(&claim);
            claim.release_all();
        }
    }

    fn tx_send(&self, handle: ChannelHandle) {
        let Ok(channel) = self.registry.get(handle) else {
            warn!("Send requested for unknown channel {}", handle.0);
            return;
        };
        channel.tx_pending.store(false, Ordering::Release);

        let engine = channel.engine_channel();
        loop {
            let claim = channel.tx.claim();
            if claim.is_empty() {
                break;
            }
            match &engine {
                Some(engine) => {
                    if self.verbose {
                        debug!("SEND {}: {:02X?}", channel.name(), &claim[..]);
                    }
                    if let Err(e) = engine.send(&claim) {
                        warn!(
                            "Cannot send {} bytes on {}: {}",
                            claim.len(),
                            channel.name(),
                            e
                        );
                    }
                }
                None => warn!(
                    "{} has no engine channel, drop {} bytes",
                    channel.name(),
                    claim.len()
                ),
            }
            claim.release_all();
        }

        channel.set_tx_ready(true);
        if channel.tx_enabled() && channel.callbacks.has_irq() {
            schedule_ready(&channel.work, handle);
        }
    }

    fn notify(&self, handle: ChannelHandle) {
        match self.registry.get(handle) {
            Ok(channel) => channel.callbacks.notify_ready(handle),
            Err(_) => warn!("Notify requested for unknown channel {}", handle.0),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("ports", &self.ports.len())
            .field("channels", &self.registry.len())
            .field("queued", &self.rx.len())
            .finish()
    }
}
