//! Multiplexer context
//!
//! [`UartMux`] owns the port pool, the channel registry and the submission
//! side of the work queue. It is cheap to clone; clones share all state.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::info;

use crate::channel::{ChannelHandle, VirtualChannel};
use crate::config::MuxConfig;
use crate::engine::FramingEngine;
use crate::error::MuxError;
use crate::notify::StateCallback;
use crate::port::{PhysicalPort, PortPool};
use crate::registry::ChannelRegistry;
use crate::uart::UartRef;
use crate::worker::{work_queue, WorkItem, WorkSender, Worker};

/// Virtual serial channels over a fixed set of physical links
#[derive(Clone)]
pub struct UartMux {
    config: Arc<MuxConfig>,
    engine: Arc<dyn FramingEngine>,
    ports: Arc<PortPool>,
    registry: Arc<ChannelRegistry>,
    work: WorkSender,
}

impl UartMux {
    /// Build a mux and the worker that must run for it to make progress
    pub fn new(
        config: MuxConfig,
        engine: Arc<dyn FramingEngine>,
    ) -> Result<(Self, Worker), MuxError> {
        config.validate()?;

        let (work, rx) = work_queue(config.work_queue_depth);
        let ports = Arc::new(PortPool::new(
            config.real_device_count,
            config.ringbuf_size,
            &work,
            config.verbose_debug,
        ));
        let registry = Arc::new(ChannelRegistry::new(&config, &work));
        let worker = Worker::new(
            rx,
            Arc::clone(&ports),
            Arc::clone(&registry),
            config.verbose_debug,
        );

        info!(
            "UART mux with {} channels over {} links",
            config.device_count, config.real_device_count
        );

        let mux = Self {
            config: Arc::new(config),
            engine,
            ports,
            registry,
            work,
        };
        Ok((mux, worker))
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Claim an unused virtual channel
    pub fn allocate(&self) -> Result<Arc<VirtualChannel>, MuxError> {
        self.registry.allocate()
    }

    /// Attached channel with engine channel id `channel_id`
    pub fn find_by_channel_id(&self, channel_id: u8) -> Result<Arc<VirtualChannel>, MuxError> {
        self.registry.find_by_channel_id(channel_id)
    }

    /// Channel at `handle`
    pub fn channel(&self, handle: ChannelHandle) -> Result<Arc<VirtualChannel>, MuxError> {
        self.registry.get(handle).cloned()
    }

    /// Bind an allocated channel to `link` as engine channel `channel_id`
    ///
    /// The first attach on a link creates its framing session. `state_callback`
    /// is called whenever the engine reports the channel connected or
    /// disconnected.
    pub fn attach(
        &self,
        handle: ChannelHandle,
        link: &UartRef,
        channel_id: u8,
        state_callback: Option<StateCallback>,
    ) -> Result<(), MuxError> {
        let channel = self.registry.get(handle)?;
        if !channel.is_in_use() {
            return Err(MuxError::InvalidArgument(format!(
                "{} is not allocated",
                channel.name()
            )));
        }
        channel.attach(
            &self.ports,
            self.engine.as_ref(),
            link,
            channel_id,
            state_callback,
        )
    }

    /// Port bound to `link`, if any
    pub fn port_for(&self, link: &UartRef) -> Option<Arc<PhysicalPort>> {
        self.ports.find(link).cloned()
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Wait until the worker has run everything queued so far
    ///
    /// Work queued by the drained items themselves is waited for as well.
    pub async fn flush(&self) -> Result<(), MuxError> {
        loop {
            let (tx, rx) = oneshot::channel();
            self.work.send(WorkItem::Flush(tx)).await?;
            match rx.await {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(_) => return Err(MuxError::Unavailable("worker stopped".to_string())),
            }
        }
    }

    /// Ask the worker to stop after the items already queued
    pub async fn shutdown(&self) -> Result<(), MuxError> {
        self.work.send(WorkItem::Shutdown).await
    }
}

impl std::fmt::Debug for UartMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartMux")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::test_support::{CountingEngine, NullUart};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn mux(config: MuxConfig) -> (UartMux, Worker, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine::default());
        let (mux, worker) = UartMux::new(config, engine.clone()).unwrap();
        (mux, worker, engine)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MuxConfig {
            device_count: 0,
            ..MuxConfig::default()
        };
        let engine = Arc::new(CountingEngine::default());
        assert!(matches!(
            UartMux::new(config, engine),
            Err(MuxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_attach_requires_allocation() {
        let (mux, _worker, _engine) = mux(MuxConfig::default());
        let link: UartRef = Arc::new(NullUart::new("uart0"));

        assert!(matches!(
            mux.attach(ChannelHandle(0), &link, 5, None),
            Err(MuxError::InvalidArgument(_))
        ));
        assert!(matches!(
            mux.attach(ChannelHandle(9), &link, 5, None),
            Err(MuxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_channels_share_one_session_per_link() {
        let (mux, _worker, engine) = mux(MuxConfig::default());
        let link: UartRef = Arc::new(NullUart::new("uart0"));

        for id in 1..=3 {
            let channel = mux.allocate().unwrap();
            mux.attach(channel.handle(), &link, id, None).unwrap();
        }

        assert_eq!(engine.sessions_created(), 1);
        assert!(mux.port_for(&link).unwrap().is_ready());
    }

    #[test]
    fn test_second_link_needs_free_port() {
        let (mux, _worker, _engine) = mux(MuxConfig::default());
        let a: UartRef = Arc::new(NullUart::new("uart0"));
        let b: UartRef = Arc::new(NullUart::new("uart1"));

        let first = mux.allocate().unwrap();
        mux.attach(first.handle(), &a, 1, None).unwrap();

        let second = mux.allocate().unwrap();
        assert!(matches!(
            mux.attach(second.handle(), &b, 2, None),
            Err(MuxError::NotFound(_))
        ));
        assert_eq!(second.state(), ChannelState::Allocated);
    }

    #[test]
    fn test_worker_sends_queued_bytes() {
        let (mux, mut worker, _engine) = mux(MuxConfig::default());
        let uart = Arc::new(NullUart::new("uart0"));
        let link: UartRef = uart.clone();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);

        let channel = mux.allocate().unwrap();
        mux.attach(channel.handle(), &link, 5, None).unwrap();
        channel.irq_callback_set(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        channel.on_framing_state_change(true);

        assert_eq!(channel.send(b"AT\r"), 3);
        assert!(!channel.tx_ready());

        // TxSend, then the Notify it posts
        assert_eq!(worker.run_pending(), 2);
        assert_eq!(uart.written(), b"AT\r");
        assert!(channel.tx_ready());
        assert_eq!(channel.tx_queued(), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_sends_wrapped_ring() {
        let config = MuxConfig {
            ringbuf_size: 8,
            ..MuxConfig::default()
        };
        let (mux, mut worker, _engine) = mux(config);
        let uart = Arc::new(NullUart::new("uart0"));
        let link: UartRef = uart.clone();

        let channel = mux.allocate().unwrap();
        mux.attach(channel.handle(), &link, 5, None).unwrap();
        channel.on_framing_state_change(true);

        channel.send(b"12345");
        worker.run_pending();
        // Wraps past the end of the 8 byte ring
        channel.send(b"6789ab");
        worker.run_pending();

        assert_eq!(uart.written(), b"123456789ab");
        assert!(channel.tx_ready());
    }

    #[test]
    fn test_interrupt_to_channel_receive() {
        let (mux, mut worker, engine) = mux(MuxConfig::default());
        let uart = Arc::new(NullUart::new("uart0"));
        let link: UartRef = uart.clone();
        let ready = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ready);

        let channel = mux.allocate().unwrap();
        mux.attach(channel.handle(), &link, 5, None).unwrap();
        channel.irq_callback_set(Some(Arc::new(move |handle| {
            sink.lock().unwrap().push(handle);
        })));

        uart.push_rx(b"OK\r\n");
        uart.fire();
        // RxDemux, then the Notify posted by delivery
        assert_eq!(worker.run_pending(), 2);

        assert_eq!(engine.last_session().unwrap().demuxed(), b"OK\r\n");
        assert_eq!(*ready.lock().unwrap(), vec![channel.handle()]);
        let mut buf = [0u8; 16];
        assert_eq!(channel.receive(&mut buf), 4);
        assert_eq!(&buf[..4], b"OK\r\n");
        assert!(!channel.rx_ready());
    }

    #[test]
    fn test_worker_runs_on_its_own_thread() {
        let (mux, worker, _engine) = mux(MuxConfig::default());
        let uart = Arc::new(NullUart::new("uart0"));
        let link: UartRef = uart.clone();

        let channel = mux.allocate().unwrap();
        mux.attach(channel.handle(), &link, 5, None).unwrap();
        channel.on_framing_state_change(true);
        channel.send(b"ATZ\r");
        assert!(mux.work.submit(WorkItem::Shutdown));

        std::thread::spawn(move || worker.run()).join().unwrap();
        assert_eq!(uart.written(), b"ATZ\r");
        assert!(channel.tx_ready());
    }

    #[tokio::test]
    async fn test_flush_and_shutdown() {
        let (mux, worker, _engine) = mux(MuxConfig::default());
        let uart = Arc::new(NullUart::new("uart0"));
        let link: UartRef = uart.clone();
        let task = worker.spawn();

        let channel = mux.allocate().unwrap();
        mux.attach(channel.handle(), &link, 5, None).unwrap();
        channel.on_framing_state_change(true);
        channel.send(b"ATZ\r");

        mux.flush().await.unwrap();
        assert_eq!(uart.written(), b"ATZ\r");

        mux.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            mux.flush().await,
            Err(MuxError::Unavailable(_))
        ));
    }
}
