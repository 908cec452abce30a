//! End-to-end scenarios over the simulated UART and framing engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use uart_mux::{
    ChannelHandle, ChannelState, MuxConfig, MuxError, StateCallback, UartMux, UartRef, Worker,
};
use uart_mux_sim::framing::FLAG;
use uart_mux_sim::{encode_frames, SimFramingEngine, SimUart};

type StateLog = Arc<Mutex<Vec<(ChannelHandle, u8, bool)>>>;

fn setup(engine: SimFramingEngine, config: MuxConfig) -> (UartMux, Worker, Arc<SimFramingEngine>) {
    let engine = Arc::new(engine);
    let (mux, worker) = UartMux::new(config, engine.clone()).unwrap();
    (mux, worker, engine)
}

fn recorder() -> (StateCallback, StateLog) {
    let log: StateLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: StateCallback = Arc::new(move |handle, id, connected| {
        sink.lock().unwrap().push((handle, id, connected));
    });
    (callback, log)
}

#[test]
fn test_channel_lifecycle_over_link() {
    let (mux, mut worker, engine) = setup(SimFramingEngine::new(), MuxConfig::default());
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();
    let (callback, log) = recorder();

    let channel = mux.allocate().unwrap();
    let handle = channel.handle();
    mux.attach(handle, &link, 5, Some(callback)).unwrap();
    assert_eq!(channel.state(), ChannelState::Configured);

    let session = engine.session(0).unwrap();
    assert!(session.connect(5));
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(*log.lock().unwrap(), vec![(handle, 5, true)]);

    assert_eq!(channel.send(b"AT\r"), 3);
    assert!(!channel.tx_ready());
    worker.run_pending();
    assert!(channel.tx_ready());
    assert_eq!(uart.take_tx(), encode_frames(5, b"AT\r"));

    assert!(session.disconnect(5));
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(
        *log.lock().unwrap(),
        vec![(handle, 5, true), (handle, 5, false)]
    );

    assert_eq!(channel.send(b"AT\r"), 0);
    assert_eq!(channel.tx_queued(), 0);
    worker.run_pending();
    assert!(uart.tx_bytes().is_empty());
}

#[test]
fn test_find_by_channel_id_after_attach() {
    let (mux, _worker, _engine) = setup(SimFramingEngine::new(), MuxConfig::default());
    let link: UartRef = Arc::new(SimUart::new("L"));

    let channel = mux.allocate().unwrap();
    assert!(matches!(
        mux.find_by_channel_id(5),
        Err(MuxError::NotFound(_))
    ));

    mux.attach(channel.handle(), &link, 5, None).unwrap();
    let found = mux.find_by_channel_id(5).unwrap();
    assert_eq!(found.handle(), channel.handle());
}

#[test]
fn test_delivery_notifies_once_per_payload() {
    let (mux, mut worker, _engine) = setup(
        SimFramingEngine::new().with_auto_connect(true),
        MuxConfig::default(),
    );
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);

    let channel = mux.allocate().unwrap();
    mux.attach(channel.handle(), &link, 5, None).unwrap();
    channel.irq_callback_set(Some(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    // Zero-length frame delivers nothing
    let mut wire = vec![FLAG, 5, 0, FLAG];
    wire.extend(encode_frames(5, b"OK"));
    wire.extend(encode_frames(5, b"\r\n"));
    uart.inject(&wire);
    worker.run_pending();

    assert!(channel.rx_ready());
    assert_eq!(notified.load(Ordering::SeqCst), 2);

    let mut buf = [0u8; 16];
    assert_eq!(channel.receive(&mut buf), 4);
    assert_eq!(&buf[..4], b"OK\r\n");
    assert!(!channel.rx_ready());
}

#[test]
fn test_frames_routed_to_their_channels() {
    let (mux, mut worker, _engine) = setup(
        SimFramingEngine::new().with_auto_connect(true),
        MuxConfig::default(),
    );
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();

    let first = mux.allocate().unwrap();
    let second = mux.allocate().unwrap();
    mux.attach(first.handle(), &link, 1, None).unwrap();
    mux.attach(second.handle(), &link, 2, None).unwrap();

    let mut wire = encode_frames(2, b"two");
    wire.extend(encode_frames(9, b"nobody"));
    wire.extend(encode_frames(1, b"one"));
    uart.inject(&wire);
    worker.run_pending();

    let mut buf = [0u8; 16];
    let n = first.receive(&mut buf);
    assert_eq!(&buf[..n], b"one");
    let n = second.receive(&mut buf);
    assert_eq!(&buf[..n], b"two");
}

#[test]
fn test_loopback_echoes_every_channel() {
    let (mux, mut worker, engine) = setup(
        SimFramingEngine::new().with_auto_connect(true),
        MuxConfig::default(),
    );
    let link: UartRef = Arc::new(SimUart::loopback("L"));

    let channels: Vec<_> = (1..=3)
        .map(|id| {
            let channel = mux.allocate().unwrap();
            mux.attach(channel.handle(), &link, id, None).unwrap();
            channel
        })
        .collect();
    assert_eq!(engine.sessions_created(), 1);

    for (i, channel) in channels.iter().enumerate() {
        channel.send(format!("AT+CH{}\r", i).as_bytes());
    }
    worker.run_pending();

    let mut buf = [0u8; 32];
    for (i, channel) in channels.iter().enumerate() {
        let n = channel.receive(&mut buf);
        assert_eq!(&buf[..n], format!("AT+CH{}\r", i).as_bytes());
    }
}

#[test]
fn test_concurrent_attach_creates_one_session() {
    let (mux, _worker, engine) = setup(
        SimFramingEngine::new().with_session_delay(Duration::from_millis(20)),
        MuxConfig {
            device_count: 8,
            ..MuxConfig::default()
        },
    );
    let link: UartRef = Arc::new(SimUart::new("L"));

    let threads: Vec<_> = (0..8u8)
        .map(|id| {
            let mux = mux.clone();
            let link = Arc::clone(&link);
            thread::spawn(move || {
                let channel = mux.allocate()?;
                mux.attach(channel.handle(), &link, id + 1, None)
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap().unwrap();
    }
    assert_eq!(engine.sessions_created(), 1);
    assert_eq!(engine.session(0).unwrap().channel_ids().len(), 8);
    assert!(mux.port_for(&link).unwrap().is_ready());
}

#[test]
fn test_reattach_policy() {
    let (mux, _worker, engine) = setup(
        SimFramingEngine::new(),
        MuxConfig {
            real_device_count: 2,
            ..MuxConfig::default()
        },
    );
    let first_link: UartRef = Arc::new(SimUart::new("L"));
    let other_link: UartRef = Arc::new(SimUart::new("M"));

    // Working channel: no further attach at all
    let attached = mux.allocate().unwrap();
    mux.attach(attached.handle(), &first_link, 1, None).unwrap();
    for link in [&first_link, &other_link] {
        assert!(matches!(
            mux.attach(attached.handle(), link, 1, None),
            Err(MuxError::AlreadyAttached { .. })
        ));
    }

    // Failed channel creation: retry only on the same link
    let retried = mux.allocate().unwrap();
    engine.fail_channels(true);
    assert!(matches!(
        mux.attach(retried.handle(), &first_link, 2, None),
        Err(MuxError::OutOfMemory(_))
    ));
    assert_eq!(retried.state(), ChannelState::Configured);
    engine.fail_channels(false);
    assert!(matches!(
        mux.attach(retried.handle(), &other_link, 2, None),
        Err(MuxError::AlreadyAttached { .. })
    ));
    mux.attach(retried.handle(), &first_link, 2, None).unwrap();
    assert_eq!(mux.find_by_channel_id(2).unwrap().handle(), retried.handle());
}

#[test]
fn test_duplicate_channel_id_rejected_by_engine() {
    let (mux, _worker, _engine) = setup(SimFramingEngine::new(), MuxConfig::default());
    let link: UartRef = Arc::new(SimUart::new("L"));

    let first = mux.allocate().unwrap();
    let second = mux.allocate().unwrap();
    mux.attach(first.handle(), &link, 5, None).unwrap();

    assert!(matches!(
        mux.attach(second.handle(), &link, 5, None),
        Err(MuxError::Engine(_))
    ));
    assert_eq!(mux.find_by_channel_id(5).unwrap().handle(), first.handle());
}

#[test]
fn test_failed_session_is_retried_by_next_attach() {
    let (mux, _worker, engine) = setup(SimFramingEngine::new(), MuxConfig::default());
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();
    let channel = mux.allocate().unwrap();

    engine.fail_sessions(true);
    assert!(matches!(
        mux.attach(channel.handle(), &link, 5, None),
        Err(MuxError::OutOfMemory(_))
    ));
    assert_eq!(channel.state(), ChannelState::Allocated);
    assert!(!uart.has_handler());

    engine.fail_sessions(false);
    mux.attach(channel.handle(), &link, 5, None).unwrap();
    assert_eq!(engine.sessions_created(), 1);
    assert!(uart.has_handler());
    assert!(uart.rx_irq_enabled());
    assert!(!uart.tx_irq_enabled());
}

#[test]
fn test_failed_session_frees_port_for_other_link() {
    let (mux, _worker, engine) = setup(
        SimFramingEngine::new(),
        MuxConfig {
            real_device_count: 1,
            ..MuxConfig::default()
        },
    );
    let first_link: UartRef = Arc::new(SimUart::new("A"));
    let other_link: UartRef = Arc::new(SimUart::new("B"));

    let channel = mux.allocate().unwrap();
    engine.fail_sessions(true);
    assert!(matches!(
        mux.attach(channel.handle(), &first_link, 1, None),
        Err(MuxError::OutOfMemory(_))
    ));
    assert!(mux.port_for(&first_link).is_none());

    engine.fail_sessions(false);
    mux.attach(channel.handle(), &other_link, 1, None).unwrap();
    assert!(mux.port_for(&other_link).unwrap().is_ready());
    assert!(matches!(
        mux.attach(mux.allocate().unwrap().handle(), &first_link, 2, None),
        Err(MuxError::NotFound(_))
    ));
}

#[test]
fn test_interrupts_raised_from_two_threads_keep_every_byte() {
    let (mux, _worker, _engine) = setup(
        SimFramingEngine::new(),
        MuxConfig {
            ringbuf_size: 1 << 20,
            ..MuxConfig::default()
        },
    );
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();
    let channel = mux.allocate().unwrap();
    mux.attach(channel.handle(), &link, 5, None).unwrap();
    let port = mux.port_for(&link).unwrap();

    let chunk: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    for round in 1..=50 {
        uart.preload(&chunk);
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let uart = Arc::clone(&uart);
                thread::spawn(move || uart.raise_rx())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(uart.fifo_len(), 0);
        assert_eq!(port.rx_buffered(), round * chunk.len());
    }
}

#[test]
fn test_registry_exhaustion() {
    let (mux, _worker, _engine) = setup(
        SimFramingEngine::new(),
        MuxConfig {
            device_count: 2,
            ..MuxConfig::default()
        },
    );
    mux.allocate().unwrap();
    mux.allocate().unwrap();
    assert!(matches!(mux.allocate(), Err(MuxError::NotFound(_))));
}

#[test]
fn test_receive_ring_overflow_keeps_prefix() {
    let (mux, mut worker, _engine) = setup(
        SimFramingEngine::new().with_auto_connect(true),
        MuxConfig {
            ringbuf_size: 32,
            ..MuxConfig::default()
        },
    );
    let uart = Arc::new(SimUart::new("L"));
    let link: UartRef = uart.clone();
    let channel = mux.allocate().unwrap();
    mux.attach(channel.handle(), &link, 5, None).unwrap();

    let payload: Vec<u8> = (0..26).collect();
    uart.inject(&encode_frames(5, &payload));
    worker.run_pending();
    uart.inject(&encode_frames(5, &payload));
    worker.run_pending();

    let mut buf = [0u8; 64];
    let n = channel.receive(&mut buf);
    assert_eq!(n, 32);
    assert_eq!(&buf[..26], &payload[..]);
    assert_eq!(&buf[26..32], &payload[..6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_worker_round_trip() {
    let (mux, worker, _engine) = setup(
        SimFramingEngine::new().with_auto_connect(true),
        MuxConfig::default(),
    );
    let link: UartRef = Arc::new(SimUart::loopback("L"));
    let task = worker.spawn();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let channel = mux.allocate().unwrap();
    mux.attach(channel.handle(), &link, 7, None).unwrap();
    channel.irq_callback_set(Some(Arc::new(move |handle: ChannelHandle| {
        let _ = tx.try_send(handle);
    })));

    assert_eq!(channel.send(b"ATI\r"), 4);
    mux.flush().await.unwrap();

    let mut buf = [0u8; 16];
    let n = channel.receive(&mut buf);
    assert_eq!(&buf[..n], b"ATI\r");
    assert!(channel.tx_ready());

    // One notification for tx ready, one for the echoed payload
    let mut seen = Vec::new();
    while let Ok(handle) = rx.try_recv() {
        seen.push(handle);
    }
    assert_eq!(seen, vec![channel.handle(), channel.handle()]);

    mux.shutdown().await.unwrap();
    task.await.unwrap();
}
