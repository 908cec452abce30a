//! UART Mux Demo
//!
//! Opens a few virtual channels over one link, sends a line on each and
//! prints what comes back. Without `--port` the link is a simulated loopback
//! UART, so every channel receives its own line.

mod settings;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};
use uart_mux::{available_ports, ChannelHandle, SerialLink, UartMux, UartRef};
use uart_mux_sim::{SimFramingEngine, SimUart};

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "uart-mux-demo", version, about = "Virtual serial channels over one link")]
struct Cli {
    /// Serial port to mux over (simulated loopback when omitted)
    #[arg(long, value_name = "PATH")]
    port: Option<String>,

    /// JSON settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of channels to open
    #[arg(long, default_value_t = 2)]
    channels: u8,

    /// Line sent on every channel
    #[arg(long, default_value = "AT")]
    line: String,

    /// How long to wait for replies, in milliseconds
    #[arg(long, default_value_t = 1000)]
    wait_ms: u64,

    /// Log every payload as hex
    #[arg(long)]
    verbose: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "uart_mux=info,uart_mux_sim=info,uart_mux_demo=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        for port in available_ports()? {
            println!(
                "{}\t{}",
                port.name,
                port.product.as_deref().unwrap_or("Unknown")
            );
        }
        return Ok(());
    }

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.mux.verbose_debug |= cli.verbose;

    let link: UartRef = match &cli.port {
        Some(path) => SerialLink::open(path, &settings.line)
            .with_context(|| format!("Failed to open {}", path))?,
        None => Arc::new(SimUart::loopback("sim0")),
    };

    let engine = Arc::new(SimFramingEngine::new().with_auto_connect(true));
    let (mux, worker) = UartMux::new(settings.mux.clone(), engine)?;
    let worker_task = worker.spawn();

    let (ready_tx, mut ready_rx) = mpsc::channel::<ChannelHandle>(64);
    let mut expected = HashMap::new();

    for id in 1..=cli.channels {
        let channel = mux.allocate()?;
        let ready_tx = ready_tx.clone();
        channel.irq_callback_set(Some(Arc::new(move |handle: ChannelHandle| {
            let _ = ready_tx.try_send(handle);
        })));
        mux.attach(
            channel.handle(),
            &link,
            id,
            Some(Arc::new(|handle: ChannelHandle, id: u8, connected: bool| {
                info!("Channel {} (id {}) connected: {}", handle.0, id, connected);
            })),
        )?;

        let line = format!("{}+CH{}\r", cli.line, id);
        let queued = channel.send(line.as_bytes());
        if queued < line.len() {
            warn!("{} queued {} of {} bytes", channel.name(), queued, line.len());
        }
        expected.insert(channel.handle(), queued);
    }
    drop(ready_tx);

    let mut received: HashMap<ChannelHandle, Vec<u8>> = HashMap::new();
    let deadline = Duration::from_millis(cli.wait_ms);
    while !expected
        .iter()
        .all(|(handle, len)| received.get(handle).map_or(0, Vec::len) >= *len)
    {
        let Ok(Some(handle)) = timeout(deadline, ready_rx.recv()).await else {
            warn!("Timed out waiting for replies");
            break;
        };
        let channel = mux.channel(handle)?;
        let mut buf = [0u8; 64];
        loop {
            let n = channel.receive(&mut buf);
            if n == 0 {
                break;
            }
            received.entry(handle).or_default().extend_from_slice(&buf[..n]);
        }
    }

    for channel in mux.registry().iter().filter(|c| c.is_in_use()) {
        let data = received.remove(&channel.handle()).unwrap_or_default();
        println!(
            "{} [{}] <- {:?}",
            channel.name(),
            channel.state(),
            String::from_utf8_lossy(&data)
        );
    }

    mux.shutdown().await?;
    worker_task.await?;
    Ok(())
}
