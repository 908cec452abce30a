//! UART Multiplexer
//!
//! This crate exposes several virtual serial channels that share one physical
//! UART. A framing engine (supplied by the caller through the
//! [`FramingEngine`] trait) turns each channel's bytes into frames on the wire
//! and routes received frames back to the right channel.
//!
//! # Architecture
//!
//! ```text
//! interrupt -> PhysicalPort ring -> worker demux -> engine -> VirtualChannel rx ring -> callback
//! send      -> VirtualChannel tx ring -> worker send -> engine -> PhysicalPort raw write
//! ```
//!
//! - The interrupt path only copies bytes into a lock-free ring and queues
//!   a demux request. It never blocks.
//! - A single [`Worker`] runs everything that may block or call into the
//!   engine, one item at a time.
//! - Callers read and write channels without blocking; overflow drops bytes
//!   and logs the loss.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use uart_mux::{MuxConfig, UartMux};
//!
//! let (mux, worker) = UartMux::new(MuxConfig::default(), engine)?;
//! worker.spawn();
//!
//! let channel = mux.allocate()?;
//! mux.attach(channel.handle(), &link, 1, None)?;
//! channel.send(b"AT\r");
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod mux;
pub mod notify;
pub mod port;
pub mod registry;
pub mod ring_buffer;
pub mod serial_link;
pub mod uart;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelHandle, ChannelState, VirtualChannel};
pub use config::MuxConfig;
pub use engine::{ChannelSink, EngineChannel, FramingEngine, FramingSession, PortLink};
pub use error::{EngineError, MuxError};
pub use mux::UartMux;
pub use notify::{IrqCallback, StateCallback};
pub use port::{PhysicalPort, PortIndex, PortPool};
pub use registry::ChannelRegistry;
pub use ring_buffer::{Claim, RingBuffer};
pub use serial_link::{available_ports, PortInfo, SerialLink};
pub use uart::{FlowControl, IrqHandler, LineConfig, Parity, UartDevice, UartRef};
pub use worker::Worker;

/// Lock a mutex, ignoring poisoning
///
/// Every mutex in this crate guards data that stays consistent even if a
/// holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
