//! UART Mux Simulation Library
//!
//! This crate provides stand-ins for the hardware and protocol pieces the
//! mux talks to, so it can be exercised without a modem attached:
//!
//! - **SimUart**: a UART with a scriptable receive FIFO, captured output,
//!   optional loopback and synchronous interrupts
//! - **SimFramingEngine**: a toy framing engine with manual or automatic
//!   channel connect and failure injection
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use uart_mux::{MuxConfig, UartMux, UartRef};
//! use uart_mux_sim::{SimFramingEngine, SimUart};
//!
//! let engine = Arc::new(SimFramingEngine::new().with_auto_connect(true));
//! let (mux, mut worker) = UartMux::new(MuxConfig::default(), engine).unwrap();
//! let link: UartRef = Arc::new(SimUart::loopback("sim0"));
//!
//! let channel = mux.allocate().unwrap();
//! mux.attach(channel.handle(), &link, 1, None).unwrap();
//! channel.send(b"AT\r");
//! worker.run_pending();
//!
//! let mut buf = [0u8; 8];
//! assert_eq!(channel.receive(&mut buf), 3);
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod framing;
pub mod uart;

pub use framing::{encode_frames, FrameParser, SimChannel, SimFramingEngine, SimSession};
pub use uart::SimUart;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
