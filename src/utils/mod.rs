//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;
mod serverset;
mod timer;

pub use bitmap::SlotBitmap;
pub use error::FedError;
pub use print::{logger_init, ME};
pub use serverset::{ServerSet, SlotId, MAX_SLOTS};
pub use timer::Timer;

pub(crate) use safetcp::{
    safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_timeout,
};
