//! Console logging setup for the command-line binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to whoever embeds it.

mod tracing_init;

pub use tracing_init::*;
