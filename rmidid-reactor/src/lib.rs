//! # rmidid-reactor
//!
//! The cooperative core every rmidid session runs on:
//! - A single-threaded `poll(2)` reactor with token-owned fd watchers and
//!   timers
//! - A signal/slot bus for typed event broadcast
//!
//! Neither half is thread-safe; a process shares one reactor across all of
//! its peers and clients and drives it from one thread.

pub mod poller;
pub mod signal;

pub use poller::{FdToken, Poller, TimerToken};
pub use signal::{Signal, SignalToken};
