//! nodestats-core: Core library for nodestats
//!
//! This crate keeps short, live-reconfigurable histories of the jobs and
//! operations a database node executed, and guards memory-hungry work with
//! circuit breakers whose limits follow the same settings refresh.
//!
//! # Architecture
//!
//! ```text
//! producers → JobTracker / OperationTracker → LogStream → QueueStrategy
//!                                                 ↑
//! settings refresh → StatsService ────────────────┤
//!                        ↓                        │
//!                  ResourceGuard            ExpirySweeper (timer thread)
//! ```
//!
//! # Modules
//!
//! - `queue`: retention policies and the three strategy kinds
//! - `evicting_queue`: fixed-capacity ring behind the size-bounded strategy
//! - `log_stream`: swappable strategy holder, append/read/reconfigure
//! - `sweeper`: periodic expiry of time-bounded streams
//! - `pending`: sharded table of started-but-unfinished records
//! - `tracker`: job and operation start/finish API
//! - `breaker`: breaker configs, memory accounting, resource guard
//! - `settings`: setting keys, value parsing, refresh function
//! - `service`: everything wired behind one refresh entry point
//! - `logging`: `tracing` subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod breaker;
pub mod error;
pub mod evicting_queue;
pub mod log_stream;
pub mod logging;
pub mod pending;
pub mod queue;
pub mod records;
pub mod service;
pub mod settings;
pub mod sweeper;
pub mod tracker;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
