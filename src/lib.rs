//! A policy delegation daemon for mail transfer agents.
//!
//! The daemon speaks the line oriented policy delegation protocol on a TCP socket,
//! reassembles the attribute set describing each SMTP transaction, and mirrors a
//! signed summary of every new transaction to one or more UDP collectors. It never
//! takes a policy decision itself: every request is answered with `action=DUNNO`.
//!
//! ```text
//! TCP → Listener → Session → Assembler → Encoder → FanOut → UDP collectors
//! ```

pub mod assembler;
pub mod attributes;
pub mod config;
pub mod controller;
pub mod epoch;
pub mod error;
pub mod fanout;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod record;
pub mod session;
pub mod supervisor;
pub mod traits;
pub mod worker;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
