//! Test support utilities for end-to-end testing
//!
//! Starts a complete relay on a random port together with UDP collectors that
//! record every datagram they receive.

pub mod collector;
pub mod harness;

pub use collector::Collector;
pub use harness::{PolicyClient, RelayHarness};
