//! Test doubles for the message channel and its handlers
//!
//! Public so integration tests can drive the coordinator without a broker.

pub mod mocks;

pub use mocks::*;
