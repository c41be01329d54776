//! Protocol types for the coordinator message channel
//!
//! Closed enumerations (capabilities, task kinds, event types), the task and
//! event envelopes, and the topic layout used on the broker.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
