//! Agent lifecycle and registry
//!
//! An agent is a worker unit with one capability. The coordinator tracks its
//! state, the tasks it holds and its heartbeats; the agent's work itself
//! happens in a worker process (see [`crate::worker`]).

pub mod registry;
pub mod state;

pub use registry::{
    AgentCounts, AgentRecord, AgentRegistry, StopOutcome, TaskOutcome, TaskRelease,
    AGENT_FAILURE_ERROR, AGENT_STOPPED_ERROR, HEARTBEAT_TIMEOUT_ERROR,
};
pub use state::AgentState;
