//! Agent lifecycle states
//!
//! ```text
//! STARTING -> IDLE <-> BUSY
//! IDLE | BUSY -> ERROR          (stale heartbeat)
//! ERROR -> IDLE | BUSY          (heartbeat resumes)
//! any live state -> STOPPING -> STOPPED
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Idle,
    Busy,
    Error,
    Stopping,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Error => "error",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Starting, Idle | Error | Stopping)
                | (Idle, Busy | Error | Stopping)
                | (Busy, Idle | Error | Stopping)
                | (Error, Idle | Busy | Stopping)
                | (Stopping, Stopped)
        )
    }

    /// States in which the agent accepts new task assignments
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }

    /// States the health sweep inspects
    pub fn is_monitored(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;

    const ALL: [AgentState; 6] = [Starting, Idle, Busy, Error, Stopping, Stopped];

    #[test]
    fn test_stopped_is_terminal() {
        for next in ALL {
            assert!(!Stopped.can_transition_to(next));
        }
    }

    #[test]
    fn test_every_live_state_can_stop() {
        for state in [Starting, Idle, Busy, Error] {
            assert!(state.can_transition_to(Stopping), "{state} cannot stop");
        }
        assert!(!Stopping.can_transition_to(Stopping));
    }

    #[test]
    fn test_error_recovery() {
        assert!(Error.can_transition_to(Idle));
        assert!(Error.can_transition_to(Busy));
        assert!(!Starting.can_transition_to(Busy));
    }

    #[test]
    fn test_assignment_and_monitoring_states() {
        let accepting: Vec<_> = ALL.into_iter().filter(|s| s.accepts_tasks()).collect();
        assert_eq!(accepting, vec![Idle, Busy]);
        assert!(!Error.is_monitored());
        assert!(!Starting.is_monitored());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_value(Stopping).unwrap(), "stopping");
        let parsed: AgentState = serde_json::from_value(serde_json::json!("busy")).unwrap();
        assert_eq!(parsed, Busy);
    }
}
