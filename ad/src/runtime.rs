//! Derived per-agent runtime state
//!
//! Runtime state is a view over the ledger plus the definition's flags. It
//! is recomputed on every read and never stored, so it cannot drift from the
//! persisted records after a restart.

use serde::Serialize;

use runledger::{AgentDef, ExecutionStatus};

/// The operator-visible state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// No running record, enabled, not paused
    Idle,
    /// A running execution record exists
    Running,
    /// Operator-set; the scheduler skips it, manual triggers still work
    Paused,
    /// Most recent terminal record failed, no success since
    Error,
    /// enabled=false; rejected on every admission path
    Disabled,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Compute the runtime state from the definition and the status of the
/// agent's most recent execution record
///
/// A running record wins over everything: pausing or disabling an agent
/// never cancels an in-flight execution, it only prevents new ones.
pub fn derive_state(def: &AgentDef, last_status: Option<ExecutionStatus>) -> RuntimeState {
    if last_status == Some(ExecutionStatus::Running) {
        return RuntimeState::Running;
    }
    if !def.enabled {
        return RuntimeState::Disabled;
    }
    if def.paused {
        return RuntimeState::Paused;
    }
    if last_status == Some(ExecutionStatus::Failed) {
        return RuntimeState::Error;
    }
    RuntimeState::Idle
}
