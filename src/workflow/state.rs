//! Workflow Run State
//!
//! Lifecycle of a workflow run:
//!
//! ```text
//! PENDING -> RUNNING -> SUCCESS | ERROR | CANCELED
//! ```
//!
//! PENDING and RUNNING are active states; the other three are terminal.
//! Transitions return a new state value and reject any move out of a
//! terminal state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

/// Default message attached to a canceled run.
pub const CANCELED_MESSAGE: &str = "canceled at user request";

/// State of a workflow run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Pending {
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    Running {
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
    },
    Canceled {
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
        #[serde(rename = "finishedAt")]
        stopped_at: DateTime<Utc>,
        #[serde(default)]
        messages: Vec<String>,
    },
    Error {
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
        #[serde(rename = "finishedAt")]
        stopped_at: DateTime<Utc>,
        #[serde(default)]
        messages: Vec<String>,
    },
    Success {
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
        #[serde(rename = "finishedAt")]
        finished_at: DateTime<Utc>,
        #[serde(default)]
        files: Vec<String>,
    },
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::pending()
    }
}

impl WorkflowState {
    /// Creates a pending state stamped with the current time.
    pub fn pending() -> Self {
        Self::Pending {
            created_at: Utc::now(),
        }
    }

    /// Short type name of the state.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "PENDING",
            Self::Running { .. } => "RUNNING",
            Self::Canceled { .. } => "CANCELED",
            Self::Error { .. } => "ERROR",
            Self::Success { .. } => "SUCCESS",
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Pending { created_at }
            | Self::Running { created_at, .. }
            | Self::Canceled { created_at, .. }
            | Self::Error { created_at, .. }
            | Self::Success { created_at, .. } => *created_at,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending { .. } => None,
            Self::Running { started_at, .. }
            | Self::Canceled { started_at, .. }
            | Self::Error { started_at, .. }
            | Self::Success { started_at, .. } => Some(*started_at),
        }
    }

    /// Time at which the run reached a terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Canceled { stopped_at, .. } | Self::Error { stopped_at, .. } => Some(*stopped_at),
            Self::Success { finished_at, .. } => Some(*finished_at),
            _ => None,
        }
    }

    /// Error or cancel messages, empty for other states.
    pub fn messages(&self) -> &[String] {
        match self {
            Self::Canceled { messages, .. } | Self::Error { messages, .. } => messages,
            _ => &[],
        }
    }

    /// Output files of a successful run, empty for other states.
    pub fn files(&self) -> &[String] {
        match self {
            Self::Success { files, .. } => files,
            _ => &[],
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// True for PENDING and RUNNING.
    pub fn is_active(&self) -> bool {
        self.is_pending() || self.is_running()
    }

    /// Moves a pending run into the running state.
    pub fn start(&self) -> Result<Self> {
        match self {
            Self::Pending { created_at } => Ok(Self::Running {
                created_at: *created_at,
                started_at: Utc::now(),
            }),
            _ => Err(self.invalid("start")),
        }
    }

    /// Moves an active run into the error state.
    pub fn error(&self, messages: Vec<String>) -> Result<Self> {
        let (created_at, started_at, stopped_at) = self.stop_times("error")?;
        Ok(Self::Error {
            created_at,
            started_at,
            stopped_at,
            messages,
        })
    }

    /// Moves an active run into the canceled state.
    ///
    /// Uses [`CANCELED_MESSAGE`] when no messages are given.
    pub fn cancel(&self, messages: Option<Vec<String>>) -> Result<Self> {
        let (created_at, started_at, stopped_at) = self.stop_times("cancel")?;
        Ok(Self::Canceled {
            created_at,
            started_at,
            stopped_at,
            messages: messages.unwrap_or_else(|| vec![CANCELED_MESSAGE.to_string()]),
        })
    }

    /// Moves an active run into the success state.
    ///
    /// A pending run that succeeds directly is considered started at the
    /// time it was created.
    pub fn success(&self, files: Vec<String>) -> Result<Self> {
        let (created_at, started_at) = match self {
            Self::Pending { created_at } => (*created_at, *created_at),
            Self::Running {
                created_at,
                started_at,
            } => (*created_at, *started_at),
            _ => return Err(self.invalid("success")),
        };
        Ok(Self::Success {
            created_at,
            started_at,
            finished_at: Utc::now(),
            files,
        })
    }

    fn stop_times(
        &self,
        transition: &str,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)> {
        let now = Utc::now();
        match self {
            Self::Pending { created_at } => Ok((*created_at, now, now)),
            Self::Running {
                created_at,
                started_at,
            } => Ok((*created_at, *started_at, now)),
            _ => Err(self.invalid(transition)),
        }
    }

    fn invalid(&self, transition: &str) -> FlowError {
        FlowError::InvalidState(format!("cannot {} a {} run", transition, self.type_name()))
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Serializes a state into its JSON document.
pub fn serialize_state(state: &WorkflowState) -> Result<Value> {
    Ok(serde_json::to_value(state)?)
}

/// Reconstructs a state from its JSON document.
pub fn deserialize_state(doc: Value) -> Result<WorkflowState> {
    Ok(serde_json::from_value(doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_creation() {
        let state = WorkflowState::pending();
        assert!(state.is_pending());
        assert!(state.is_active());
        assert_eq!(state.started_at(), None);
        assert_eq!(state.to_string(), "PENDING");
    }

    #[test]
    fn test_run_lifecycle() {
        let pending = WorkflowState::pending();
        let running = pending.start().unwrap();
        assert!(running.is_running());
        assert_eq!(running.created_at(), pending.created_at());

        let success = running.success(vec!["results/out.txt".into()]).unwrap();
        assert!(success.is_success());
        assert!(!success.is_active());
        assert_eq!(success.started_at(), running.started_at());
        assert_eq!(success.files(), &["results/out.txt".to_string()]);
    }

    #[test]
    fn test_pending_shortcuts() {
        let pending = WorkflowState::pending();

        let success = pending.success(vec![]).unwrap();
        assert_eq!(success.started_at(), Some(pending.created_at()));

        let error = pending.error(vec!["bad".into()]).unwrap();
        assert!(error.is_error());
        assert_eq!(error.started_at(), error.finished_at());
        assert_eq!(error.messages(), &["bad".to_string()]);
    }

    #[test]
    fn test_cancel_default_message() {
        let state = WorkflowState::pending().start().unwrap().cancel(None).unwrap();
        assert!(state.is_canceled());
        assert_eq!(state.messages(), &[CANCELED_MESSAGE.to_string()]);
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let error = WorkflowState::pending().error(vec![]).unwrap();
        assert!(matches!(error.start(), Err(FlowError::InvalidState(_))));
        assert!(error.success(vec![]).is_err());
        assert!(error.cancel(None).is_err());

        let running = WorkflowState::pending().start().unwrap();
        assert!(running.start().is_err());
    }

    #[test]
    fn test_state_serialization_labels() {
        let state = WorkflowState::pending()
            .start()
            .unwrap()
            .error(vec!["e1".into(), "e2".into()])
            .unwrap();

        let doc = serialize_state(&state).unwrap();
        assert_eq!(doc["type"], "ERROR");
        assert!(doc.get("createdAt").is_some());
        assert!(doc.get("startedAt").is_some());
        assert!(doc.get("finishedAt").is_some());
        assert_eq!(doc["messages"][1], "e2");

        let loaded = deserialize_state(doc).unwrap();
        assert_eq!(loaded, state);
    }
}
