//! Run Handles and Descriptors
//!
//! A run handle identifies a run and carries its current state; a run
//! descriptor is the serialized view of a run handed to persistence layers.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::WorkflowState;

/// A workflow run known to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub state: WorkflowState,
}

impl RunHandle {
    /// Creates a pending run with the given identifier.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: WorkflowState::pending(),
        }
    }

    /// Creates a pending run with a random identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().simple().to_string())
    }

    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.state = state;
        self
    }
}

/// Resource file of a finished run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Serialized view of a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunDescriptor {
    pub id: String,
    pub state: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileDescriptor>>,
}

impl RunDescriptor {
    /// Builds the descriptor for run `run_id` in `state`.
    pub fn new(run_id: &str, state: &WorkflowState) -> Self {
        let messages = (state.is_error() || state.is_canceled()).then(|| state.messages().to_vec());
        let files = state.is_success().then(|| {
            state
                .files()
                .iter()
                .map(|name| FileDescriptor {
                    id: name.clone(),
                    name: name.clone(),
                    mime_type: guess_mime_type(name).to_string(),
                })
                .collect()
        });
        Self {
            id: run_id.to_string(),
            state: state.type_name().to_string(),
            created_at: state.created_at(),
            started_at: state.started_at(),
            finished_at: state.finished_at(),
            messages,
            files,
        }
    }
}

impl From<&RunHandle> for RunDescriptor {
    fn from(run: &RunHandle) -> Self {
        Self::new(&run.run_id, &run.state)
    }
}

/// Guesses a file's MIME type from its extension.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "yaml" | "yml" => "application/x-yaml",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_run_ids_are_unique() {
        let r1 = RunHandle::generate();
        let r2 = RunHandle::generate();
        assert_ne!(r1.run_id, r2.run_id);
        assert!(r1.state.is_pending());
    }

    #[test]
    fn test_descriptor_for_success() {
        let state = WorkflowState::pending()
            .start()
            .unwrap()
            .success(vec!["results/analytics.json".into(), "results/plot.png".into()])
            .unwrap();
        let doc = serde_json::to_value(RunDescriptor::new("r1", &state)).unwrap();

        assert_eq!(doc["id"], "r1");
        assert_eq!(doc["state"], "SUCCESS");
        assert!(doc.get("startedAt").is_some());
        assert!(doc.get("messages").is_none());
        assert_eq!(doc["files"][0]["id"], "results/analytics.json");
        assert_eq!(doc["files"][0]["mimeType"], "application/json");
        assert_eq!(doc["files"][1]["mimeType"], "image/png");
    }

    #[test]
    fn test_descriptor_for_pending_and_error() {
        let run = RunHandle::new("r2");
        let doc = serde_json::to_value(RunDescriptor::from(&run)).unwrap();
        assert_eq!(doc["state"], "PENDING");
        assert!(doc.get("startedAt").is_none());
        assert!(doc.get("finishedAt").is_none());

        let state = run.state.error(vec!["failed".into()]).unwrap();
        let desc = RunDescriptor::new("r2", &state);
        assert_eq!(desc.messages, Some(vec!["failed".to_string()]));
        assert!(desc.files.is_none());
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("a/B.TXT"), "text/plain");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }
}
