// Session and workspace records. Lifecycle and commit progress are two
// independent enums on the same record; neither implies anything about
// the other.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session lifecycle. `Removed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Cloning,
    PullingImage,
    CreatingSandbox,
    Ready,
    Stopped,
    Error,
    Reinitializing,
    Removing,
    Removed,
}

impl SessionStatus {
    /// Legal lifecycle transitions. Everything not listed is rejected.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Cloning)
                | (Initializing, PullingImage)
                | (Initializing, CreatingSandbox)
                | (Initializing, Error)
                | (Cloning, PullingImage)
                | (Cloning, CreatingSandbox)
                | (Cloning, Error)
                | (PullingImage, CreatingSandbox)
                | (PullingImage, Error)
                | (CreatingSandbox, Ready)
                | (CreatingSandbox, Error)
                | (Ready, Stopped)
                | (Ready, Error)
                | (Ready, Removing)
                | (Ready, Reinitializing)
                | (Stopped, Ready)
                | (Stopped, Error)
                | (Stopped, Removing)
                | (Error, Removing)
                | (Reinitializing, CreatingSandbox)
                | (Reinitializing, Ready)
                | (Reinitializing, Error)
                | (Removing, Removed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Cloning => "cloning",
            SessionStatus::PullingImage => "pulling_image",
            SessionStatus::CreatingSandbox => "creating_sandbox",
            SessionStatus::Ready => "ready",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
            SessionStatus::Reinitializing => "reinitializing",
            SessionStatus::Removing => "removing",
            SessionStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Commit progress. `Completed` and `Failed` permit a fresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    #[default]
    None,
    Pending,
    Committing,
    Completed,
    Failed,
}

impl CommitStatus {
    pub fn in_progress(self) -> bool {
        matches!(self, CommitStatus::Pending | CommitStatus::Committing)
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitStatus::None => "none",
            CommitStatus::Pending => "pending",
            CommitStatus::Committing => "committing",
            CommitStatus::Completed => "completed",
            CommitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub name: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub commit_status: CommitStatus,
    /// Hash captured when a commit is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    /// Hash recorded after a successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Whether an agent completion is actively processing in this session.
    /// Reset by running-state reconciliation after a restart.
    #[serde(default)]
    pub running: bool,
}

impl Session {
    pub fn new(id: &str, project_id: &str, workspace_id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            agent_id: None,
            name: name.to_string(),
            status: SessionStatus::Initializing,
            commit_status: CommitStatus::None,
            base_commit: None,
            applied_commit: None,
            commit_error: None,
            error_message: None,
            running: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub project_id: String,
    pub path: std::path::PathBuf,
    pub source_type: String,
    pub status: String,
    #[serde(default)]
    pub commit_status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
}
