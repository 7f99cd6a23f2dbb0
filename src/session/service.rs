// Session service: the only writer of session/workspace status. Lifecycle
// transitions are validated against the state machine; commit transitions
// are guarded by atomic check-and-set on the persisted records, with a
// durable job carrying the commit across restarts.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::{JobHandler, JobPayload, JobQueue};
use crate::provider::{CreateOptions, ProviderError, SandboxProvider};

use super::events::EventBus;
use super::store::{StateStore, StoreError};
use super::types::{CommitStatus, Session, SessionStatus, Workspace};

/// Job kind used for durable commits.
pub const COMMIT_JOB_KIND: &str = "commit";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("commit already in progress for workspace (status: {0})")]
    WorkspaceCommitInProgress(CommitStatus),

    #[error("commit already in progress for session (status: {0})")]
    SessionCommitInProgress(CommitStatus),

    #[error("session already committed")]
    AlreadyCommitted,

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("failed to queue commit job: {0}")]
    Enqueue(String),

    #[error("git operation failed: {0}")]
    Git(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Durable commit payload; the resource key is the workspace because the
/// commit lock must be workspace-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitJobData {
    pub project_id: String,
    pub session_id: String,
    pub workspace_id: String,
}

/// Seam for the underlying version-control operations, mocked in tests.
#[async_trait]
pub trait Committer: Send + Sync {
    /// Current HEAD of the working tree, captured as the base commit.
    async fn capture_base(&self, path: &Path) -> Result<String, SessionError>;

    /// Commit the working tree; returns the new commit hash.
    async fn commit(&self, path: &Path, message: &str) -> Result<String, SessionError>;
}

/// Committer that shells out to the `git` binary.
pub struct GitCommitter;

impl GitCommitter {
    async fn git(path: &Path, args: &[&str]) -> Result<String, SessionError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .await
            .map_err(|e| SessionError::Git(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(SessionError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Committer for GitCommitter {
    async fn capture_base(&self, path: &Path) -> Result<String, SessionError> {
        Self::git(path, &["rev-parse", "HEAD"]).await
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<String, SessionError> {
        Self::git(path, &["add", "-A"]).await?;
        Self::git(path, &["commit", "--allow-empty", "-m", message]).await?;
        Self::git(path, &["rev-parse", "HEAD"]).await
    }
}

/// Seam for preparing a workspace's working tree before a sandbox mounts it.
#[async_trait]
pub trait WorkspaceCloner: Send + Sync {
    async fn prepare(&self, workspace: &Workspace) -> Result<(), SessionError>;
}

/// Cloner that ensures a git working tree exists at the workspace path.
pub struct GitCloner;

#[async_trait]
impl WorkspaceCloner for GitCloner {
    async fn prepare(&self, workspace: &Workspace) -> Result<(), SessionError> {
        if workspace.path.join(".git").exists() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&workspace.path)
            .await
            .map_err(|e| SessionError::Git(format!("failed to create workspace dir: {}", e)))?;
        GitCommitter::git(&workspace.path, &["init"]).await?;
        Ok(())
    }
}

pub struct SessionService {
    store: Arc<StateStore>,
    events: EventBus,
    provider: Arc<dyn SandboxProvider>,
    jobs: Arc<JobQueue>,
    committer: Arc<dyn Committer>,
    cloner: Arc<dyn WorkspaceCloner>,
}

/// Reverts the optimistic `pending` commit state unless disarmed. Runs on
/// every early exit from `commit_session`, not just the mapped error paths.
struct CommitRevert<'a> {
    store: &'a StateStore,
    workspace_id: &'a str,
    session_id: &'a str,
    armed: bool,
}

impl Drop for CommitRevert<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = self.store.mutate_pair::<_, (), StoreError>(
            self.workspace_id,
            self.session_id,
            |workspace, session| {
                workspace.commit_status = CommitStatus::None;
                session.commit_status = CommitStatus::None;
                session.base_commit = None;
                Ok(())
            },
        );
        if let Err(e) = result {
            error!(
                session = self.session_id,
                error = %e,
                "failed to revert commit state after enqueue failure"
            );
        }
    }
}

impl SessionService {
    pub fn new(
        store: Arc<StateStore>,
        events: EventBus,
        provider: Arc<dyn SandboxProvider>,
        jobs: Arc<JobQueue>,
        committer: Arc<dyn Committer>,
        cloner: Arc<dyn WorkspaceCloner>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            events,
            provider,
            jobs,
            committer,
            cloner,
        });
        service.jobs.register(
            COMMIT_JOB_KIND,
            Arc::new(CommitJobHandler {
                service: Arc::downgrade(&service),
            }),
        );
        service
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Validated lifecycle transition; broadcasts on success.
    pub fn set_status(&self, session_id: &str, next: SessionStatus) -> Result<(), SessionError> {
        self.store.mutate_session(session_id, |session| {
            if !session.status.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    from: session.status,
                    to: next,
                });
            }
            session.status = next;
            if next != SessionStatus::Error {
                session.error_message = None;
            }
            Ok(())
        })?;
        self.events.publish(session_id, next);
        Ok(())
    }

    fn fail_session(&self, session_id: &str, message: &str) {
        let result = self.store.mutate_session::<_, (), SessionError>(session_id, |session| {
            session.status = SessionStatus::Error;
            session.error_message = Some(message.to_string());
            Ok(())
        });
        match result {
            Ok(()) => self.events.publish(session_id, SessionStatus::Error),
            Err(e) => error!(session = session_id, error = %e, "failed to record session error"),
        }
    }

    pub fn create_session(
        &self,
        project_id: &str,
        workspace_id: &str,
        name: &str,
    ) -> Result<Session, SessionError> {
        let session = Session::new(
            &format!("sess-{}", Uuid::new_v4().simple()),
            project_id,
            workspace_id,
            name,
        );
        self.store.insert_session(session.clone())?;
        self.events.publish(&session.id, session.status);
        Ok(session)
    }

    /// Run the setup pipeline for a freshly created session. Any step
    /// failure parks the session in `error` with the message recorded; no
    /// automatic retry.
    pub async fn provision(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let workspace = self
            .store
            .get_workspace(&session.workspace_id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(session.workspace_id.clone()))?;

        self.set_status(session_id, SessionStatus::Cloning)?;
        if let Err(e) = self.cloner.prepare(&workspace).await {
            self.fail_session(session_id, &e.to_string());
            return Err(e);
        }

        self.set_status(session_id, SessionStatus::PullingImage)?;
        match self.provider.image_exists(self.provider.image()).await {
            Ok(true) => {}
            // absent image: create() pulls it; this step only surfaces state
            Ok(false) => info!(session = session_id, "image not cached, backend will pull"),
            Err(e) => {
                self.fail_session(session_id, &e.to_string());
                return Err(e.into());
            }
        }

        self.set_status(session_id, SessionStatus::CreatingSandbox)?;
        let opts = CreateOptions {
            workspace_path: Some(workspace.path.to_string_lossy().into_owned()),
            start: true,
            ..Default::default()
        };
        if let Err(e) = self.provider.create(session_id, opts).await {
            self.fail_session(session_id, &e.to_string());
            return Err(e.into());
        }

        self.set_status(session_id, SessionStatus::Ready)?;
        Ok(())
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.provider
            .stop(session_id, Duration::from_secs(10))
            .await?;
        self.set_status(session_id, SessionStatus::Stopped)
    }

    pub async fn start_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.provider.start(session_id).await?;
        self.set_status(session_id, SessionStatus::Ready)
    }

    /// Recreate the sandbox behind a `ready` session whose backing sandbox
    /// disappeared out-of-band.
    pub async fn reinitialize(&self, session_id: &str) -> Result<(), SessionError> {
        self.set_status(session_id, SessionStatus::Reinitializing)?;

        let session = self
            .store
            .get_session(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let workspace = self
            .store
            .get_workspace(&session.workspace_id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(session.workspace_id.clone()))?;

        self.set_status(session_id, SessionStatus::CreatingSandbox)?;
        let opts = CreateOptions {
            workspace_path: Some(workspace.path.to_string_lossy().into_owned()),
            start: true,
            ..Default::default()
        };
        if let Err(e) = self.provider.create(session_id, opts).await {
            self.fail_session(session_id, &e.to_string());
            return Err(e.into());
        }
        self.set_status(session_id, SessionStatus::Ready)
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.set_status(session_id, SessionStatus::Removing)?;
        // provider removal is idempotent; an absent sandbox is fine
        self.provider.remove(session_id).await?;
        self.set_status(session_id, SessionStatus::Removed)
    }

    /// Mark whether an agent completion is actively processing. Not a
    /// lifecycle transition, so no event is published.
    pub fn set_running(&self, session_id: &str, running: bool) -> Result<(), SessionError> {
        self.store.mutate_session(session_id, |session| {
            session.running = running;
            Ok(())
        })
    }

    /// Request a commit of the session's workspace. Guards reject the
    /// request while another commit is outstanding; on success both records
    /// are `pending`, the base commit is captured, and a durable job is
    /// queued. Every failure after the optimistic update reverts it.
    pub async fn commit_session(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<String, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let workspace_id = session.workspace_id.clone();

        self.store
            .mutate_pair(&workspace_id, session_id, |workspace, session| {
                if workspace.commit_status.in_progress() {
                    return Err(SessionError::WorkspaceCommitInProgress(
                        workspace.commit_status,
                    ));
                }
                if session.commit_status.in_progress() {
                    return Err(SessionError::SessionCommitInProgress(session.commit_status));
                }
                if session.commit_status == CommitStatus::Completed {
                    return Err(SessionError::AlreadyCommitted);
                }
                workspace.commit_status = CommitStatus::Pending;
                session.commit_status = CommitStatus::Pending;
                Ok(())
            })?;

        let mut revert = CommitRevert {
            store: self.store.as_ref(),
            workspace_id: &workspace_id,
            session_id,
            armed: true,
        };

        let workspace = self
            .store
            .get_workspace(&workspace_id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.clone()))?;
        let base = self.committer.capture_base(&workspace.path).await?;
        self.store
            .mutate_session::<_, (), SessionError>(session_id, |session| {
                session.base_commit = Some(base.clone());
                Ok(())
            })?;

        let data = CommitJobData {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            workspace_id: workspace_id.clone(),
        };
        let job_id = self
            .jobs
            .enqueue(
                COMMIT_JOB_KIND,
                "workspace",
                &workspace_id,
                serde_json::to_value(&data)
                    .map_err(|e| SessionError::Enqueue(e.to_string()))?,
            )
            .await
            .map_err(|e| SessionError::Enqueue(e.to_string()))?;

        revert.armed = false;
        info!(session = session_id, job = %job_id, "commit queued");
        Ok(job_id)
    }

    /// Execute a queued commit. Replay-safe: a payload re-dispatched after
    /// a crash, or one whose state was finished externally, is a no-op.
    /// Commit failures are recorded on the records and never returned.
    pub async fn perform_commit(
        &self,
        _project_id: &str,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let workspace_id = session.workspace_id.clone();

        let proceed = self
            .store
            .mutate_pair::<_, bool, SessionError>(&workspace_id, session_id, |workspace, session| {
                if !workspace.commit_status.in_progress() {
                    return Ok(false);
                }
                workspace.commit_status = CommitStatus::Committing;
                session.commit_status = CommitStatus::Committing;
                Ok(true)
            })?;
        if !proceed {
            info!(session = session_id, "commit already settled, nothing to do");
            return Ok(());
        }

        let workspace = self
            .store
            .get_workspace(&workspace_id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.clone()))?;

        let outcome = if session.base_commit.is_none() {
            Err(SessionError::Git("No base commit set".to_string()))
        } else {
            self.committer
                .commit(&workspace.path, &format!("denbox: commit session {}", session_id))
                .await
        };

        match outcome {
            Ok(applied) => {
                self.store.mutate_pair::<_, (), SessionError>(
                    &workspace_id,
                    session_id,
                    |workspace, session| {
                        workspace.commit_status = CommitStatus::Completed;
                        workspace.commit_error = None;
                        session.commit_status = CommitStatus::Completed;
                        session.applied_commit = Some(applied.clone());
                        session.commit_error = None;
                        Ok(())
                    },
                )?;
                info!(session = session_id, commit = %applied, "commit completed");
            }
            Err(e) => {
                let message = match &e {
                    SessionError::Git(m) => m.clone(),
                    other => other.to_string(),
                };
                self.store.mutate_pair::<_, (), SessionError>(
                    &workspace_id,
                    session_id,
                    |workspace, session| {
                        workspace.commit_status = CommitStatus::Failed;
                        workspace.commit_error = Some(message.clone());
                        session.commit_status = CommitStatus::Failed;
                        session.commit_error = Some(message.clone());
                        Ok(())
                    },
                )?;
                warn!(session = session_id, error = %message, "commit failed");
            }
        }
        Ok(())
    }
}

/// Bridges the durable queue to `perform_commit`. Holds a weak reference
/// so the queue does not keep the service alive.
pub struct CommitJobHandler {
    service: Weak<SessionService>,
}

#[async_trait]
impl JobHandler for CommitJobHandler {
    async fn run(&self, payload: &JobPayload) -> anyhow::Result<()> {
        let Some(service) = self.service.upgrade() else {
            anyhow::bail!("session service no longer running");
        };
        let data: CommitJobData = serde_json::from_value(payload.data.clone())?;
        service
            .perform_commit(&data.project_id, &data.session_id)
            .await?;
        Ok(())
    }
}
