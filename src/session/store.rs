// JSON-persisted session and workspace records. All mutation goes through
// the closure-taking `mutate_*` methods so a guard check and its write
// happen under one lock, and every change is flushed to disk before the
// lock is released (temp file + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::types::{Session, Workspace};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    sessions: HashMap<String, Session>,
    workspaces: HashMap<String, Workspace>,
}

/// In-memory state with write-through JSON persistence.
pub struct StateStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
}

impl StateStore {
    /// Open the store at `<data_dir>/state.json`, loading existing records.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("state.json");
        let state = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            PersistedState::default()
        };
        debug!(
            sessions = state.sessions.len(),
            workspaces = state.workspaces.len(),
            "state store opened"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &PersistedState) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        state.sessions.insert(session.id.clone(), session);
        self.persist(&state)
    }

    pub fn insert_workspace(&self, workspace: Workspace) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        state.workspaces.insert(workspace.id.clone(), workspace);
        self.persist(&state)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.state.read().unwrap().sessions.get(id).cloned()
    }

    pub fn get_workspace(&self, id: &str) -> Option<Workspace> {
        self.state.read().unwrap().workspaces.get(id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.state.read().unwrap().sessions.values().cloned().collect()
    }

    /// Atomic check-and-set on one session.
    pub fn mutate_session<F, T, E>(&self, id: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.write().unwrap();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        let result = f(session)?;
        self.persist(&state)?;
        Ok(result)
    }

    /// Atomic check-and-set on one workspace.
    pub fn mutate_workspace<F, T, E>(&self, id: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Workspace) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.write().unwrap();
        let workspace = state
            .workspaces
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(id.to_string()))?;
        let result = f(workspace)?;
        self.persist(&state)?;
        Ok(result)
    }

    /// Atomic check-and-set across a workspace and one of its sessions.
    /// The commit guards span both records, so they must be inspected and
    /// updated under a single lock acquisition.
    pub fn mutate_pair<F, T, E>(&self, workspace_id: &str, session_id: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Workspace, &mut Session) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.write().unwrap();
        if !state.workspaces.contains_key(workspace_id) {
            return Err(StoreError::WorkspaceNotFound(workspace_id.to_string()).into());
        }
        let mut session = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let session_snapshot = session.clone();
        let workspace = state
            .workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.to_string()))?;
        let workspace_snapshot = workspace.clone();

        // a closure may mutate before it rejects; without persist those
        // mutations must not survive in memory either
        let result = f(workspace, &mut session);
        if result.is_err() {
            *workspace = workspace_snapshot;
            session = session_snapshot;
        }
        state.sessions.insert(session_id.to_string(), session);
        let result = result?;
        self.persist(&state)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{CommitStatus, SessionStatus};
    use tempfile::tempdir;

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            project_id: "p1".to_string(),
            path: PathBuf::from("/tmp/w"),
            source_type: "git".to_string(),
            status: "ready".to_string(),
            commit_status: CommitStatus::None,
            commit_error: None,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store
                .insert_session(Session::new("s1", "p1", "w1", "demo"))
                .unwrap();
            store.insert_workspace(workspace("w1")).unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        let session = store.get_session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Initializing);
        assert!(store.get_workspace("w1").is_some());
    }

    #[test]
    fn mutate_session_persists_change() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .insert_session(Session::new("s1", "p1", "w1", "demo"))
            .unwrap();

        store
            .mutate_session::<_, _, StoreError>("s1", |s| {
                s.commit_status = CommitStatus::Pending;
                Ok(())
            })
            .unwrap();

        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get_session("s1").unwrap().commit_status,
            CommitStatus::Pending
        );
    }

    #[test]
    fn mutate_pair_rejects_missing_records() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.insert_workspace(workspace("w1")).unwrap();

        let err = store
            .mutate_pair::<_, (), StoreError>("w1", "missing", |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));

        let err = store
            .mutate_pair::<_, (), StoreError>("missing", "s1", |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkspaceNotFound(_)));
    }

    #[test]
    fn mutate_pair_failure_still_keeps_session() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.insert_workspace(workspace("w1")).unwrap();
        store
            .insert_session(Session::new("s1", "p1", "w1", "demo"))
            .unwrap();

        let _ = store.mutate_pair::<_, (), StoreError>("w1", "s1", |_, _| {
            Err(StoreError::SessionNotFound("synthetic".to_string()))
        });
        assert!(store.get_session("s1").is_some());
    }

    #[test]
    fn mutate_pair_failure_discards_partial_mutations() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.insert_workspace(workspace("w1")).unwrap();
        store
            .insert_session(Session::new("s1", "p1", "w1", "demo"))
            .unwrap();

        let _ = store.mutate_pair::<_, (), StoreError>("w1", "s1", |w, s| {
            w.commit_status = CommitStatus::Committing;
            s.commit_status = CommitStatus::Pending;
            Err(StoreError::SessionNotFound("synthetic".to_string()))
        });

        assert_eq!(
            store.get_workspace("w1").unwrap().commit_status,
            CommitStatus::None
        );
        assert_eq!(
            store.get_session("s1").unwrap().commit_status,
            CommitStatus::None
        );
    }
}
