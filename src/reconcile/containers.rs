// Container-image reconciliation: walks the backend's managed sandboxes and
// repairs the ones that no longer match persisted state. An up-to-date
// sandbox is left alone; identity is the no-op check.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::provider::{CreateOptions, SandboxProvider};
use crate::session::{SessionStatus, StateStore};

#[derive(Debug, Default)]
pub struct ContainerReconcileReport {
    /// Sandboxes removed because no live session claims them.
    pub removed_orphans: Vec<String>,
    /// Sessions whose sandbox was rebuilt on the current image.
    pub recreated: Vec<String>,
    /// Sessions whose sandbox already matched.
    pub unchanged: Vec<String>,
    /// Ready sessions with no sandbox behind them at all. Repair goes
    /// through the session service, which owns the status transitions.
    pub missing: Vec<String>,
}

pub async fn reconcile_containers(
    store: &StateStore,
    provider: &Arc<dyn SandboxProvider>,
) -> crate::provider::Result<ContainerReconcileReport> {
    let mut report = ContainerReconcileReport::default();
    let sandboxes = provider.list().await?;
    let current_image = provider.image().to_string();
    let mut backed = HashSet::new();

    for sandbox in sandboxes {
        backed.insert(sandbox.session_id.clone());
        let session = store.get_session(&sandbox.session_id);
        let orphaned = match &session {
            None => true,
            Some(s) => matches!(
                s.status,
                SessionStatus::Removing | SessionStatus::Removed
            ),
        };

        if orphaned {
            info!(
                sandbox = %sandbox.id,
                session = %sandbox.session_id,
                "removing orphaned sandbox"
            );
            provider.remove(&sandbox.session_id).await?;
            report.removed_orphans.push(sandbox.id);
            continue;
        }

        if sandbox.image != current_image {
            info!(
                sandbox = %sandbox.id,
                session = %sandbox.session_id,
                old_image = %sandbox.image,
                new_image = %current_image,
                "recreating sandbox on current image"
            );
            provider.remove(&sandbox.session_id).await?;

            let workspace_path = session
                .as_ref()
                .and_then(|s| store.get_workspace(&s.workspace_id))
                .map(|w| w.path.to_string_lossy().into_owned());
            let opts = CreateOptions {
                workspace_path,
                start: true,
                ..Default::default()
            };
            match provider.create(&sandbox.session_id, opts).await {
                Ok(fresh) => {
                    // fresh sandbox, fresh id
                    report.recreated.push(fresh.session_id);
                }
                Err(e) => {
                    warn!(
                        session = %sandbox.session_id,
                        error = %e,
                        "failed to recreate sandbox, leaving session for setup retry"
                    );
                }
            }
            continue;
        }

        report.unchanged.push(sandbox.session_id);
    }

    // the walk above only sees sandboxes that exist; a ready session whose
    // sandbox vanished out-of-band has to be found from the store side
    for session in store.list_sessions() {
        if session.status == SessionStatus::Ready && !backed.contains(&session.id) {
            warn!(session = %session.id, "ready session has no backing sandbox");
            report.missing.push(session.id);
        }
    }

    info!(
        orphans = report.removed_orphans.len(),
        recreated = report.recreated.len(),
        unchanged = report.unchanged.len(),
        missing = report.missing.len(),
        "container reconciliation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        AttachHandle, AttachOptions, ExecOptions, ExecResult, ProviderError, SandboxHttpClient,
        SandboxInstance, SandboxState,
    };
    use crate::session::{CommitStatus, Session, Workspace};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Provider over an in-memory sandbox table.
    struct FakeProvider {
        image: String,
        sandboxes: Mutex<HashMap<String, SandboxInstance>>,
    }

    impl FakeProvider {
        fn new(image: &str) -> Self {
            Self {
                image: image.to_string(),
                sandboxes: Mutex::new(HashMap::new()),
            }
        }

        fn seed(&self, session_id: &str, image: &str) -> String {
            let id = format!("sb-{}-{}", session_id, image.len());
            self.sandboxes.lock().unwrap().insert(
                session_id.to_string(),
                SandboxInstance {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    image: image.to_string(),
                    state: SandboxState::Running,
                    labels: Default::default(),
                    created_at: chrono::Utc::now(),
                },
            );
            id
        }

        fn sandbox_id(&self, session_id: &str) -> Option<String> {
            self.sandboxes
                .lock()
                .unwrap()
                .get(session_id)
                .map(|s| s.id.clone())
        }
    }

    #[async_trait]
    impl SandboxProvider for FakeProvider {
        async fn create(
            &self,
            session_id: &str,
            _opts: CreateOptions,
        ) -> crate::provider::Result<SandboxInstance> {
            let instance = SandboxInstance {
                id: format!("sb-{}", uuid::Uuid::new_v4().simple()),
                session_id: session_id.to_string(),
                image: self.image.clone(),
                state: SandboxState::Running,
                labels: Default::default(),
                created_at: chrono::Utc::now(),
            };
            self.sandboxes
                .lock()
                .unwrap()
                .insert(session_id.to_string(), instance.clone());
            Ok(instance)
        }
        async fn start(&self, _session_id: &str) -> crate::provider::Result<()> {
            Ok(())
        }
        async fn stop(&self, _session_id: &str, _timeout: Duration) -> crate::provider::Result<()> {
            Ok(())
        }
        async fn remove(&self, session_id: &str) -> crate::provider::Result<()> {
            self.sandboxes.lock().unwrap().remove(session_id);
            Ok(())
        }
        async fn get(
            &self,
            session_id: &str,
        ) -> crate::provider::Result<Option<SandboxInstance>> {
            Ok(self.sandboxes.lock().unwrap().get(session_id).cloned())
        }
        async fn list(&self) -> crate::provider::Result<Vec<SandboxInstance>> {
            Ok(self.sandboxes.lock().unwrap().values().cloned().collect())
        }
        async fn exec(
            &self,
            _session_id: &str,
            _cmd: &[String],
            _opts: ExecOptions,
        ) -> crate::provider::Result<ExecResult> {
            Err(ProviderError::OperationFailed("not in fake".to_string()))
        }
        async fn attach(
            &self,
            _session_id: &str,
            _opts: AttachOptions,
        ) -> crate::provider::Result<AttachHandle> {
            Err(ProviderError::OperationFailed("not in fake".to_string()))
        }
        async fn http_client(
            &self,
            _session_id: &str,
        ) -> crate::provider::Result<SandboxHttpClient> {
            Err(ProviderError::OperationFailed("not in fake".to_string()))
        }
        async fn get_secret(
            &self,
            _session_id: &str,
            _name: &str,
        ) -> crate::provider::Result<String> {
            Err(ProviderError::SecretNotFound("fake".to_string()))
        }
        async fn close(&self) -> crate::provider::Result<()> {
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> crate::provider::Result<bool> {
            Ok(true)
        }
        fn image(&self) -> &str {
            &self.image
        }
    }

    fn store_with_session(dir: &std::path::Path, session_id: &str) -> StateStore {
        let store = StateStore::open(dir).unwrap();
        store
            .insert_workspace(Workspace {
                id: "w1".to_string(),
                project_id: "p1".to_string(),
                path: PathBuf::from("/tmp/w1"),
                source_type: "git".to_string(),
                status: "ready".to_string(),
                commit_status: CommitStatus::None,
                commit_error: None,
            })
            .unwrap();
        let mut session = Session::new(session_id, "p1", "w1", "demo");
        session.status = SessionStatus::Ready;
        store.insert_session(session).unwrap();
        store
    }

    #[tokio::test]
    async fn orphaned_sandbox_is_removed() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let fake = Arc::new(FakeProvider::new("img:1"));
        fake.seed("ghost-session", "img:1");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert_eq!(report.removed_orphans.len(), 1);
        assert!(fake.sandbox_id("ghost-session").is_none());
    }

    #[tokio::test]
    async fn outdated_image_gets_recreated_with_fresh_id() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        let fake = Arc::new(FakeProvider::new("img:2"));
        let old_id = fake.seed("s1", "img:1");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert_eq!(report.recreated, vec!["s1".to_string()]);

        let new_id = fake.sandbox_id("s1").unwrap();
        assert_ne!(new_id, old_id);
        let instance = fake.get("s1").await.unwrap().unwrap();
        assert_eq!(instance.image, "img:2");
    }

    #[tokio::test]
    async fn matching_sandbox_is_untouched() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        let fake = Arc::new(FakeProvider::new("img:1"));
        let id = fake.seed("s1", "img:1");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert_eq!(report.unchanged, vec!["s1".to_string()]);
        assert!(report.removed_orphans.is_empty());
        assert!(report.recreated.is_empty());
        // same identity, so nothing was rebuilt
        assert_eq!(fake.sandbox_id("s1").unwrap(), id);
    }

    #[tokio::test]
    async fn removing_session_counts_as_orphan() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        store
            .mutate_session::<_, (), crate::session::StoreError>("s1", |s| {
                s.status = SessionStatus::Removing;
                Ok(())
            })
            .unwrap();
        let fake = Arc::new(FakeProvider::new("img:1"));
        fake.seed("s1", "img:1");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert_eq!(report.removed_orphans.len(), 1);
    }

    #[tokio::test]
    async fn ready_session_without_sandbox_is_reported_missing() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        let fake = Arc::new(FakeProvider::new("img:1"));
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert_eq!(report.missing, vec!["s1".to_string()]);
        assert!(report.removed_orphans.is_empty());
        assert!(report.unchanged.is_empty());
    }

    #[tokio::test]
    async fn backed_sessions_are_not_reported_missing() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        let fake = Arc::new(FakeProvider::new("img:1"));
        fake.seed("s1", "img:1");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert!(report.missing.is_empty());
        assert_eq!(report.unchanged, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn only_outdated_sandboxes_are_rebuilt() {
        let dir = tempdir().unwrap();
        let store = store_with_session(dir.path(), "s1");
        for id in ["s2", "s3"] {
            let mut session = Session::new(id, "p1", "w1", "demo");
            session.status = SessionStatus::Ready;
            store.insert_session(session).unwrap();
        }
        let fake = Arc::new(FakeProvider::new("img:2"));
        fake.seed("s1", "img:1");
        fake.seed("s2", "img:1");
        let current_id = fake.seed("s3", "img:2");
        let provider: Arc<dyn SandboxProvider> = fake.clone();

        let report = reconcile_containers(&store, &provider).await.unwrap();
        let mut recreated = report.recreated.clone();
        recreated.sort();
        assert_eq!(recreated, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(report.unchanged, vec!["s3".to_string()]);
        assert_eq!(fake.sandbox_id("s3").unwrap(), current_id);
    }

    #[tokio::test]
    async fn no_sandboxes_is_a_clean_no_op() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let provider: Arc<dyn SandboxProvider> = Arc::new(FakeProvider::new("img:1"));

        let report = reconcile_containers(&store, &provider).await.unwrap();
        assert!(report.removed_orphans.is_empty());
        assert!(report.recreated.is_empty());
        assert!(report.unchanged.is_empty());
    }
}
