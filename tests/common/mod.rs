// Shared fixtures: an in-memory provider, a scriptable committer and a
// service builder over a temp data directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use denbox::jobs::JobQueue;
use denbox::provider::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, ProviderError,
    SandboxHttpClient, SandboxInstance, SandboxProvider, SandboxState,
};
use denbox::session::{
    CommitStatus, Committer, EventBus, Session, SessionError, SessionService, StateStore,
    Workspace, WorkspaceCloner,
};

pub struct MemoryProvider {
    image: String,
    sandboxes: Mutex<HashMap<String, SandboxInstance>>,
}

impl MemoryProvider {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, session_id: &str, image: &str) -> String {
        let id = format!("sb-seed-{}", session_id);
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

    pub fn sandbox_id(&self, session_id: &str) -> Option<String> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.id.clone())
    }
}

#[async_trait]
impl SandboxProvider for MemoryProvider {
    async fn create(
        &self,
        session_id: &str,
        _opts: CreateOptions,
    ) -> denbox::provider::Result<SandboxInstance> {
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

    async fn start(&self, _session_id: &str) -> denbox::provider::Result<()> {
        Ok(())
    }

    async fn stop(&self, _session_id: &str, _timeout: Duration) -> denbox::provider::Result<()> {
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> denbox::provider::Result<()> {
        self.sandboxes.lock().unwrap().remove(session_id);
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
    ) -> denbox::provider::Result<Option<SandboxInstance>> {
        Ok(self.sandboxes.lock().unwrap().get(session_id).cloned())
    }

    async fn list(&self) -> denbox::provider::Result<Vec<SandboxInstance>> {
        Ok(self.sandboxes.lock().unwrap().values().cloned().collect())
    }

    async fn exec(
        &self,
        _session_id: &str,
        _cmd: &[String],
        _opts: ExecOptions,
    ) -> denbox::provider::Result<ExecResult> {
        Err(ProviderError::OperationFailed("not supported".to_string()))
    }

    async fn attach(
        &self,
        _session_id: &str,
        _opts: AttachOptions,
    ) -> denbox::provider::Result<AttachHandle> {
        Err(ProviderError::OperationFailed("not supported".to_string()))
    }

    async fn http_client(
        &self,
        _session_id: &str,
    ) -> denbox::provider::Result<SandboxHttpClient> {
        Err(ProviderError::OperationFailed("not supported".to_string()))
    }

    async fn get_secret(
        &self,
        _session_id: &str,
        name: &str,
    ) -> denbox::provider::Result<String> {
        Err(ProviderError::SecretNotFound(name.to_string()))
    }

    async fn close(&self) -> denbox::provider::Result<()> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> denbox::provider::Result<bool> {
        Ok(true)
    }

    fn image(&self) -> &str {
        &self.image
    }
}

/// Committer whose answers are fixed up front.
pub struct ScriptedCommitter {
    pub base: Option<String>,
    pub commit_result: Result<String, String>,
}

impl Default for ScriptedCommitter {
    fn default() -> Self {
        Self {
            base: Some("base000".to_string()),
            commit_result: Ok("applied111".to_string()),
        }
    }
}

#[async_trait]
impl Committer for ScriptedCommitter {
    async fn capture_base(&self, _path: &Path) -> Result<String, SessionError> {
        match &self.base {
            Some(base) => Ok(base.clone()),
            None => Err(SessionError::Git("HEAD not found".to_string())),
        }
    }

    async fn commit(&self, _path: &Path, _message: &str) -> Result<String, SessionError> {
        match &self.commit_result {
            Ok(hash) => Ok(hash.clone()),
            Err(msg) => Err(SessionError::Git(msg.clone())),
        }
    }
}

pub struct NoopCloner;

#[async_trait]
impl WorkspaceCloner for NoopCloner {
    async fn prepare(&self, _workspace: &Workspace) -> Result<(), SessionError> {
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<SessionService>,
    pub jobs: Arc<JobQueue>,
    pub store: Arc<StateStore>,
    pub provider: Arc<MemoryProvider>,
}

/// Build a service over `dir` with one workspace `w1` and one session `s1`.
pub fn harness(dir: &Path, committer: ScriptedCommitter) -> Harness {
    let store = Arc::new(StateStore::open(dir).unwrap());
    store
        .insert_workspace(Workspace {
            id: "w1".to_string(),
            project_id: "p1".to_string(),
            path: PathBuf::from("/tmp/denbox-test-w1"),
            source_type: "git".to_string(),
            status: "ready".to_string(),
            commit_status: CommitStatus::None,
            commit_error: None,
        })
        .unwrap();
    store
        .insert_session(Session::new("s1", "p1", "w1", "demo"))
        .unwrap();

    let provider = Arc::new(MemoryProvider::new("denbox/sandbox:latest"));
    let jobs = Arc::new(JobQueue::new(dir).unwrap());
    let service = SessionService::new(
        Arc::clone(&store),
        EventBus::new(),
        provider.clone() as Arc<dyn SandboxProvider>,
        Arc::clone(&jobs),
        Arc::new(committer),
        Arc::new(NoopCloner),
    );
    Harness {
        service,
        jobs,
        store,
        provider,
    }
}

/// Poll until the commit job for `w1` has been consumed.
pub async fn wait_for_job_settled(jobs: &JobQueue) {
    for _ in 0..200 {
        if !jobs.is_queued("workspace", "w1") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("commit job did not settle in time");
}
