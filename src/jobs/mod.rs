// Durable job mechanism. A job's payload is written to disk before the
// handler runs, so a transition interrupted by a crash is re-dispatched on
// the next startup. Handlers must therefore be replay-safe.
//
// The payload file doubles as a per-resource lock: enqueue rejects a second
// job for the same (resourceType, resourceId) while the first file exists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a {kind} job is already queued for {resource_type} {resource_id}")]
    AlreadyQueued {
        kind: String,
        resource_type: String,
        resource_id: String,
    },

    #[error("no handler registered for job kind {0}")]
    UnknownKind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The durable unit: everything needed to re-run the job after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub job_id: String,
    pub kind: String,
    pub resource_type: String,
    pub resource_id: String,
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn resource_key(&self) -> (&str, &str) {
        (&self.resource_type, &self.resource_id)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. Domain failures (e.g. a commit that fails) must be
    /// recorded by the handler itself and reported here as `Ok`; an `Err`
    /// means the handler could not run at all.
    async fn run(&self, payload: &JobPayload) -> anyhow::Result<()>;
}

/// File-backed job queue. One payload file per outstanding job, named
/// `<resourceType>-<resourceId>.json` under `<data_dir>/jobs/`.
pub struct JobQueue {
    dir: PathBuf,
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    // serializes the exists-check + write in enqueue
    enqueue_lock: Mutex<()>,
}

impl JobQueue {
    pub fn new(data_dir: &std::path::Path) -> Result<Self, JobError> {
        let dir = data_dir.join("jobs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            handlers: std::sync::RwLock::new(HashMap::new()),
            enqueue_lock: Mutex::new(()),
        })
    }

    pub fn register(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(kind.to_string(), handler);
    }

    fn payload_path(&self, resource_type: &str, resource_id: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", resource_type, resource_id))
    }

    /// Persist the payload, then dispatch it on a background task. Returns
    /// the generated job id. Fails with `AlreadyQueued` while a payload file
    /// for the same resource key exists.
    pub async fn enqueue(
        self: &Arc<Self>,
        kind: &str,
        resource_type: &str,
        resource_id: &str,
        data: serde_json::Value,
    ) -> Result<String, JobError> {
        if !self.handlers.read().unwrap().contains_key(kind) {
            return Err(JobError::UnknownKind(kind.to_string()));
        }

        let _guard = self.enqueue_lock.lock().await;
        let path = self.payload_path(resource_type, resource_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(JobError::AlreadyQueued {
                kind: kind.to_string(),
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
            });
        }

        let payload = JobPayload {
            job_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            data,
        };

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&payload)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            job = %payload.job_id,
            kind,
            resource = %format!("{}/{}", resource_type, resource_id),
            "job persisted, dispatching"
        );

        let queue = Arc::clone(self);
        let job_id = payload.job_id.clone();
        tokio::spawn(async move {
            queue.dispatch(payload).await;
        });
        Ok(job_id)
    }

    /// Re-dispatch every payload file left over from a previous run.
    pub async fn resume(self: &Arc<Self>) -> Result<usize, JobError> {
        let mut resumed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let payload: JobPayload = match serde_json::from_slice(&raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable job payload");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };
            info!(job = %payload.job_id, kind = %payload.kind, "resuming persisted job");
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.dispatch(payload).await;
            });
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Run the handler, then delete the payload file whether the handler
    /// succeeded or not. A handler `Err` is logged; the file is still
    /// removed because replaying a job that cannot run does not help.
    async fn dispatch(&self, payload: JobPayload) {
        let handler = self.handlers.read().unwrap().get(&payload.kind).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.run(&payload).await {
                    error!(job = %payload.job_id, kind = %payload.kind, error = %e, "job handler failed");
                }
            }
            None => {
                error!(job = %payload.job_id, kind = %payload.kind, "no handler for persisted job");
            }
        }

        let path = self.payload_path(&payload.resource_type, &payload.resource_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(job = %payload.job_id, error = %e, "failed to remove job payload file");
        }
    }

    /// Whether a job is outstanding for the given resource.
    pub fn is_queued(&self, resource_type: &str, resource_id: &str) -> bool {
        self.payload_path(resource_type, resource_id).exists()
    }
}
