// Core data structures shared by sandbox backends.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use url::Url;

/// Label carrying the owning session id. This is the sole mechanism used to
/// associate live infrastructure with persisted sessions.
pub const SESSION_LABEL: &str = "denbox.session-id";

/// Label marking a sandbox as managed by this service; `list()` is scoped
/// to it so reconciliation never touches foreign containers.
pub const MANAGED_LABEL: &str = "denbox.managed";

/// Sandbox runtime state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Stopped,
}

/// One live sandbox (container or VM) as seen by its backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInstance {
    /// Backend-assigned identifier (container id / VM id).
    pub id: String,
    pub session_id: String,
    pub image: String,
    pub state: SandboxState,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Options for `SandboxProvider::create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Image override; the backend's configured image when `None`.
    pub image: Option<String>,
    /// Host path mounted as the session workspace.
    pub workspace_path: Option<String>,
    /// Extra environment entries (`KEY=value`).
    pub env: Vec<String>,
    /// Extra labels merged with the managed/session labels.
    pub labels: HashMap<String, String>,
    /// Start the sandbox immediately after creating it.
    pub start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Command to attach to; the backend's default shell when empty.
    pub command: Vec<String>,
    pub tty: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            tty: true,
        }
    }
}

/// Interactive session handle returned by `attach`.
pub struct AttachHandle {
    pub id: String,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
}

/// HTTP client bound to one sandbox's internal address.
pub struct SandboxHttpClient {
    base_url: Url,
    client: reqwest::Client,
}

impl SandboxHttpClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Resolve a path against the sandbox's base address.
    pub fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }
}

/// Coarse backend readiness surfaced to operators and the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub state: String,
    pub message: String,
}

impl ProviderStatus {
    pub fn ready() -> Self {
        Self {
            state: "ready".to_string(),
            message: String::new(),
        }
    }

    pub fn downloading(message: impl Into<String>) -> Self {
        Self {
            state: "downloading".to_string(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            state: "failed".to_string(),
            // a failed status must always explain itself
            message: if message.is_empty() {
                "unknown backend failure".to_string()
            } else {
                message
            },
        }
    }
}
