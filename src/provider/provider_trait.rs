// The uniform sandbox lifecycle contract every backend implements.

use std::time::Duration;

use async_trait::async_trait;

use super::error::Result;
use super::types::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, ProviderStatus,
    SandboxHttpClient, SandboxInstance,
};

/// Provider-agnostic sandbox lifecycle contract.
///
/// All operations except `create` and `list` are scoped to one session id.
/// Operations may block on external processes or hypervisor calls for
/// seconds; callers must treat them as blocking I/O.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a sandbox for a session.
    ///
    /// Must fail with `ProviderError::NotReady` when backend prerequisites
    /// (e.g. cached VM artifacts) are not satisfied, and must not leave a
    /// partially-created resource behind on failure.
    async fn create(&self, session_id: &str, opts: CreateOptions) -> Result<SandboxInstance>;

    async fn start(&self, session_id: &str) -> Result<()>;

    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()>;

    /// Remove the session's sandbox. Removing an absent sandbox is a no-op,
    /// not an error.
    async fn remove(&self, session_id: &str) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<SandboxInstance>>;

    /// All sandboxes managed by this provider.
    async fn list(&self) -> Result<Vec<SandboxInstance>>;

    async fn exec(&self, session_id: &str, cmd: &[String], opts: ExecOptions)
        -> Result<ExecResult>;

    async fn attach(&self, session_id: &str, opts: AttachOptions) -> Result<AttachHandle>;

    /// HTTP client bound to the sandbox's internal address.
    async fn http_client(&self, session_id: &str) -> Result<SandboxHttpClient>;

    async fn get_secret(&self, session_id: &str, name: &str) -> Result<String>;

    /// Release provider-wide resources (not a single sandbox).
    async fn close(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// The image this provider creates sandboxes from.
    fn image(&self) -> &str;

    /// Backend readiness; backends without an async warm-up are always ready.
    fn status(&self) -> ProviderStatus {
        ProviderStatus::ready()
    }
}
