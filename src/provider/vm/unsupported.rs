// Capability-unavailable stub for platforms without the virtualization
// facility. Every operation fails the same way rather than attempting
// partial behavior or degrading to another backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::provider::error::{ProviderError, Result};
use crate::provider::provider_trait::SandboxProvider;
use crate::provider::types::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, ProviderStatus,
    SandboxHttpClient, SandboxInstance,
};

pub struct UnsupportedVmProvider {
    image: String,
}

impl UnsupportedVmProvider {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
        }
    }
}

#[async_trait]
impl SandboxProvider for UnsupportedVmProvider {
    async fn create(&self, _session_id: &str, _opts: CreateOptions) -> Result<SandboxInstance> {
        Err(ProviderError::Unsupported)
    }

    async fn start(&self, _session_id: &str) -> Result<()> {
        Err(ProviderError::Unsupported)
    }

    async fn stop(&self, _session_id: &str, _timeout: Duration) -> Result<()> {
        Err(ProviderError::Unsupported)
    }

    async fn remove(&self, _session_id: &str) -> Result<()> {
        Err(ProviderError::Unsupported)
    }

    async fn get(&self, _session_id: &str) -> Result<Option<SandboxInstance>> {
        Err(ProviderError::Unsupported)
    }

    async fn list(&self) -> Result<Vec<SandboxInstance>> {
        Err(ProviderError::Unsupported)
    }

    async fn exec(
        &self,
        _session_id: &str,
        _cmd: &[String],
        _opts: ExecOptions,
    ) -> Result<ExecResult> {
        Err(ProviderError::Unsupported)
    }

    async fn attach(&self, _session_id: &str, _opts: AttachOptions) -> Result<AttachHandle> {
        Err(ProviderError::Unsupported)
    }

    async fn http_client(&self, _session_id: &str) -> Result<SandboxHttpClient> {
        Err(ProviderError::Unsupported)
    }

    async fn get_secret(&self, _session_id: &str, _name: &str) -> Result<String> {
        Err(ProviderError::Unsupported)
    }

    async fn close(&self) -> Result<()> {
        Err(ProviderError::Unsupported)
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Err(ProviderError::Unsupported)
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn status(&self) -> ProviderStatus {
        ProviderStatus::failed("virtual machine backend is not available on this platform")
    }
}
