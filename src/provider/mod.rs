// Sandbox provider abstraction and its backends.
//
// Every backend (Docker containers, hypervisor VMs, the unsupported-platform
// stub) implements the same `SandboxProvider` contract so callers never need
// backend- or platform-conditional code.

pub mod docker;
pub mod error;
pub mod provider_trait;
pub mod types;
pub mod vm;

pub use docker::DockerProvider;
pub use error::{ProviderError, Result};
pub use provider_trait::SandboxProvider;
pub use types::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, ProviderStatus,
    SandboxHttpClient, SandboxInstance, SandboxState, MANAGED_LABEL, SESSION_LABEL,
};
