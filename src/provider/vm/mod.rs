// Virtual-machine backend, available only where the host has the required
// virtualization facility. On other platforms the stub implementation
// answers every operation with the same capability-unavailable error, so
// callers never need platform-conditional code.

pub mod unsupported;

#[cfg(target_os = "linux")]
pub mod backend;
#[cfg(target_os = "linux")]
pub mod manager;

pub use unsupported::UnsupportedVmProvider;

#[cfg(target_os = "linux")]
pub use backend::VmProvider;
#[cfg(target_os = "linux")]
pub use manager::{VmManager, VmRecord};

use std::path::Path;
use std::sync::Arc;

use crate::config::VmConfig;
use crate::provider::error::Result;
use crate::provider::provider_trait::SandboxProvider;

/// Build the VM provider appropriate for this platform.
#[cfg(target_os = "linux")]
pub fn new_vm_provider(config: &VmConfig, data_dir: &Path) -> Result<Arc<dyn SandboxProvider>> {
    Ok(Arc::new(VmProvider::new(config.clone(), data_dir)?))
}

#[cfg(not(target_os = "linux"))]
pub fn new_vm_provider(config: &VmConfig, _data_dir: &Path) -> Result<Arc<dyn SandboxProvider>> {
    Ok(Arc::new(UnsupportedVmProvider::new(&config.image)))
}
