// VM process management: spawns one hypervisor process per VM and tracks
// its sockets and forwarded agent port.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VmConfig;
use crate::provider::error::{ProviderError, Result};
use crate::provider::types::SandboxState;

/// One VM as tracked by the manager.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: String,
    pub session_id: String,
    pub state: SandboxState,
    pub serial_socket: PathBuf,
    pub qmp_socket: PathBuf,
    /// Host port forwarded to the in-guest agent port.
    pub host_port: u16,
    pub created_at: DateTime<Utc>,
}

struct VmEntry {
    record: VmRecord,
    child: Option<Child>,
}

/// Owns the hypervisor processes backing VM sandboxes.
pub struct VmManager {
    hypervisor_bin: PathBuf,
    kernel_path: PathBuf,
    disk_path: PathBuf,
    cmdline: String,
    cpus: u32,
    memory_mb: u32,
    guest_port: u16,
    run_dir: PathBuf,
    next_port: AtomicU16,
    vms: RwLock<HashMap<String, VmEntry>>,
}

impl VmManager {
    /// Validate artifacts and prepare the run directory. Fails synchronously
    /// so a bad kernel/disk override surfaces at construction time.
    pub fn new(
        config: &VmConfig,
        kernel_path: PathBuf,
        disk_path: PathBuf,
        run_dir: PathBuf,
    ) -> Result<Self> {
        for (what, path) in [("kernel", &kernel_path), ("disk", &disk_path)] {
            let meta = std::fs::metadata(path).map_err(|e| {
                ProviderError::CreationFailed(format!(
                    "{} image {} is not readable: {}",
                    what,
                    path.display(),
                    e
                ))
            })?;
            if meta.len() == 0 {
                return Err(ProviderError::CreationFailed(format!(
                    "{} image {} is empty",
                    what,
                    path.display()
                )));
            }
        }
        std::fs::create_dir_all(&run_dir)?;

        Ok(Self {
            hypervisor_bin: config.hypervisor_bin.clone(),
            kernel_path,
            disk_path,
            cmdline: config.cmdline.clone(),
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            guest_port: config.guest_port,
            run_dir,
            next_port: AtomicU16::new(config.base_port),
            vms: RwLock::new(HashMap::new()),
        })
    }

    fn spawn_vm(&self, record: &VmRecord) -> Result<Child> {
        let mut command = Command::new(&self.hypervisor_bin);
        command
            .arg("-kernel")
            .arg(&self.kernel_path)
            .arg("-append")
            .arg(&self.cmdline)
            .arg("-drive")
            .arg(format!(
                "file={},format=raw,if=virtio",
                self.disk_path.display()
            ))
            .arg("-smp")
            .arg(self.cpus.to_string())
            .arg("-m")
            .arg(format!("{}M", self.memory_mb))
            .arg("-nographic")
            .arg("-serial")
            .arg(format!(
                "unix:{},server,nowait",
                record.serial_socket.display()
            ))
            .arg("-qmp")
            .arg(format!("unix:{},server,nowait", record.qmp_socket.display()))
            .arg("-netdev")
            .arg(format!(
                "user,id=n0,hostfwd=tcp:127.0.0.1:{}-:{}",
                record.host_port, self.guest_port
            ))
            .arg("-device")
            .arg("virtio-net-pci,netdev=n0")
            .kill_on_drop(true);

        command.spawn().map_err(|e| {
            ProviderError::CreationFailed(format!(
                "failed to spawn hypervisor {}: {}",
                self.hypervisor_bin.display(),
                e
            ))
        })
    }

    /// Create and boot a new VM. `session_id` may be empty for a warm VM
    /// that gets a session assigned later.
    pub async fn create_vm(&self, session_id: &str) -> Result<VmRecord> {
        let id = format!("vm-{}", Uuid::new_v4().simple());
        let vm_dir = self.run_dir.join(&id);
        tokio::fs::create_dir_all(&vm_dir).await?;

        let record = VmRecord {
            id: id.clone(),
            session_id: session_id.to_string(),
            state: SandboxState::Running,
            serial_socket: vm_dir.join("serial.sock"),
            qmp_socket: vm_dir.join("qmp.sock"),
            host_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
        };

        let child = match self.spawn_vm(&record) {
            Ok(child) => child,
            Err(e) => {
                // no partially-created VM left behind
                let _ = tokio::fs::remove_dir_all(&vm_dir).await;
                return Err(e);
            }
        };

        info!(vm = %id, session = session_id, port = record.host_port, "booted VM");
        let mut vms = self.vms.write().await;
        vms.insert(
            id,
            VmEntry {
                record: record.clone(),
                child: Some(child),
            },
        );
        Ok(record)
    }

    /// Bind a warm VM to a session.
    pub async fn assign_session(&self, vm_id: &str, session_id: &str) -> Result<VmRecord> {
        let mut vms = self.vms.write().await;
        let entry = vms
            .get_mut(vm_id)
            .ok_or_else(|| ProviderError::NotFound(vm_id.to_string()))?;
        entry.record.session_id = session_id.to_string();
        Ok(entry.record.clone())
    }

    pub async fn get_by_session(&self, session_id: &str) -> Option<VmRecord> {
        let vms = self.vms.read().await;
        vms.values()
            .map(|entry| &entry.record)
            .find(|record| record.session_id == session_id)
            .cloned()
    }

    /// All session-bound VMs (warm VMs are excluded).
    pub async fn list(&self) -> Vec<VmRecord> {
        let vms = self.vms.read().await;
        vms.values()
            .map(|entry| entry.record.clone())
            .filter(|record| !record.session_id.is_empty())
            .collect()
    }

    pub async fn start_vm(&self, session_id: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let entry = vms
            .values_mut()
            .find(|entry| entry.record.session_id == session_id)
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        if entry.record.state == SandboxState::Running {
            return Ok(());
        }
        let child = self.spawn_vm(&entry.record)?;
        entry.child = Some(child);
        entry.record.state = SandboxState::Running;
        Ok(())
    }

    pub async fn stop_vm(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let mut vms = self.vms.write().await;
        let entry = vms
            .values_mut()
            .find(|entry| entry.record.session_id == session_id)
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        Self::shutdown_child(&entry.record.id, entry.child.take(), timeout).await;
        entry.record.state = SandboxState::Stopped;
        Ok(())
    }

    /// Remove a VM and its run directory. Idempotent for absent sessions.
    pub async fn remove_vm(&self, session_id: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let vm_id = vms
            .values()
            .find(|entry| entry.record.session_id == session_id)
            .map(|entry| entry.record.id.clone());
        let Some(vm_id) = vm_id else {
            debug!(session = session_id, "remove: no VM present");
            return Ok(());
        };
        if let Some(mut entry) = vms.remove(&vm_id) {
            Self::shutdown_child(&vm_id, entry.child.take(), Duration::from_secs(5)).await;
        }
        let _ = tokio::fs::remove_dir_all(self.run_dir.join(&vm_id)).await;
        info!(vm = %vm_id, session = session_id, "removed VM");
        Ok(())
    }

    /// Connect to a VM's serial console.
    pub async fn console_stream(&self, session_id: &str) -> Result<(String, UnixStream)> {
        let record = self
            .get_by_session(session_id)
            .await
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let stream = UnixStream::connect(&record.serial_socket).await.map_err(|e| {
            ProviderError::OperationFailed(format!("failed to open VM console: {}", e))
        })?;
        Ok((record.id, stream))
    }

    /// Kill every VM process; used on provider shutdown.
    pub async fn close(&self) {
        let mut vms = self.vms.write().await;
        for (id, entry) in vms.iter_mut() {
            Self::shutdown_child(id, entry.child.take(), Duration::from_secs(5)).await;
            entry.record.state = SandboxState::Stopped;
        }
    }

    async fn shutdown_child(vm_id: &str, child: Option<Child>, timeout: Duration) {
        let Some(mut child) = child else {
            return;
        };
        if let Err(e) = child.start_kill() {
            warn!(vm = %vm_id, error = %e, "failed to signal VM process");
            return;
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(vm = %vm_id, %status, "VM process exited"),
            Ok(Err(e)) => warn!(vm = %vm_id, error = %e, "error reaping VM process"),
            Err(_) => warn!(vm = %vm_id, "VM process did not exit within timeout"),
        }
    }
}
