// Hypervisor-backed sandbox provider.
//
// Construction never blocks: with explicit kernel/disk paths the VM manager
// is initialized immediately and its error surfaces synchronously; otherwise
// the provider owns an image downloader and becomes ready asynchronously.
// Any VM-creating call before that point fails with a "not ready" error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use crate::config::VmConfig;
use crate::image::{DownloadState, ImageDownloader};
use crate::provider::error::{ProviderError, Result};
use crate::provider::provider_trait::SandboxProvider;
use crate::provider::types::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, ProviderStatus,
    SandboxHttpClient, SandboxInstance, MANAGED_LABEL, SESSION_LABEL,
};

use super::manager::{VmManager, VmRecord};

/// Sandbox provider that serves sessions from lightweight VMs.
pub struct VmProvider {
    config: VmConfig,
    data_dir: PathBuf,
    downloader: Option<Arc<ImageDownloader>>,
    manager: Arc<RwLock<Option<Arc<VmManager>>>>,
    init_error: Arc<Mutex<Option<String>>>,
    warm: tokio::sync::Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl VmProvider {
    pub fn new(config: VmConfig, data_dir: &Path) -> Result<Self> {
        let run_dir = data_dir.join("vms");
        let init_error = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        // Explicit artifact paths (operator/test override): initialize now
        // and surface the error synchronously.
        if let (Some(kernel), Some(disk)) = (&config.kernel_path, &config.disk_path) {
            let vm_manager = VmManager::new(&config, kernel.clone(), disk.clone(), run_dir)?;
            return Ok(Self {
                config,
                data_dir: data_dir.to_path_buf(),
                downloader: None,
                manager: Arc::new(RwLock::new(Some(Arc::new(vm_manager)))),
                init_error,
                warm: tokio::sync::Mutex::new(Vec::new()),
                cancel,
            });
        }

        let manager = Arc::new(RwLock::new(None));
        let downloader = Arc::new(ImageDownloader::new(
            &config.image,
            data_dir,
            &config.artifact_base_url,
        ));
        downloader.start();

        {
            let downloader = Arc::clone(&downloader);
            let manager = Arc::clone(&manager);
            let init_error = Arc::clone(&init_error);
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = downloader.wait(&cancel).await {
                    error!(error = %e, "VM image download did not complete");
                    return;
                }
                let Some((kernel, disk)) = downloader.get_paths() else {
                    return;
                };
                match VmManager::new(&config, kernel, disk, run_dir) {
                    Ok(vm_manager) => {
                        info!(image = %config.image, "VM backend ready");
                        *manager.write().await = Some(Arc::new(vm_manager));
                    }
                    Err(e) => {
                        error!(error = %e, "VM manager initialization failed");
                        *init_error.lock().unwrap() = Some(e.to_string());
                    }
                }
            });
        }

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            downloader: Some(downloader),
            manager,
            init_error,
            warm: tokio::sync::Mutex::new(Vec::new()),
            cancel,
        })
    }

    async fn ensure_manager(&self) -> Result<Arc<VmManager>> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(Arc::clone(manager));
        }
        let status = self.status();
        Err(ProviderError::NotReady(format!(
            "VM backend is {}: {}",
            status.state, status.message
        )))
    }

    /// Pre-boot a VM so the next `create` is instant.
    pub async fn warm_vm(&self) -> Result<()> {
        let manager = self.ensure_manager().await?;
        let record = manager.create_vm("").await?;
        self.warm.lock().await.push(record.id);
        Ok(())
    }

    fn instance_from_record(&self, record: &VmRecord) -> SandboxInstance {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SESSION_LABEL.to_string(), record.session_id.clone());
        SandboxInstance {
            id: record.id.clone(),
            session_id: record.session_id.clone(),
            image: self.config.image.clone(),
            state: record.state,
            labels,
            created_at: record.created_at,
        }
    }

    async fn agent_client(&self, session_id: &str) -> Result<SandboxHttpClient> {
        let manager = self.ensure_manager().await?;
        let record = manager
            .get_by_session(session_id)
            .await
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let base = format!("http://127.0.0.1:{}", record.host_port);
        let url = Url::parse(&base)
            .map_err(|e| ProviderError::OperationFailed(format!("invalid base URL: {}", e)))?;
        Ok(SandboxHttpClient::new(url))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestExecResponse {
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[async_trait]
impl SandboxProvider for VmProvider {
    async fn create(&self, session_id: &str, _opts: CreateOptions) -> Result<SandboxInstance> {
        let manager = self.ensure_manager().await?;

        // Prefer a pre-booted warm VM.
        let warm_id = self.warm.lock().await.pop();
        let record = match warm_id {
            Some(id) => manager.assign_session(&id, session_id).await?,
            None => manager.create_vm(session_id).await?,
        };
        Ok(self.instance_from_record(&record))
    }

    async fn start(&self, session_id: &str) -> Result<()> {
        let manager = self.ensure_manager().await?;
        manager.start_vm(session_id).await
    }

    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let manager = self.ensure_manager().await?;
        manager.stop_vm(session_id, timeout).await
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        let manager = self.ensure_manager().await?;
        manager.remove_vm(session_id).await
    }

    async fn get(&self, session_id: &str) -> Result<Option<SandboxInstance>> {
        let manager = self.ensure_manager().await?;
        Ok(manager
            .get_by_session(session_id)
            .await
            .map(|record| self.instance_from_record(&record)))
    }

    async fn list(&self) -> Result<Vec<SandboxInstance>> {
        let manager = self.ensure_manager().await?;
        Ok(manager
            .list()
            .await
            .iter()
            .map(|record| self.instance_from_record(record))
            .collect())
    }

    async fn exec(
        &self,
        session_id: &str,
        cmd: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult> {
        let client = self.agent_client(session_id).await?;
        let start = std::time::Instant::now();

        let body = serde_json::json!({
            "cmd": cmd,
            "env": opts.env,
            "workingDir": opts.working_dir,
            "timeoutSecs": opts.timeout.map(|t| t.as_secs()),
        });
        let response = client
            .client()
            .post(client.url("/exec"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("guest agent unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| ProviderError::ExecFailed(format!("guest exec rejected: {}", e)))?;

        let result: GuestExecResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("invalid guest response: {}", e)))?;

        Ok(ExecResult {
            exit_code: result.exit_code,
            stdout: result.stdout.into_bytes(),
            stderr: result.stderr.into_bytes(),
            duration: start.elapsed(),
        })
    }

    async fn attach(&self, session_id: &str, _opts: AttachOptions) -> Result<AttachHandle> {
        let manager = self.ensure_manager().await?;
        let (vm_id, stream) = manager.console_stream(session_id).await?;
        let (read_half, mut write_half) = stream.into_split();

        // Wrap the write half so the handle owns both directions.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(16);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        let input = Box::pin(ChannelWriter { tx });

        Ok(AttachHandle {
            id: vm_id,
            input,
            output: Box::pin(ReaderStream::new(read_half)),
        })
    }

    async fn http_client(&self, session_id: &str) -> Result<SandboxHttpClient> {
        self.agent_client(session_id).await
    }

    async fn get_secret(&self, session_id: &str, name: &str) -> Result<String> {
        let result = self
            .exec(
                session_id,
                &["printenv".to_string(), name.to_string()],
                ExecOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Err(ProviderError::SecretNotFound(name.to_string()));
        }
        Ok(String::from_utf8_lossy(&result.stdout).trim().to_string())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(manager) = self.manager.read().await.as_ref() {
            manager.close().await;
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        // Cache check only: present means both artifacts exist and are
        // non-empty under the digest for this reference.
        let probe = ImageDownloader::new(image, &self.data_dir, &self.config.artifact_base_url);
        Ok(probe.check_cache())
    }

    fn image(&self) -> &str {
        &self.config.image
    }

    fn status(&self) -> ProviderStatus {
        if let Some(message) = self.init_error.lock().unwrap().clone() {
            return ProviderStatus::failed(message);
        }
        if self.manager.try_read().map(|m| m.is_some()).unwrap_or(false) {
            return ProviderStatus::ready();
        }
        match &self.downloader {
            Some(downloader) => {
                let progress = downloader.status();
                match progress.state {
                    DownloadState::Ready => {
                        ProviderStatus::downloading("initializing VM manager")
                    }
                    DownloadState::Failed => ProviderStatus::failed(
                        progress
                            .error
                            .unwrap_or_else(|| "image download failed".to_string()),
                    ),
                    _ => ProviderStatus::downloading(format!(
                        "downloading VM image ({} / {} bytes)",
                        progress.bytes_downloaded, progress.total_bytes
                    )),
                }
            }
            None => ProviderStatus::downloading("initializing VM manager"),
        }
    }
}

/// AsyncWrite adapter feeding the console writer task.
struct ChannelWriter {
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
}

impl tokio::io::AsyncWrite for ChannelWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.tx.try_send(bytes::Bytes::copy_from_slice(buf)) {
            Ok(()) => std::task::Poll::Ready(Ok(buf.len())),
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "console write buffer full",
                )))
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "console closed",
                )))
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
