// Container backend for the sandbox provider contract, built on the Docker
// API. Each session gets one container labelled with its session id; the
// label is what reconciliation uses to map live containers back to sessions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DockerConfig;

use super::error::{ProviderError, Result};
use super::provider_trait::SandboxProvider;
use super::types::{
    AttachHandle, AttachOptions, CreateOptions, ExecOptions, ExecResult, SandboxHttpClient,
    SandboxInstance, SandboxState, MANAGED_LABEL, SESSION_LABEL,
};

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Sandbox provider backed by a container runtime.
pub struct DockerProvider {
    docker: Docker,
    image: String,
    network_mode: String,
    sandbox_port: u16,
}

impl DockerProvider {
    pub fn new(config: &DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ProviderError::CreationFailed(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            network_mode: config.network_mode.clone(),
            sandbox_port: config.sandbox_port,
        })
    }

    fn container_name(session_id: &str) -> String {
        // fresh suffix so a recreated sandbox never reuses the old name
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("denbox-{}-{}", session_id, &suffix[..8])
    }

    fn session_filter(session_id: &str) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", SESSION_LABEL, session_id)],
        );
        filters
    }

    async fn find_container(&self, session_id: &str) -> Result<Option<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: Self::session_filter(session_id),
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().next())
    }

    async fn instance_from_id(&self, container_id: &str) -> Result<SandboxInstance> {
        let info = self.docker.inspect_container(container_id, None).await?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let config = info.config.unwrap_or_default();
        let labels = config.labels.unwrap_or_default();
        let session_id = labels.get(SESSION_LABEL).cloned().unwrap_or_default();
        let created_at = info
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(SandboxInstance {
            id: info.id.unwrap_or_else(|| container_id.to_string()),
            session_id,
            image: config.image.unwrap_or_default(),
            state: if running {
                SandboxState::Running
            } else {
                SandboxState::Stopped
            },
            labels,
            created_at,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(%image, "pulling sandbox image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn create(&self, session_id: &str, opts: CreateOptions) -> Result<SandboxInstance> {
        let image = opts.image.unwrap_or_else(|| self.image.clone());

        if !self.image_exists(&image).await? {
            self.pull_image(&image).await?;
        }

        let mut labels = opts.labels;
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());

        let binds = opts
            .workspace_path
            .as_ref()
            .map(|p| vec![format!("{}:/workspace", p)]);

        let host_config = HostConfig {
            network_mode: Some(self.network_mode.clone()),
            binds,
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            labels: Some(labels),
            env: if opts.env.is_empty() {
                None
            } else {
                Some(opts.env.clone())
            },
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Self::container_name(session_id),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                ProviderError::CreationFailed(format!("Failed to create container: {}", e))
            })?;

        if opts.start {
            if let Err(e) = self
                .docker
                .start_container(&created.id, None::<StartContainerOptions<String>>)
                .await
            {
                // do not leak the half-created container
                let _ = self
                    .docker
                    .remove_container(
                        &created.id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                return Err(ProviderError::CreationFailed(format!(
                    "Failed to start container: {}",
                    e
                )));
            }
        }

        debug!(session = session_id, container = %created.id, "created sandbox container");
        self.instance_from_id(&created.id).await
    }

    async fn start(&self, session_id: &str) -> Result<()> {
        let container = self
            .find_container(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let id = container.id.unwrap_or_default();
        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let container = self
            .find_container(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let id = container.id.unwrap_or_default();
        self.docker
            .stop_container(
                &id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        let Some(container) = self.find_container(session_id).await? else {
            // idempotent: nothing to remove is fine
            debug!(session = session_id, "remove: no container present");
            return Ok(());
        };
        let id = container.id.unwrap_or_default();
        self.docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        info!(session = session_id, container = %id, "removed sandbox container");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SandboxInstance>> {
        match self.find_container(session_id).await? {
            Some(container) => {
                let id = container.id.unwrap_or_default();
                Ok(Some(self.instance_from_id(&id).await?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<SandboxInstance>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut instances = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container.id.unwrap_or_default();
            match self.instance_from_id(&id).await {
                Ok(instance) => instances.push(instance),
                // container can vanish between list and inspect
                Err(e) => warn!(container = %id, error = %e, "skipping container during list"),
            }
        }
        Ok(instances)
    }

    async fn exec(
        &self,
        session_id: &str,
        cmd: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult> {
        let container = self
            .find_container(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let container_id = container.id.unwrap_or_default();

        let exec = self
            .docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    env: if opts.env.is_empty() {
                        None
                    } else {
                        Some(opts.env.clone())
                    },
                    working_dir: opts.working_dir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to create exec: {}", e)))?;

        let start = std::time::Instant::now();
        let deadline = opts.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);

        let started = tokio_timeout(deadline, self.docker.start_exec(&exec.id, None))
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(|e| ProviderError::ExecFailed(format!("Exec failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend_from_slice(&message);
                        }
                        _ => {}
                    }
                }
            };
            tokio_timeout(deadline, drain)
                .await
                .map_err(|_| ProviderError::Timeout)?;
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn attach(&self, session_id: &str, opts: AttachOptions) -> Result<AttachHandle> {
        let container = self
            .find_container(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let container_id = container.id.unwrap_or_default();

        let command = if opts.command.is_empty() {
            vec!["/bin/sh".to_string()]
        } else {
            opts.command.clone()
        };

        let exec = self
            .docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(opts.tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to create exec: {}", e)))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to attach: {}", e)))?
        {
            StartExecResults::Attached { output, input } => {
                let output = output.map(|item| {
                    item.map(|log| log.into_bytes())
                        .map_err(std::io::Error::other)
                });
                Ok(AttachHandle {
                    id: exec.id,
                    input,
                    output: Box::pin(output),
                })
            }
            StartExecResults::Detached => Err(ProviderError::ExecFailed(
                "exec started detached, no interactive stream available".to_string(),
            )),
        }
    }

    async fn http_client(&self, session_id: &str) -> Result<SandboxHttpClient> {
        let container = self
            .find_container(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;
        let container_id = container.id.unwrap_or_default();
        let info = self.docker.inspect_container(&container_id, None).await?;

        let settings = info.network_settings.ok_or_else(|| {
            ProviderError::OperationFailed("container has no network settings".to_string())
        })?;
        let ip = settings
            .ip_address
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                settings.networks.and_then(|networks| {
                    networks
                        .into_values()
                        .find_map(|n| n.ip_address.filter(|ip| !ip.is_empty()))
                })
            })
            .ok_or_else(|| {
                ProviderError::OperationFailed(
                    "container has no internal IP address".to_string(),
                )
            })?;

        let base = format!("http://{}:{}", ip, self.sandbox_port);
        let url = Url::parse(&base)
            .map_err(|e| ProviderError::OperationFailed(format!("invalid base URL: {}", e)))?;
        Ok(SandboxHttpClient::new(url))
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
        // the Docker client holds no per-provider server-side state
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn image(&self) -> &str {
        &self.image
    }
}
