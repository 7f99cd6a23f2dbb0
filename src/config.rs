use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Web server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8877
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default = "default_docker_image")]
    pub image: String,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// Port the in-sandbox agent listens on; `http_client` binds to it.
    #[serde(default = "default_sandbox_port")]
    pub sandbox_port: u16,
}

fn default_docker_image() -> String {
    "denbox/sandbox:latest".into()
}
fn default_network_mode() -> String {
    "bridge".into()
}
fn default_sandbox_port() -> u16 {
    8080
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_docker_image(),
            network_mode: default_network_mode(),
            sandbox_port: default_sandbox_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    #[serde(default = "default_vm_image")]
    pub image: String,
    /// Base URL the downloader fetches kernel/rootfs artifacts from.
    #[serde(default = "default_artifact_base_url")]
    pub artifact_base_url: String,
    /// Operator/test override: skip the downloader and use these paths.
    pub kernel_path: Option<PathBuf>,
    pub disk_path: Option<PathBuf>,
    #[serde(default = "default_hypervisor_bin")]
    pub hypervisor_bin: PathBuf,
    #[serde(default = "default_vm_cpus")]
    pub cpus: u32,
    #[serde(default = "default_vm_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_vm_cmdline")]
    pub cmdline: String,
    /// Port the in-guest agent listens on.
    #[serde(default = "default_sandbox_port")]
    pub guest_port: u16,
    /// First host port used for guest forwarding; VMs get consecutive ports.
    #[serde(default = "default_vm_base_port")]
    pub base_port: u16,
}

fn default_vm_image() -> String {
    "denbox/vm:latest".into()
}
fn default_artifact_base_url() -> String {
    "http://127.0.0.1:9400/artifacts".into()
}
fn default_hypervisor_bin() -> PathBuf {
    PathBuf::from("qemu-system-x86_64")
}
fn default_vm_cpus() -> u32 {
    2
}
fn default_vm_memory_mb() -> u32 {
    2048
}
fn default_vm_cmdline() -> String {
    "console=ttyS0 root=/dev/vda rw".into()
}
fn default_vm_base_port() -> u16 {
    9500
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image: default_vm_image(),
            artifact_base_url: default_artifact_base_url(),
            kernel_path: None,
            disk_path: None,
            hypervisor_bin: default_hypervisor_bin(),
            cpus: default_vm_cpus(),
            memory_mb: default_vm_memory_mb(),
            cmdline: default_vm_cmdline(),
            guest_port: default_sandbox_port(),
            base_port: default_vm_base_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// External collaborators & reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Base URL of the agent process answering status queries.
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
}

fn default_agent_base_url() -> String {
    "http://127.0.0.1:3051".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Data directory for persisted state, job payloads and the image
    /// cache. Defaults to `~/.denbox`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Which backend serves sessions: "docker" or "vm".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_provider() -> String {
    "docker".into()
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".denbox")
            .join("config.toml")
    }

    /// Load config from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                provider: default_provider(),
                ..Default::default()
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".denbox")
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}
