//! Provisioning configuration
//!
//! Loaded from a TOML file when present, with defaults mirroring the
//! classic single-host layout, then overridden by CLI flags. Everything the
//! orchestrator needs for one run is derived from this plus the probed
//! GPU vendor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::types::{
    ConfigError, EncryptedVolumeSpec, GpuVendor, RestartPolicy, ServiceKind, ServiceName,
    ServiceSpec,
};

/// GPU mode requested on the command line. `Auto` defers to the prober,
/// the rest override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    #[default]
    Auto,
    Cpu,
    Nvidia,
    Amd,
}

impl GpuMode {
    /// Resolve the effective vendor from the requested mode and the probed
    /// hardware.
    pub fn resolve(self, probed: GpuVendor) -> GpuVendor {
        match self {
            GpuMode::Auto => probed,
            GpuMode::Cpu => GpuVendor::None,
            GpuMode::Nvidia => GpuVendor::Nvidia,
            GpuMode::Amd => GpuVendor::Amd,
        }
    }
}

impl FromStr for GpuMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(GpuMode::Auto),
            "cpu" => Ok(GpuMode::Cpu),
            "nvidia" => Ok(GpuMode::Nvidia),
            "amd" => Ok(GpuMode::Amd),
            other => Err(ConfigError::Invalid(format!(
                "unknown gpu mode `{}` (expected auto, cpu, nvidia, or amd)",
                other
            ))),
        }
    }
}

/// Encrypted volume section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub backing_file: PathBuf,
    pub key_file: PathBuf,
    pub mapper_name: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
    /// Container size in GiB. Required for `up`; the CLI flag
    /// `--container-size-gb` fills it when the file does not.
    pub size_gib: Option<u64>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            backing_file: PathBuf::from("/opt/vaulthost/vault.img"),
            key_file: PathBuf::from("/root/.vaulthost.key"),
            mapper_name: "vaultllm".to_string(),
            mount_point: PathBuf::from("/mnt/vaultllm"),
            filesystem: "ext4".to_string(),
            size_gib: None,
        }
    }
}

/// Inference daemon (Ollama) section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub service_name: String,
    pub binary: String,
    pub install_url: String,
    pub listen: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            service_name: "ollama".to_string(),
            binary: "ollama".to_string(),
            install_url: "https://ollama.com/install.sh".to_string(),
            listen: "127.0.0.1:11434".to_string(),
        }
    }
}

/// Web front-end (Open WebUI) container section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebUiConfig {
    pub container_name: String,
    pub image: String,
    pub port: u16,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            container_name: "open-webui".to_string(),
            image: "ghcr.io/open-webui/open-webui:main".to_string(),
            port: 3000,
        }
    }
}

/// Managed services section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub ollama: OllamaConfig,
    pub webui: WebUiConfig,
}

/// Host paths the installer manages. Overridable mainly for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    pub unit_dir: PathBuf,
    pub docker_daemon_json: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            docker_daemon_json: PathBuf::from("/etc/docker/daemon.json"),
            lock_file: PathBuf::from("/run/vaulthost.lock"),
        }
    }
}

fn default_packages() -> Vec<String> {
    vec![
        "cryptsetup".to_string(),
        "docker.io".to_string(),
        "curl".to_string(),
        "ca-certificates".to_string(),
    ]
}

/// Complete provisioning configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub volume: VolumeConfig,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    pub services: ServicesConfig,
    pub gpu_mode: GpuMode,
    pub paths: HostPaths,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            volume: VolumeConfig::default(),
            packages: default_packages(),
            services: ServicesConfig::default(),
            gpu_mode: GpuMode::Auto,
            paths: HostPaths::default(),
        }
    }
}

impl ProvisionConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `path` when given, otherwise `vaulthost.toml` if present,
    /// otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new("vaulthost.toml");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volume.mapper_name.is_empty() || self.volume.mapper_name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "mapper name `{}` must be a non-empty device-mapper node name",
                self.volume.mapper_name
            )));
        }
        if !self.volume.backing_file.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "backing file must be an absolute path: {}",
                self.volume.backing_file.display()
            )));
        }
        if !self.volume.mount_point.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "mount point must be an absolute path: {}",
                self.volume.mount_point.display()
            )));
        }
        if let Some(size) = self.volume.size_gib {
            if size == 0 {
                return Err(ConfigError::Invalid(
                    "container size must be at least 1 GiB".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the immutable volume spec for this run.
    pub fn volume_spec(&self) -> Result<EncryptedVolumeSpec, ConfigError> {
        let size_gib = self
            .volume
            .size_gib
            .ok_or_else(|| ConfigError::MissingField("volume.size_gib".to_string()))?;
        Ok(EncryptedVolumeSpec {
            backing_path: self.volume.backing_file.clone(),
            size_bytes: size_gib << 30,
            key_path: self.volume.key_file.clone(),
            mapper_name: self.volume.mapper_name.clone(),
            mount_path: self.volume.mount_point.clone(),
            filesystem_type: self.volume.filesystem.clone(),
        })
    }

    /// Service definitions for this run, with environment reflecting the
    /// effective GPU vendor. Order is start order: dependencies first.
    pub fn service_specs(&self, gpu: GpuVendor) -> Vec<ServiceSpec> {
        let mount = &self.volume.mount_point;

        let mut ollama_env = BTreeMap::new();
        ollama_env.insert("OLLAMA_HOST".to_string(), self.services.ollama.listen.clone());
        ollama_env.insert(
            "OLLAMA_MODELS".to_string(),
            mount.join("ollama/models").display().to_string(),
        );
        if gpu.acceleration_supported() {
            ollama_env.insert("OLLAMA_FLASH_ATTENTION".to_string(), "1".to_string());
        } else {
            ollama_env.insert("OLLAMA_FLASH_ATTENTION".to_string(), "0".to_string());
            ollama_env.insert("CUDA_VISIBLE_DEVICES".to_string(), String::new());
            ollama_env.insert("OLLAMA_NO_GPU".to_string(), "1".to_string());
        }

        let ollama = ServiceSpec {
            name: ServiceName::new(&self.services.ollama.service_name),
            kind: ServiceKind::SystemdUnit,
            exec_command: vec![
                format!("/usr/local/bin/{}", self.services.ollama.binary),
                "serve".to_string(),
            ],
            environment: ollama_env,
            restart_policy: RestartPolicy::Always,
            dependencies: BTreeSet::from([ServiceName::new("docker")]),
            image: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            extra_args: Vec::new(),
        };

        let mut webui_env = BTreeMap::new();
        webui_env.insert(
            "OLLAMA_BASE_URL".to_string(),
            format!("http://{}", self.services.ollama.listen),
        );
        let webui = ServiceSpec {
            name: ServiceName::new(&self.services.webui.container_name),
            kind: ServiceKind::DockerContainer,
            exec_command: Vec::new(),
            environment: webui_env,
            restart_policy: RestartPolicy::Always,
            dependencies: BTreeSet::from([
                ServiceName::new("docker"),
                ServiceName::new(&self.services.ollama.service_name),
            ]),
            image: Some(self.services.webui.image.clone()),
            ports: vec![format!("{}:8080", self.services.webui.port)],
            volumes: vec![format!(
                "{}:/app/backend/data",
                mount.join("open-webui").display()
            )],
            extra_args: if gpu.acceleration_supported() {
                vec!["--gpus".to_string(), "all".to_string()]
            } else {
                Vec::new()
            },
        };

        vec![ollama, webui]
    }

    /// (name, kind) pairs the prober checks registration for.
    pub fn service_probe_targets(&self) -> Vec<(ServiceName, ServiceKind)> {
        vec![
            (
                ServiceName::new(&self.services.ollama.service_name),
                ServiceKind::SystemdUnit,
            ),
            (
                ServiceName::new(&self.services.webui.container_name),
                ServiceKind::DockerContainer,
            ),
        ]
    }
}
