//! Core types and data structures for the provisioning runtime

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub mod error;

pub use error::*;

/// GPU vendor detected on the host.
///
/// `Amd` is detected and reported but treated as unsupported for
/// acceleration: the service environment it produces is identical to
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuVendor {
    None,
    Nvidia,
    Amd,
}

impl GpuVendor {
    /// Whether services may enable hardware acceleration for this vendor.
    pub fn acceleration_supported(self) -> bool {
        matches!(self, GpuVendor::Nvidia)
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::None => write!(f, "none"),
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
        }
    }
}

/// Name of a managed service, unique per host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a managed service is supervised on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// A systemd unit written under the unit directory.
    SystemdUnit,
    /// A container managed through the docker CLI.
    DockerContainer,
}

/// Restart policy applied to a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_systemd_str(self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "no",
        }
    }

    pub fn as_docker_str(self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "no",
        }
    }
}

/// Snapshot of host state taken by the prober at orchestrator start.
///
/// Read-only input to the orchestrator: transitions whose target state the
/// snapshot already shows are skipped instead of re-executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub gpu_vendor: GpuVendor,
    pub volume_exists: bool,
    pub volume_open: bool,
    pub volume_mounted: bool,
    pub key_present: bool,
    pub packages_installed: bool,
    pub services_registered: BTreeSet<ServiceName>,
}

impl SystemState {
    /// State of a machine nothing has been provisioned on yet.
    pub fn fresh() -> Self {
        Self {
            gpu_vendor: GpuVendor::None,
            volume_exists: false,
            volume_open: false,
            volume_mounted: false,
            key_present: false,
            packages_installed: false,
            services_registered: BTreeSet::new(),
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Target configuration of the encrypted volume. Immutable for the duration
/// of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVolumeSpec {
    /// File backing the encrypted container.
    pub backing_path: PathBuf,
    /// Exact size of the backing file in bytes.
    pub size_bytes: u64,
    /// Key material file, owner-read/write only.
    pub key_path: PathBuf,
    /// Name of the device-mapper node the container opens into.
    pub mapper_name: String,
    /// Where the decrypted filesystem is mounted.
    pub mount_path: PathBuf,
    /// Filesystem created on first use of the mapped device.
    pub filesystem_type: String,
}

impl EncryptedVolumeSpec {
    /// Path of the mapped device once the container is open.
    pub fn mapper_device(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.mapper_name)
    }
}

/// Definition of one managed service, built once per run from configuration
/// plus the probed GPU vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: ServiceName,
    pub kind: ServiceKind,
    /// For units: the ExecStart command line. For containers: the command
    /// passed to the image (usually empty).
    pub exec_command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    /// Services (by name) that must be active before this one starts.
    pub dependencies: BTreeSet<ServiceName>,
    /// Container image, for `DockerContainer` services.
    #[serde(default)]
    pub image: Option<String>,
    /// Port publications (`host:container`), for container services.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Bind mounts (`host:container`), for container services.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Extra `docker run` arguments (e.g. `--gpus all`), derived from the
    /// probed GPU vendor.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Liveness of a managed service as reported by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provisioning step, named for failure reporting and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Probe,
    Packages,
    BackingFile,
    Key,
    Container,
    OpenAndMount,
    DockerRoot,
    Services,
    Verify,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Probe => "probe",
            Step::Packages => "packages",
            Step::BackingFile => "backing-file",
            Step::Key => "key",
            Step::Container => "container",
            Step::OpenAndMount => "open-and-mount",
            Step::DockerRoot => "docker-root",
            Step::Services => "services",
            Step::Verify => "verify",
        };
        write!(f, "{}", name)
    }
}

/// States of the orchestrator state machine.
///
/// `Failed` is absorbing: it records which step failed and why, and the
/// machine state it leaves behind is safe to resume from by re-running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionState {
    Init,
    Probed,
    PackagesReady,
    VolumeReady,
    ServicesReady,
    Done,
    Failed { step: Step, cause: String },
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionState::Init => write!(f, "init"),
            ProvisionState::Probed => write!(f, "probed"),
            ProvisionState::PackagesReady => write!(f, "packages-ready"),
            ProvisionState::VolumeReady => write!(f, "volume-ready"),
            ProvisionState::ServicesReady => write!(f, "services-ready"),
            ProvisionState::Done => write!(f, "done"),
            ProvisionState::Failed { step, cause } => {
                write!(f, "failed at {}: {}", step, cause)
            }
        }
    }
}
