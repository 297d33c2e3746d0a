//! vaulthost provisioning runtime
//!
//! Brings a machine from bare OS to a running encrypted-storage-backed
//! service host: an idempotent orchestrator over an encrypted volume
//! manager, a capability prober, and a service installer, all driving
//! external tools (`cryptsetup`, `apt-get`, `docker`, `systemctl`) through
//! a common command layer.

pub mod config;
pub mod exec;
pub mod lockfile;
pub mod orchestrator;
pub mod probe;
pub mod services;
pub mod types;
pub mod volume;

pub use config::{GpuMode, ProvisionConfig};
pub use exec::{CommandRunner, DryRunRunner, ExecOutput, HostRunner};
pub use lockfile::LockFile;
pub use orchestrator::{Orchestrator, ProvisionOptions, ProvisionReport, StepOutcome};
pub use probe::{CapabilityProber, HostProber};
pub use services::{ServiceHandle, ServiceInstaller};
pub use types::*;
pub use volume::{key_fingerprint, VolumeManager};
