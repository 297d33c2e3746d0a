//! Capability prober
//!
//! Builds the [`SystemState`] snapshot the orchestrator reconciles against.
//! Probing is side-effect-free and never fails fatally: an undetectable GPU
//! degrades to [`GpuVendor::None`] and an unreadable check degrades to
//! "absent", so provisioning can proceed in CPU-only mode.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::exec::CommandRunner;
use crate::types::{EncryptedVolumeSpec, GpuVendor, ServiceKind, ServiceName, SystemState};

/// Produces a snapshot of current host state.
#[async_trait]
pub trait CapabilityProber: Send + Sync {
    async fn probe(&self) -> SystemState;
}

/// Probes the real host: hardware enumeration, filesystem stat, mount-table
/// inspection, and service-registration queries.
pub struct HostProber {
    runner: Arc<dyn CommandRunner>,
    volume: EncryptedVolumeSpec,
    packages: Vec<String>,
    services: Vec<(ServiceName, ServiceKind)>,
    mount_table: PathBuf,
}

impl HostProber {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        volume: EncryptedVolumeSpec,
        packages: Vec<String>,
        services: Vec<(ServiceName, ServiceKind)>,
    ) -> Self {
        Self {
            runner,
            volume,
            packages,
            services,
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }

    /// Override the mount table location (tests).
    pub fn with_mount_table(mut self, path: PathBuf) -> Self {
        self.mount_table = path;
        self
    }

    async fn detect_gpu(&self) -> GpuVendor {
        // nvidia-smi only answers when the NVIDIA driver stack is alive,
        // which is the actual requirement for acceleration.
        match self.runner.run("nvidia-smi", &["-L"]).await {
            Ok(out) if out.success && out.stdout.contains("GPU") => {
                return GpuVendor::Nvidia;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "nvidia-smi probe failed"),
        }

        match self.runner.run("lspci", &[]).await {
            Ok(out) if out.success => {
                for line in out.stdout.lines() {
                    if !(line.contains("VGA") || line.contains("3D controller")) {
                        continue;
                    }
                    let upper = line.to_uppercase();
                    if upper.contains("NVIDIA") {
                        return GpuVendor::Nvidia;
                    }
                    if upper.contains("AMD") || upper.contains("ATI") || upper.contains("RADEON") {
                        return GpuVendor::Amd;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "lspci probe failed"),
        }

        GpuVendor::None
    }

    fn is_mounted(&self, mount_path: &Path) -> bool {
        let table = match std::fs::read_to_string(&self.mount_table) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(error = %e, table = %self.mount_table.display(), "mount table unreadable");
                return false;
            }
        };
        let wanted = mount_path.to_string_lossy();
        table.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|target| unescape_mount_field(target) == wanted)
                .unwrap_or(false)
        })
    }

    async fn packages_installed(&self) -> bool {
        for pkg in &self.packages {
            match self.runner.run("dpkg", &["-s", pkg]).await {
                Ok(out) if out.success => {}
                _ => return false,
            }
        }
        true
    }

    async fn service_registered(&self, name: &ServiceName, kind: ServiceKind) -> bool {
        let result = match kind {
            ServiceKind::SystemdUnit => {
                self.runner
                    .run("systemctl", &["is-enabled", name.as_str()])
                    .await
            }
            ServiceKind::DockerContainer => {
                self.runner
                    .run("docker", &["inspect", "--type", "container", name.as_str()])
                    .await
            }
        };
        matches!(result, Ok(out) if out.success)
    }
}

/// `/proc/mounts` escapes spaces, tabs, newlines, and backslashes as octal.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 && digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            if let Ok(byte) = u8::from_str_radix(&digits, 8) {
                out.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl CapabilityProber for HostProber {
    async fn probe(&self) -> SystemState {
        let gpu_vendor = self.detect_gpu().await;
        let volume_exists = self.volume.backing_path.exists();
        let key_present = self.volume.key_path.exists();
        let volume_open = self.volume.mapper_device().exists();
        let volume_mounted = self.is_mounted(&self.volume.mount_path);
        let packages_installed = self.packages_installed().await;

        let mut services_registered = BTreeSet::new();
        for (name, kind) in &self.services {
            if self.service_registered(name, *kind).await {
                services_registered.insert(name.clone());
            }
        }

        let state = SystemState {
            gpu_vendor,
            volume_exists,
            volume_open,
            volume_mounted,
            key_present,
            packages_installed,
            services_registered,
        };
        tracing::debug!(?state, "probed host state");
        state
    }
}
