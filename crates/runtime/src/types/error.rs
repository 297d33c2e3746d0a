//! Error types for the provisioning runtime

use std::path::PathBuf;
use thiserror::Error;

/// Top-level provisioning error.
///
/// Every fatal error aborts the run; the machine is left in whatever state
/// the last successful idempotent step produced, which is safe to resume
/// from. `exit_code` maps the taxonomy to the CLI's process exit codes.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("precondition not met: {0}")]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    DestructiveActionRefused(#[from] DestructiveActionRefused),

    #[error("external tool failed: {0}")]
    ExternalTool(#[from] ExternalToolError),

    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Process exit code for the CLI: 0 is reserved for `Done`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Precondition(_) | ProvisionError::Volume(_) => 2,
            ProvisionError::DestructiveActionRefused(_) => 3,
            ProvisionError::ExternalTool(_) => 4,
            _ => 1,
        }
    }
}

/// Probe failures. Non-fatal by design: an undetectable capability degrades
/// to "absent" so provisioning can proceed in CPU-only mode.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("hardware enumeration failed: {0}")]
    HardwareEnumeration(String),

    #[error("mount table unreadable: {0}")]
    MountTable(String),
}

/// A step was attempted whose precondition does not hold. Fatal: the
/// operator must fix the underlying cause and re-run.
#[derive(Error, Debug, Clone)]
pub enum PreconditionError {
    #[error("encrypted volume is not mounted at {mount_path} (run `vaulthost up` to completion first)")]
    MountNotActive { mount_path: PathBuf },

    #[error("{backing_path} does not hold a valid encrypted container; it must be formatted before it can be opened")]
    NoValidContainer { backing_path: PathBuf },

    #[error("encryption key missing at {key_path}; it must exist before the volume is formatted")]
    KeyMissing { key_path: PathBuf },
}

/// Refusal to overwrite data that does not look like ours. Requires an
/// explicit `--force-format` override.
#[derive(Error, Debug, Clone)]
#[error("refusing to format {path}: {reason} (pass --force-format to override)")]
pub struct DestructiveActionRefused {
    pub path: PathBuf,
    pub reason: String,
}

/// An external command could not be spawned, timed out, or exited non-zero.
#[derive(Error, Debug, Clone)]
#[error("`{command}` failed ({}): {stderr}", status.map(|s| format!("exit code {s}")).unwrap_or_else(|| "no exit status".to_string()))]
pub struct ExternalToolError {
    /// The rendered command line.
    pub command: String,
    /// Exit status, if the process ran to completion.
    pub status: Option<i32>,
    /// Captured (truncated) stderr, or a spawn/timeout description.
    pub stderr: String,
}

/// Encrypted volume failures with distinct kinds, since the remediation
/// differs: a wrong key means "restore the key", a busy mount point means
/// "nothing to do here".
#[derive(Error, Debug, Clone)]
pub enum VolumeError {
    #[error("could not open container {mapper}: wrong or corrupt key ({stderr})")]
    WrongKey { mapper: String, stderr: String },

    #[error("backing file {path} is {actual} bytes but the configuration expects {expected}; resizing is not supported")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("mount point {mount_path} is busy: {stderr}")]
    MountBusy { mount_path: PathBuf, stderr: String },
}

/// Service installation and supervision failures.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("service {name} did not reach a running state")]
    NotRunning { name: String },

    #[error("service {name} has no image configured")]
    MissingImage { name: String },
}

/// Configuration errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Lock file errors enforcing single-run exclusivity.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("another vaulthost run is active (pid {pid}, lock {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("could not create lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_the_taxonomy() {
        let precondition: ProvisionError = PreconditionError::MountNotActive {
            mount_path: PathBuf::from("/mnt/vaultllm"),
        }
        .into();
        let refused: ProvisionError = DestructiveActionRefused {
            path: PathBuf::from("/opt/vault.img"),
            reason: "contains non-zero data".to_string(),
        }
        .into();
        let tool: ProvisionError = ExternalToolError {
            command: "cryptsetup open".to_string(),
            status: Some(2),
            stderr: "boom".to_string(),
        }
        .into();

        assert_eq!(precondition.exit_code(), 2);
        assert_eq!(refused.exit_code(), 3);
        assert_eq!(tool.exit_code(), 4);
    }

    #[test]
    fn wrong_key_and_mount_busy_are_distinct_kinds() {
        let wrong = VolumeError::WrongKey {
            mapper: "vaultllm".to_string(),
            stderr: "No key available".to_string(),
        };
        let busy = VolumeError::MountBusy {
            mount_path: PathBuf::from("/mnt/vaultllm"),
            stderr: "target is busy".to_string(),
        };
        assert_ne!(
            std::mem::discriminant(&wrong),
            std::mem::discriminant(&busy)
        );
    }
}
