//! Encrypted volume manager
//!
//! Brings a file-backed LUKS container to "open and mounted" through four
//! idempotent operations: backing file, key material, container header,
//! open + filesystem + mount. Each is safe to call when its target state
//! already holds; none ever re-formats a valid container.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::exec::CommandRunner;
use crate::types::{
    DestructiveActionRefused, EncryptedVolumeSpec, PreconditionError, ProvisionError, SystemState,
    VolumeError,
};

/// Key material size: 512 bits.
const KEY_BYTES: usize = 64;

pub struct VolumeManager {
    runner: Arc<dyn CommandRunner>,
    spec: EncryptedVolumeSpec,
    force_format: bool,
    dry_run: bool,
}

impl VolumeManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        spec: EncryptedVolumeSpec,
        force_format: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            runner,
            spec,
            force_format,
            dry_run,
        }
    }

    pub fn spec(&self) -> &EncryptedVolumeSpec {
        &self.spec
    }

    /// Create the zero-filled backing file if absent. An existing file is
    /// never resized or truncated; a size mismatch is reported, not
    /// corrected.
    pub fn ensure_backing_file(&self) -> Result<(), ProvisionError> {
        let path = &self.spec.backing_path;
        if path.exists() {
            let actual = std::fs::metadata(path)?.len();
            if actual != self.spec.size_bytes {
                return Err(VolumeError::SizeMismatch {
                    path: path.clone(),
                    expected: self.spec.size_bytes,
                    actual,
                }
                .into());
            }
            tracing::debug!(path = %path.display(), "backing file already present");
            return Ok(());
        }

        if self.dry_run {
            tracing::info!(
                path = %path.display(),
                size_bytes = self.spec.size_bytes,
                "dry-run: would create backing file"
            );
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(self.spec.size_bytes)?;
        file.sync_all()?;
        tracing::info!(
            path = %path.display(),
            size_bytes = self.spec.size_bytes,
            "created backing file"
        );
        Ok(())
    }

    /// Generate key material if absent; an existing key is reused
    /// byte-for-byte and never overwritten.
    pub fn ensure_key(&self) -> Result<(), ProvisionError> {
        let path = &self.spec.key_path;
        if path.exists() {
            tracing::debug!(path = %path.display(), "reusing existing key");
            return Ok(());
        }

        if self.dry_run {
            tracing::info!(path = %path.display(), "dry-run: would generate key");
            return Ok(());
        }

        // Key loss after formatting makes the volume permanently
        // unrecoverable; say so on stderr, not just in the log.
        eprintln!(
            "⚠️  Generating encryption key at {}.",
            path.display()
        );
        eprintln!("⚠️  Back this file up. If it is lost, the encrypted volume cannot be recovered.");
        tracing::warn!(path = %path.display(), "generating new volume key; losing it makes the volume unrecoverable");

        let mut key = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        std::io::Write::write_all(&mut file, &key)?;
        file.sync_all()?;
        tracing::info!(path = %path.display(), bits = KEY_BYTES * 8, "generated volume key");
        Ok(())
    }

    /// Whether the backing file already holds a valid LUKS header.
    pub async fn is_valid_container(&self) -> Result<bool, ProvisionError> {
        let path = self.spec.backing_path.display().to_string();
        let out = self.runner.run("cryptsetup", &["isLuks", &path]).await?;
        Ok(out.success)
    }

    /// Format the backing file as a LUKS container unless it already is
    /// one. Refuses to overwrite a file holding unrelated non-zero data
    /// without the explicit override. Returns whether a format was issued
    /// (or, under dry-run, would have been).
    pub async fn ensure_luks_container(&self) -> Result<bool, ProvisionError> {
        let backing = &self.spec.backing_path;

        if self.dry_run && !backing.exists() {
            tracing::info!(path = %backing.display(), "dry-run: would format container");
            return Ok(true);
        }

        if self.is_valid_container().await? {
            tracing::debug!(path = %backing.display(), "container header already valid");
            return Ok(false);
        }

        if !self.spec.key_path.exists() && !self.dry_run {
            return Err(PreconditionError::KeyMissing {
                key_path: self.spec.key_path.clone(),
            }
            .into());
        }

        if !self.force_format && has_nonzero_content(backing)? {
            return Err(DestructiveActionRefused {
                path: backing.clone(),
                reason: "file is not a recognized encrypted container but contains data"
                    .to_string(),
            }
            .into());
        }

        let backing_str = backing.display().to_string();
        let key_str = self.spec.key_path.display().to_string();
        self.runner
            .apply_ok(
                "cryptsetup",
                &[
                    "luksFormat",
                    "--batch-mode",
                    "--type",
                    "luks2",
                    "--key-file",
                    &key_str,
                    &backing_str,
                ],
            )
            .await?;
        tracing::info!(path = %backing.display(), "formatted encrypted container");
        Ok(true)
    }

    /// Open the mapping, create the filesystem on first use, and mount.
    /// Each sub-step is independently idempotent; calling this before a
    /// valid container exists is rejected, except under dry-run where the
    /// missing header is the suppressed format's doing.
    pub async fn ensure_open_and_mounted(
        &self,
        state: &SystemState,
    ) -> Result<(), ProvisionError> {
        let backing = &self.spec.backing_path;

        if self.dry_run && !backing.exists() {
            tracing::info!(
                mapper = %self.spec.mapper_name,
                mount = %self.spec.mount_path.display(),
                "dry-run: would open and mount container"
            );
            return Ok(());
        }

        // open-before-format is rejected for all orderings
        if !self.is_valid_container().await? {
            // A dry run suppressed the format that would have produced the
            // header; report the rest of the plan instead of failing on its
            // absence.
            if self.dry_run {
                tracing::info!(
                    mapper = %self.spec.mapper_name,
                    mount = %self.spec.mount_path.display(),
                    "dry-run: would open and mount container"
                );
                return Ok(());
            }
            return Err(PreconditionError::NoValidContainer {
                backing_path: backing.clone(),
            }
            .into());
        }

        if !state.volume_open {
            self.open_mapping().await?;
        } else {
            tracing::debug!(mapper = %self.spec.mapper_name, "mapping already open");
        }

        if !state.volume_mounted {
            self.ensure_filesystem().await?;
            self.mount().await?;
        } else {
            tracing::debug!(mount = %self.spec.mount_path.display(), "already mounted");
        }

        Ok(())
    }

    async fn open_mapping(&self) -> Result<(), ProvisionError> {
        let backing_str = self.spec.backing_path.display().to_string();
        let key_str = self.spec.key_path.display().to_string();
        let out = self
            .runner
            .apply(
                "cryptsetup",
                &[
                    "open",
                    "--key-file",
                    &key_str,
                    &backing_str,
                    &self.spec.mapper_name,
                ],
            )
            .await?;
        if out.success {
            tracing::info!(mapper = %self.spec.mapper_name, "opened encrypted mapping");
            return Ok(());
        }
        if out.stderr.contains("already exists") || out.stderr.contains("already in use") {
            // A concurrent or earlier open beat us; the mapping is what we
            // wanted anyway.
            tracing::debug!(mapper = %self.spec.mapper_name, "mapping already open");
            return Ok(());
        }
        // A failed open with a present key means the key does not match the
        // container. Remediation is key restoration, so this is its own
        // error kind.
        Err(VolumeError::WrongKey {
            mapper: self.spec.mapper_name.clone(),
            stderr: out.stderr,
        }
        .into())
    }

    /// Create the filesystem only when the mapped device has no filesystem
    /// signature yet. Detection via probe, never an unconditional mkfs.
    async fn ensure_filesystem(&self) -> Result<(), ProvisionError> {
        let device = self.spec.mapper_device().display().to_string();
        let probe = self
            .runner
            .run("blkid", &["-o", "value", "-s", "TYPE", &device])
            .await?;
        if probe.success && !probe.stdout.trim().is_empty() {
            tracing::debug!(device = %device, fs = %probe.stdout.trim(), "filesystem already present");
            return Ok(());
        }

        self.runner
            .apply_ok("mkfs", &["-t", &self.spec.filesystem_type, &device])
            .await?;
        tracing::info!(device = %device, fs = %self.spec.filesystem_type, "created filesystem");
        Ok(())
    }

    async fn mount(&self) -> Result<(), ProvisionError> {
        if !self.dry_run {
            std::fs::create_dir_all(&self.spec.mount_path)?;
        }
        let device = self.spec.mapper_device().display().to_string();
        let mount_str = self.spec.mount_path.display().to_string();
        let out = self.runner.apply("mount", &[&device, &mount_str]).await?;
        if out.success {
            tracing::info!(mount = %mount_str, "mounted encrypted volume");
            return Ok(());
        }
        if out.stderr.contains("busy") {
            return Err(VolumeError::MountBusy {
                mount_path: self.spec.mount_path.clone(),
                stderr: out.stderr,
            }
            .into());
        }
        Err(crate::types::ExternalToolError {
            command: format!("mount {} {}", device, mount_str),
            status: Some(out.exit_code),
            stderr: out.stderr,
        }
        .into())
    }
}

/// Scan a file for any non-zero byte. A freshly created backing file is a
/// hole from end to end and is recognized from its block count without
/// reading; anything holding real data trips the destructive-action guard.
fn has_nonzero_content(path: &Path) -> Result<bool, std::io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if std::fs::metadata(path)?.blocks() == 0 {
            return Ok(false);
        }
    }

    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        if buf[..n].iter().any(|&b| b != 0) {
            return Ok(true);
        }
    }
}

/// Short fingerprint of the key material for status output. Never reveals
/// the key itself.
pub fn key_fingerprint(key_path: &Path) -> Option<String> {
    let key = std::fs::read(key_path).ok()?;
    let digest = Sha256::digest(&key);
    Some(hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::ExecOutput;
    use std::io::Write;
    use std::path::PathBuf;

    fn spec_in(dir: &Path, size: u64) -> EncryptedVolumeSpec {
        EncryptedVolumeSpec {
            backing_path: dir.join("vault.img"),
            size_bytes: size,
            key_path: dir.join("vault.key"),
            mapper_name: "vaultllm-test".to_string(),
            mount_path: dir.join("mnt"),
            filesystem_type: "ext4".to_string(),
        }
    }

    fn manager(dir: &Path, runner: Arc<FakeRunner>) -> VolumeManager {
        VolumeManager::new(runner, spec_in(dir, 1 << 20), false, false)
    }

    #[tokio::test]
    async fn backing_file_created_once_with_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner);

        vm.ensure_backing_file().unwrap();
        let len = std::fs::metadata(vm.spec().backing_path.clone())
            .unwrap()
            .len();
        assert_eq!(len, 1 << 20);

        // Second call is a no-op.
        vm.ensure_backing_file().unwrap();
    }

    #[tokio::test]
    async fn size_mismatch_is_reported_not_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner);

        std::fs::write(&vm.spec().backing_path, b"short").unwrap();
        let err = vm.ensure_backing_file().unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Volume(VolumeError::SizeMismatch { actual: 5, .. })
        ));
        // File untouched.
        assert_eq!(std::fs::read(&vm.spec().backing_path).unwrap(), b"short");
    }

    #[tokio::test]
    async fn key_is_generated_once_and_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner);

        vm.ensure_key().unwrap();
        let first = std::fs::read(&vm.spec().key_path).unwrap();
        assert_eq!(first.len(), KEY_BYTES);

        vm.ensure_key().unwrap();
        let second = std::fs::read(&vm.spec().key_path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&vm.spec().key_path)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn valid_container_is_never_reformatted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner.clone());
        vm.ensure_backing_file().unwrap();
        vm.ensure_key().unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::success(""),
        );

        let formatted = vm.ensure_luks_container().await.unwrap();
        assert!(!formatted);
        assert!(runner.applied_commands().is_empty());
    }

    #[tokio::test]
    async fn nonzero_data_without_override_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner.clone());
        vm.ensure_key().unwrap();

        let mut f = std::fs::File::create(&vm.spec().backing_path).unwrap();
        f.write_all(b"precious unrelated data").unwrap();
        drop(f);

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::failure(1, "not a LUKS device"),
        );

        let err = vm.ensure_luks_container().await.unwrap_err();
        assert!(matches!(err, ProvisionError::DestructiveActionRefused(_)));
        assert!(runner.applied_commands().is_empty());
    }

    #[tokio::test]
    async fn force_format_overrides_the_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = VolumeManager::new(runner.clone(), spec_in(dir.path(), 1 << 20), true, false);
        vm.ensure_key().unwrap();
        std::fs::write(&vm.spec().backing_path, b"old data").unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::failure(1, "not a LUKS device"),
        );

        let formatted = vm.ensure_luks_container().await.unwrap();
        assert!(formatted);
        let applied = runner.applied_commands();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].starts_with("cryptsetup luksFormat --batch-mode"));
    }

    #[tokio::test]
    async fn open_before_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner.clone());
        vm.ensure_backing_file().unwrap();
        vm.ensure_key().unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::failure(1, "not a LUKS device"),
        );

        let err = vm
            .ensure_open_and_mounted(&SystemState::fresh())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Precondition(PreconditionError::NoValidContainer { .. })
        ));
        assert!(runner.applied_commands().is_empty());
    }

    #[tokio::test]
    async fn dry_run_open_proceeds_before_the_container_is_formatted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = VolumeManager::new(runner.clone(), spec_in(dir.path(), 1 << 20), false, true);

        // An interrupted prior run left the zero-filled backing file with no
        // container header yet.
        let file = std::fs::File::create(&vm.spec().backing_path).unwrap();
        file.set_len(1 << 20).unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::failure(1, "not a LUKS device"),
        );

        assert!(vm.ensure_luks_container().await.unwrap());
        // The suppressed format left no header; the open/mount plan is
        // reported instead of a fatal precondition error.
        vm.ensure_open_and_mounted(&SystemState::fresh())
            .await
            .unwrap();
        let applied = runner.applied_commands();
        assert!(applied.iter().all(|c| !c.starts_with("cryptsetup open")));
        assert!(applied.iter().all(|c| !c.starts_with("mount ")));
    }

    #[test]
    fn sparse_backing_file_passes_the_content_scan_without_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.img");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(8 << 30).unwrap();

        // Recognized from the block count; a byte-by-byte read of 8 GiB
        // would dominate the test suite's runtime.
        assert!(!has_nonzero_content(&path).unwrap());
    }

    #[tokio::test]
    async fn wrong_key_is_distinct_from_mount_busy() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner.clone());
        vm.ensure_backing_file().unwrap();
        vm.ensure_key().unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        let key = vm.spec().key_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::success(""),
        );
        runner.script(
            &format!(
                "cryptsetup open --key-file {} {} vaultllm-test",
                key, backing
            ),
            ExecOutput::failure(2, "No key available with this passphrase"),
        );

        let err = vm
            .ensure_open_and_mounted(&SystemState::fresh())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Volume(VolumeError::WrongKey { .. })
        ));
    }

    #[tokio::test]
    async fn filesystem_created_only_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner.clone());
        vm.ensure_backing_file().unwrap();
        vm.ensure_key().unwrap();

        let backing = vm.spec().backing_path.display().to_string();
        runner.script(
            &format!("cryptsetup isLuks {}", backing),
            ExecOutput::success(""),
        );
        runner.script(
            "blkid -o value -s TYPE /dev/mapper/vaultllm-test",
            ExecOutput::success("ext4\n"),
        );

        let state = SystemState {
            volume_open: true,
            ..SystemState::fresh()
        };
        vm.ensure_open_and_mounted(&state).await.unwrap();

        let applied = runner.applied_commands();
        assert!(applied.iter().all(|c| !c.starts_with("mkfs")));
        assert!(applied.iter().any(|c| c.starts_with("mount ")));
    }

    #[tokio::test]
    async fn key_fingerprint_is_stable_and_short() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let vm = manager(dir.path(), runner);
        vm.ensure_key().unwrap();

        let a = key_fingerprint(&vm.spec().key_path).unwrap();
        let b = key_fingerprint(&vm.spec().key_path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(key_fingerprint(&PathBuf::from("/no/such/key")).is_none());
    }
}
