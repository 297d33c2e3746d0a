//! Service installer
//!
//! Installs packages and the inference binary, relocates Docker's storage
//! root onto the encrypted mount, and registers the managed services
//! (systemd unit for the inference daemon, docker container for the web
//! UI). Every previously running instance under the same name is torn down
//! before a new one starts, so re-provisioning never hits port or name
//! conflicts.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::exec::CommandRunner;
use crate::types::{
    PreconditionError, ProvisionError, ServiceError, ServiceKind, ServiceName, ServiceSpec,
    ServiceStatus, SystemState,
};

pub struct ServiceInstaller {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
    docker_daemon_json: PathBuf,
    dry_run: bool,
}

impl ServiceInstaller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        unit_dir: PathBuf,
        docker_daemon_json: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self {
            runner,
            unit_dir,
            docker_daemon_json,
            dry_run,
        }
    }

    /// Install the configured OS packages. The package manager owns
    /// idempotence for individual packages; this step is skipped entirely by
    /// the orchestrator when the prober reports them all present.
    pub async fn ensure_packages(&self, packages: &[String]) -> Result<(), ProvisionError> {
        if packages.is_empty() {
            return Ok(());
        }
        self.runner.apply_ok("apt-get", &["update"]).await?;
        let mut args = vec!["install", "-y"];
        args.extend(packages.iter().map(String::as_str));
        self.runner.apply_ok("apt-get", &args).await?;
        tracing::info!(count = packages.len(), "packages installed");
        Ok(())
    }

    /// Install the inference daemon binary via the vendor install script,
    /// unless it already answers on the PATH.
    pub async fn ensure_inference_binary(
        &self,
        binary: &str,
        install_url: &str,
    ) -> Result<(), ProvisionError> {
        if let Ok(out) = self.runner.run(binary, &["--version"]).await {
            if out.success {
                tracing::debug!(binary, "inference binary already installed");
                return Ok(());
            }
        }
        let script = format!("curl -fsSL {} | sh", install_url);
        self.runner.apply_ok("sh", &["-c", &script]).await?;
        tracing::info!(binary, "inference binary installed");
        Ok(())
    }

    /// Point Docker's `data-root` at the encrypted mount and restart the
    /// daemon. No-op when the daemon is already configured that way.
    /// Precondition: the encrypted volume is mounted.
    pub async fn relocate_docker_root(
        &self,
        mount_path: &Path,
        state: &SystemState,
    ) -> Result<(), ProvisionError> {
        if !state.volume_mounted && !self.dry_run {
            return Err(PreconditionError::MountNotActive {
                mount_path: mount_path.to_path_buf(),
            }
            .into());
        }

        let data_root = mount_path.join("docker");
        let data_root_str = data_root.display().to_string();

        let mut config: Value = match std::fs::read_to_string(&self.docker_daemon_json) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
            Err(_) => json!({}),
        };

        if config.get("data-root").and_then(Value::as_str) == Some(data_root_str.as_str()) {
            tracing::debug!(data_root = %data_root_str, "docker storage root already relocated");
            return Ok(());
        }

        if self.dry_run {
            tracing::info!(data_root = %data_root_str, "dry-run: would relocate docker storage root");
            return Ok(());
        }

        config["data-root"] = Value::String(data_root_str.clone());
        if let Some(parent) = self.docker_daemon_json.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&data_root)?;
        std::fs::write(
            &self.docker_daemon_json,
            serde_json::to_string_pretty(&config)?,
        )?;

        self.runner
            .apply_ok("systemctl", &["restart", "docker"])
            .await?;
        tracing::info!(data_root = %data_root_str, "docker storage root relocated");
        Ok(())
    }

    /// Write/update the service's managed definition, tear down any prior
    /// instance under the same name, then enable and start it.
    pub async fn install_and_start(
        &self,
        spec: &ServiceSpec,
        _state: &SystemState,
    ) -> Result<ServiceHandle, ProvisionError> {
        match spec.kind {
            ServiceKind::SystemdUnit => self.install_unit(spec).await?,
            ServiceKind::DockerContainer => self.install_container(spec).await?,
        }
        Ok(self.handle(spec))
    }

    /// Handle for querying a service without (re)installing it.
    pub fn handle(&self, spec: &ServiceSpec) -> ServiceHandle {
        ServiceHandle {
            name: spec.name.clone(),
            kind: spec.kind,
            runner: Arc::clone(&self.runner),
        }
    }

    async fn install_unit(&self, spec: &ServiceSpec) -> Result<(), ProvisionError> {
        let unit_name = format!("{}.service", spec.name);
        let unit_path = self.unit_dir.join(&unit_name);
        let unit_text = render_unit(spec);

        let changed = std::fs::read_to_string(&unit_path).ok().as_deref() != Some(&unit_text);

        // Teardown first: a unit from a previous run may hold the port.
        let _ = self.runner.apply("systemctl", &["stop", &unit_name]).await;

        if changed {
            if self.dry_run {
                tracing::info!(unit = %unit_name, "dry-run: would write unit file");
            } else {
                std::fs::create_dir_all(&self.unit_dir)?;
                std::fs::write(&unit_path, &unit_text)?;
                self.runner
                    .apply_ok("systemctl", &["daemon-reload"])
                    .await?;
            }
        }

        self.runner
            .apply_ok("systemctl", &["enable", &unit_name])
            .await?;
        self.runner
            .apply_ok("systemctl", &["restart", &unit_name])
            .await?;
        tracing::info!(unit = %unit_name, "service unit installed and started");
        Ok(())
    }

    async fn install_container(&self, spec: &ServiceSpec) -> Result<(), ProvisionError> {
        let image = spec.image.as_ref().ok_or_else(|| ServiceError::MissingImage {
            name: spec.name.to_string(),
        })?;

        // Remove any prior container under this name; ignore "no such
        // container".
        let _ = self
            .runner
            .apply("docker", &["rm", "-f", spec.name.as_str()])
            .await;

        if !self.dry_run {
            for volume in &spec.volumes {
                if let Some(host_path) = volume.split(':').next() {
                    std::fs::create_dir_all(host_path)?;
                }
            }
        }

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.to_string(),
            "--restart".to_string(),
            spec.restart_policy.as_docker_str().to_string(),
        ];
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for (key, value) in &spec.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(spec.extra_args.iter().cloned());
        args.push(image.clone());
        args.extend(spec.exec_command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.apply_ok("docker", &arg_refs).await?;
        tracing::info!(container = %spec.name, image = %image, "container started");
        Ok(())
    }
}

/// Render a systemd unit definition for a managed service.
fn render_unit(spec: &ServiceSpec) -> String {
    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    unit.push_str(&format!("Description={} (managed by vaulthost)\n", spec.name));
    unit.push_str("After=network-online.target");
    for dep in &spec.dependencies {
        unit.push_str(&format!(" {}.service", dep));
    }
    unit.push('\n');
    for dep in &spec.dependencies {
        unit.push_str(&format!("Requires={}.service\n", dep));
    }
    unit.push('\n');

    unit.push_str("[Service]\n");
    unit.push_str(&format!("ExecStart={}\n", spec.exec_command.join(" ")));
    for (key, value) in &spec.environment {
        unit.push_str(&format!("Environment=\"{}={}\"\n", key, value));
    }
    unit.push_str(&format!("Restart={}\n", spec.restart_policy.as_systemd_str()));
    unit.push_str("RestartSec=3\n");
    unit.push('\n');

    unit.push_str("[Install]\nWantedBy=multi-user.target\n");
    unit
}

/// Handle to a registered service, sufficient to query its live status.
pub struct ServiceHandle {
    name: ServiceName,
    kind: ServiceKind,
    runner: Arc<dyn CommandRunner>,
}

impl ServiceHandle {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub async fn status(&self) -> ServiceStatus {
        match self.kind {
            ServiceKind::SystemdUnit => {
                let unit_name = format!("{}.service", self.name);
                match self.runner.run("systemctl", &["is-active", &unit_name]).await {
                    Ok(out) if out.stdout.trim() == "active" => ServiceStatus::Running,
                    Ok(out) if out.stdout.trim().is_empty() => ServiceStatus::Unknown,
                    Ok(_) => ServiceStatus::Stopped,
                    Err(_) => ServiceStatus::Unknown,
                }
            }
            ServiceKind::DockerContainer => {
                match self
                    .runner
                    .run(
                        "docker",
                        &["inspect", "-f", "{{.State.Running}}", self.name.as_str()],
                    )
                    .await
                {
                    Ok(out) if out.success && out.stdout.trim() == "true" => ServiceStatus::Running,
                    Ok(out) if out.success => ServiceStatus::Stopped,
                    Ok(_) => ServiceStatus::Unknown,
                    Err(_) => ServiceStatus::Unknown,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::exec::fake::FakeRunner;
    use crate::exec::ExecOutput;
    use crate::types::GpuVendor;

    fn installer(dir: &Path, runner: Arc<FakeRunner>) -> ServiceInstaller {
        ServiceInstaller::new(
            runner,
            dir.join("units"),
            dir.join("docker/daemon.json"),
            false,
        )
    }

    fn mounted_state() -> SystemState {
        SystemState {
            volume_exists: true,
            volume_open: true,
            volume_mounted: true,
            key_present: true,
            ..SystemState::fresh()
        }
    }

    #[tokio::test]
    async fn unit_render_includes_env_and_restart_policy() {
        let cfg = ProvisionConfig::default();
        let specs = cfg.service_specs(GpuVendor::None);
        let unit = render_unit(&specs[0]);

        assert!(unit.contains("ExecStart=/usr/local/bin/ollama serve"));
        assert!(unit.contains("Environment=\"OLLAMA_NO_GPU=1\""));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("Requires=docker.service"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[tokio::test]
    async fn unit_install_tears_down_then_starts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let inst = installer(dir.path(), runner.clone());

        let cfg = ProvisionConfig::default();
        let specs = cfg.service_specs(GpuVendor::None);
        inst.install_and_start(&specs[0], &mounted_state())
            .await
            .unwrap();

        let applied = runner.applied_commands();
        let stop_idx = applied
            .iter()
            .position(|c| c == "systemctl stop ollama.service")
            .unwrap();
        let restart_idx = applied
            .iter()
            .position(|c| c == "systemctl restart ollama.service")
            .unwrap();
        assert!(stop_idx < restart_idx);
        assert!(applied.contains(&"systemctl daemon-reload".to_string()));
        assert!(dir.path().join("units/ollama.service").exists());
    }

    #[tokio::test]
    async fn unchanged_unit_skips_daemon_reload() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let inst = installer(dir.path(), runner.clone());

        let cfg = ProvisionConfig::default();
        let specs = cfg.service_specs(GpuVendor::None);
        inst.install_and_start(&specs[0], &mounted_state())
            .await
            .unwrap();
        runner.applied.lock().unwrap().clear();

        inst.install_and_start(&specs[0], &mounted_state())
            .await
            .unwrap();
        let applied = runner.applied_commands();
        assert!(!applied.contains(&"systemctl daemon-reload".to_string()));
    }

    #[tokio::test]
    async fn container_run_carries_env_ports_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let inst = installer(dir.path(), runner.clone());

        let mut cfg = ProvisionConfig::default();
        cfg.volume.mount_point = dir.path().join("mnt");
        let specs = cfg.service_specs(GpuVendor::Nvidia);
        inst.install_and_start(&specs[1], &mounted_state())
            .await
            .unwrap();

        let applied = runner.applied_commands();
        assert_eq!(applied[0], "docker rm -f open-webui");
        let run = &applied[1];
        assert!(run.starts_with("docker run -d --name open-webui --restart always"));
        assert!(run.contains("-p 3000:8080"));
        assert!(run.contains("-e OLLAMA_BASE_URL=http://127.0.0.1:11434"));
        assert!(run.contains("--gpus all"));
        assert!(run.ends_with("ghcr.io/open-webui/open-webui:main"));
    }

    #[tokio::test]
    async fn docker_root_relocation_requires_active_mount() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let inst = installer(dir.path(), runner);

        let err = inst
            .relocate_docker_root(Path::new("/mnt/vaultllm"), &SystemState::fresh())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Precondition(PreconditionError::MountNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn docker_root_relocation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let inst = installer(dir.path(), runner.clone());
        let mount = dir.path().join("mnt");

        inst.relocate_docker_root(&mount, &mounted_state())
            .await
            .unwrap();
        assert_eq!(
            runner.applied_commands(),
            vec!["systemctl restart docker".to_string()]
        );
        runner.applied.lock().unwrap().clear();

        // Second call sees the written daemon.json and does nothing.
        inst.relocate_docker_root(&mount, &mounted_state())
            .await
            .unwrap();
        assert!(runner.applied_commands().is_empty());
    }

    #[tokio::test]
    async fn handle_reports_running_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.script(
            "systemctl is-active ollama.service",
            ExecOutput::success("active\n"),
        );
        let inst = installer(dir.path(), runner);

        let cfg = ProvisionConfig::default();
        let specs = cfg.service_specs(GpuVendor::None);
        let handle = inst.handle(&specs[0]);
        assert_eq!(handle.status().await, ServiceStatus::Running);
    }
}
