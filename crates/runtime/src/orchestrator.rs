//! Provisioning orchestrator
//!
//! A single sequential control flow through
//! `Init -> Probed -> PackagesReady -> VolumeReady -> ServicesReady -> Done`.
//! Each transition's entry action is idempotent, and transitions whose
//! target state the probed snapshot already shows are skipped instead of
//! re-executed, so re-running after an interrupted run converges instead of
//! corrupting existing state. Any fatal error moves the machine to the
//! absorbing `Failed` state carrying the step and cause; there is no
//! rollback because every reachable intermediate state is safe to resume
//! from.

use std::sync::Arc;

use crate::config::{ProvisionConfig, ServicesConfig};
use crate::exec::CommandRunner;
use crate::lockfile::LockFile;
use crate::probe::CapabilityProber;
use crate::services::{ServiceHandle, ServiceInstaller};
use crate::types::{
    GpuVendor, ProvisionError, ProvisionState, ServiceError, ServiceStatus, Step, SystemState,
};
use crate::volume::VolumeManager;

/// Per-run flags that are not part of the durable configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub force_format: bool,
    pub dry_run: bool,
}

/// What one step did during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub state: ProvisionState,
    pub gpu_vendor: GpuVendor,
    pub steps: Vec<StepRecord>,
}

pub struct Orchestrator {
    config: ProvisionConfig,
    runner: Arc<dyn CommandRunner>,
    prober: Arc<dyn CapabilityProber>,
    options: ProvisionOptions,
    state: ProvisionState,
}

impl Orchestrator {
    pub fn new(
        config: ProvisionConfig,
        runner: Arc<dyn CommandRunner>,
        prober: Arc<dyn CapabilityProber>,
        options: ProvisionOptions,
    ) -> Result<Self, ProvisionError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            prober,
            options,
            state: ProvisionState::Init,
        })
    }

    pub fn state(&self) -> &ProvisionState {
        &self.state
    }

    /// Run the state machine to `Done` or the first fatal error.
    pub async fn run(&mut self) -> Result<ProvisionReport, ProvisionError> {
        let volume_spec = self.config.volume_spec()?;
        let _lock = LockFile::acquire(&self.config.paths.lock_file)?;

        let volumes = VolumeManager::new(
            Arc::clone(&self.runner),
            volume_spec.clone(),
            self.options.force_format,
            self.options.dry_run,
        );
        let installer = ServiceInstaller::new(
            Arc::clone(&self.runner),
            self.config.paths.unit_dir.clone(),
            self.config.paths.docker_daemon_json.clone(),
            self.options.dry_run,
        );

        let mut steps = Vec::new();

        // Init -> Probed
        let state = self.prober.probe().await;
        let gpu_vendor = self.config.gpu_mode.resolve(state.gpu_vendor);
        tracing::info!(
            probed = %state.gpu_vendor,
            effective = %gpu_vendor,
            "gpu vendor resolved"
        );
        steps.push(StepRecord {
            step: Step::Probe,
            outcome: StepOutcome::Executed,
        });
        self.state = ProvisionState::Probed;

        // Probed -> PackagesReady
        if state.packages_installed {
            tracing::info!(step = %Step::Packages, "already satisfied, skipping");
            steps.push(StepRecord {
                step: Step::Packages,
                outcome: StepOutcome::Skipped,
            });
        } else {
            let ServicesConfig { ollama, .. } = &self.config.services;
            let result = async {
                installer.ensure_packages(&self.config.packages).await?;
                installer
                    .ensure_inference_binary(&ollama.binary, &ollama.install_url)
                    .await
            }
            .await;
            result.map_err(|e| self.fail(Step::Packages, e))?;
            steps.push(StepRecord {
                step: Step::Packages,
                outcome: StepOutcome::Executed,
            });
        }
        self.state = ProvisionState::PackagesReady;

        // PackagesReady -> VolumeReady
        // ensure_* calls are made even when the probe shows the artifact,
        // because they also surface mismatches (wrong size, invalid header)
        // that a bare existence check cannot.
        volumes
            .ensure_backing_file()
            .map_err(|e| self.fail(Step::BackingFile, e))?;
        steps.push(StepRecord {
            step: Step::BackingFile,
            outcome: skipped_if(state.volume_exists),
        });

        volumes
            .ensure_key()
            .map_err(|e| self.fail(Step::Key, e))?;
        steps.push(StepRecord {
            step: Step::Key,
            outcome: skipped_if(state.key_present),
        });

        let formatted = volumes
            .ensure_luks_container()
            .await
            .map_err(|e| self.fail(Step::Container, e))?;
        steps.push(StepRecord {
            step: Step::Container,
            outcome: skipped_if(!formatted),
        });

        if state.volume_open && state.volume_mounted {
            tracing::info!(step = %Step::OpenAndMount, "already satisfied, skipping");
            steps.push(StepRecord {
                step: Step::OpenAndMount,
                outcome: StepOutcome::Skipped,
            });
        } else {
            volumes
                .ensure_open_and_mounted(&state)
                .await
                .map_err(|e| self.fail(Step::OpenAndMount, e))?;
            steps.push(StepRecord {
                step: Step::OpenAndMount,
                outcome: StepOutcome::Executed,
            });
        }
        self.state = ProvisionState::VolumeReady;

        // VolumeReady -> ServicesReady. Preconditions are verified against
        // a fresh snapshot, not the stale pre-volume one.
        let state = self.prober.probe().await;

        installer
            .relocate_docker_root(&volume_spec.mount_path, &state)
            .await
            .map_err(|e| self.fail(Step::DockerRoot, e))?;
        steps.push(StepRecord {
            step: Step::DockerRoot,
            outcome: StepOutcome::Executed,
        });

        let specs = self.config.service_specs(gpu_vendor);
        let mut handles: Vec<ServiceHandle> = Vec::new();
        for spec in &specs {
            if state.services_registered.contains(&spec.name) {
                tracing::info!(service = %spec.name, "already registered, skipping");
                handles.push(installer.handle(spec));
                continue;
            }
            let handle = installer
                .install_and_start(spec, &state)
                .await
                .map_err(|e| self.fail(Step::Services, e))?;
            handles.push(handle);
        }
        steps.push(StepRecord {
            step: Step::Services,
            outcome: if specs
                .iter()
                .all(|s| state.services_registered.contains(&s.name))
            {
                StepOutcome::Skipped
            } else {
                StepOutcome::Executed
            },
        });
        self.state = ProvisionState::ServicesReady;

        // ServicesReady -> Done
        if !self.options.dry_run {
            for handle in &handles {
                let status = handle.status().await;
                if status != ServiceStatus::Running {
                    let err = ProvisionError::from(ServiceError::NotRunning {
                        name: handle.name().to_string(),
                    });
                    return Err(self.fail(Step::Verify, err));
                }
            }
        }
        steps.push(StepRecord {
            step: Step::Verify,
            outcome: StepOutcome::Executed,
        });
        self.state = ProvisionState::Done;

        Ok(ProvisionReport {
            state: self.state.clone(),
            gpu_vendor,
            steps,
        })
    }

    fn fail(&mut self, step: Step, err: ProvisionError) -> ProvisionError {
        self.state = ProvisionState::Failed {
            step,
            cause: err.to_string(),
        };
        tracing::error!(
            step = %step,
            error = %err,
            "provisioning failed; the host state is safe to resume from by re-running"
        );
        err
    }
}

fn skipped_if(already: bool) -> StepOutcome {
    if already {
        StepOutcome::Skipped
    } else {
        StepOutcome::Executed
    }
}
