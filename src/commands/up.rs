use clap::ArgMatches;
use std::sync::Arc;
use vaulthost_runtime::{
    CapabilityProber, CommandRunner, DryRunRunner, GpuMode, HostProber, HostRunner, Orchestrator,
    ProvisionOptions, StepOutcome,
};

pub async fn run(matches: &ArgMatches) {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut config = match super::load_config(matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    if let Some(size) = matches.get_one::<String>("container-size-gb") {
        match size.parse::<u64>() {
            Ok(gib) => config.volume.size_gib = Some(gib),
            Err(_) => {
                eprintln!("✗ Invalid container size '{}': expected a whole number of GiB", size);
                std::process::exit(1);
            }
        }
    }

    let gpu_mode = matches
        .get_one::<String>("gpu-mode")
        .expect("gpu-mode has default value");
    match gpu_mode.parse::<GpuMode>() {
        Ok(mode) => config.gpu_mode = mode,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    }

    let options = ProvisionOptions {
        force_format: matches.get_flag("force-format"),
        dry_run: matches.get_flag("dry-run"),
    };

    if options.dry_run {
        println!("✓ Dry run: probing host state, no changes will be made");
    } else {
        println!("✓ Provisioning encrypted-storage-backed service host...");
    }

    let runner: Arc<dyn CommandRunner> = if options.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(HostRunner::new())
    };

    let volume_spec = match config.volume_spec() {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("✗ {}", e);
            eprintln!("  Pass --container-size-gb or set volume.size_gib in the config file");
            std::process::exit(1);
        }
    };
    let prober: Arc<dyn CapabilityProber> = Arc::new(HostProber::new(
        Arc::clone(&runner),
        volume_spec,
        config.packages.clone(),
        config.service_probe_targets(),
    ));
    let webui_port = config.services.webui.port;

    let mut orchestrator = match Orchestrator::new(config, runner, prober, options) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(e.exit_code());
        }
    };

    match orchestrator.run().await {
        Ok(report) => {
            for record in &report.steps {
                match record.outcome {
                    StepOutcome::Executed => println!("✓ {}", record.step),
                    StepOutcome::Skipped => println!("→ {} (already satisfied)", record.step),
                }
            }
            println!("\n✓ Done (gpu: {})", report.gpu_vendor);
            if !options.dry_run {
                println!("  • Web UI: http://localhost:{}", webui_port);
                println!("  • Check services: vaulthost status");
            }
        }
        Err(e) => {
            eprintln!("\n✗ {}", orchestrator.state());
            eprintln!("  Fix the cause and re-run; completed steps will be skipped.");
            std::process::exit(e.exit_code());
        }
    }
}
