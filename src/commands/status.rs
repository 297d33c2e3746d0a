use clap::ArgMatches;
use std::sync::Arc;
use vaulthost_runtime::{
    key_fingerprint, CapabilityProber, CommandRunner, HostProber, HostRunner, ServiceInstaller,
};

pub async fn run(matches: &ArgMatches) {
    let config = match super::load_config(matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    println!("📊 vaulthost status\n");

    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner::new());

    // Size is irrelevant for a read-only report.
    let mut sized = config.clone();
    sized.volume.size_gib = sized.volume.size_gib.or(Some(1));
    let volume_spec = match sized.volume_spec() {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    let prober = HostProber::new(
        Arc::clone(&runner),
        volume_spec.clone(),
        config.packages.clone(),
        config.service_probe_targets(),
    );
    let state = prober.probe().await;

    println!("🔐 Encrypted volume:");
    print_check("backing file", state.volume_exists, &volume_spec.backing_path.display().to_string());
    print_check("key", state.key_present, &volume_spec.key_path.display().to_string());
    if let Some(fp) = key_fingerprint(&volume_spec.key_path) {
        println!("    fingerprint: {}", fp);
    }
    print_check("mapping open", state.volume_open, &volume_spec.mapper_device().display().to_string());
    print_check("mounted", state.volume_mounted, &volume_spec.mount_path.display().to_string());

    println!("\n🖥  GPU: {}", state.gpu_vendor);

    println!("\n🤖 Services:");
    let installer = ServiceInstaller::new(
        Arc::clone(&runner),
        config.paths.unit_dir.clone(),
        config.paths.docker_daemon_json.clone(),
        false,
    );
    for spec in config.service_specs(state.gpu_vendor) {
        let registered = state.services_registered.contains(&spec.name);
        if registered {
            let status = installer.handle(&spec).status().await;
            println!("  • {}: {}", spec.name, status);
        } else {
            println!("  • {}: not registered", spec.name);
        }
    }

    println!();
    if state.volume_mounted && !state.services_registered.is_empty() {
        println!("✅ Provisioned");
    } else {
        println!("○ Not fully provisioned (run: vaulthost up)");
    }
}

fn print_check(label: &str, ok: bool, detail: &str) {
    if ok {
        println!("  ✓ {} ({})", label, detail);
    } else {
        println!("  ✗ {} ({})", label, detail);
    }
}
