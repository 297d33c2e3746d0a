mod commands;

use clap::{Arg, ArgAction, Command};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let matches = Command::new("vaulthost")
        .version(VERSION)
        .about("Provision an encrypted-storage-backed local LLM host")
        .subcommand(
            Command::new("up")
                .about("Bring this host to a running encrypted-storage-backed service host")
                .arg(
                    Arg::new("container-size-gb")
                        .long("container-size-gb")
                        .value_name("GIB")
                        .help("Size of the encrypted container in GiB (required unless set in the config file)"),
                )
                .arg(
                    Arg::new("gpu-mode")
                        .long("gpu-mode")
                        .value_name("MODE")
                        .default_value("auto")
                        .help("GPU mode: auto, cpu, nvidia, or amd"),
                )
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Configuration file (default: vaulthost.toml if present)"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Probe the host and report the plan without changing anything"),
                )
                .arg(
                    Arg::new("force-format")
                        .long("force-format")
                        .action(ArgAction::SetTrue)
                        .help("Allow formatting a backing file that holds unrecognized data"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Report volume, mount, and service state")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Configuration file (default: vaulthost.toml if present)"),
                ),
        )
        .subcommand(
            Command::new("doctor")
                .about("Check that the external tools vaulthost depends on are available")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Configuration file (default: vaulthost.toml if present)"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("up", sub_matches)) => commands::up::run(sub_matches).await,
        Some(("status", sub_matches)) => commands::status::run(sub_matches).await,
        Some(("doctor", sub_matches)) => commands::doctor::run(sub_matches).await,
        _ => {
            println!("vaulthost v{}", VERSION);
            println!("Use --help for available commands");
        }
    }
}
