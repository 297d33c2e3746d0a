pub mod doctor;
pub mod status;
pub mod up;

use clap::ArgMatches;
use std::path::PathBuf;
use vaulthost_runtime::ProvisionConfig;

/// Load the configuration named by `--config`, or the default stack.
pub(crate) fn load_config(matches: &ArgMatches) -> Result<ProvisionConfig, String> {
    let path = matches.get_one::<String>("config").map(PathBuf::from);
    ProvisionConfig::load_or_default(path.as_deref()).map_err(|e| e.to_string())
}
