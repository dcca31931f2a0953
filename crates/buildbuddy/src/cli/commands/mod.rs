//! CLI commands

mod build;
mod clean;
mod plan;

pub use build::BuildCommand;
pub use clean::CleanCommand;
pub use plan::PlanCommand;

use std::path::{Path, PathBuf};

use tracing::debug;

use buildbuddy_core::config::{load_config, load_config_from_dir};
use buildbuddy_core::BuildConfig;

/// Load the build file given on the command line, or search for one
pub(crate) fn load_build_config(explicit: Option<&Path>) -> anyhow::Result<(BuildConfig, PathBuf)> {
    let (config, path) = match explicit {
        Some(path) => (load_config(path)?, path.to_path_buf()),
        None => load_config_from_dir(&std::env::current_dir()?)?,
    };
    debug!(path = %path.display(), "loaded build file");
    Ok((config, path))
}
