//! Clean command

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use buildbuddy_tasks::BuildExecutor;

use crate::cli::{output, Cli, OutputFormat};

use super::load_build_config;

/// Remove persisted step state
#[derive(Debug, Args)]
pub struct CleanCommand {
    /// Identities to clean; everything when omitted
    pub ids: Vec<String>,

    /// Build file to use instead of searching for one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl CleanCommand {
    /// Execute the clean command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!("executing clean command");
        let (config, _) = load_build_config(self.config.as_deref())?;
        let executor = BuildExecutor::new(&config.build.root, config.build.hash.function());

        let removed: Vec<&str> = if self.ids.is_empty() {
            if executor.root().exists() {
                std::fs::remove_dir_all(executor.root())?;
            }
            Vec::new()
        } else {
            let mut removed = Vec::new();
            for id in &self.ids {
                if !config.identities().any(|known| known == id.as_str()) {
                    anyhow::bail!("Unknown identity: {}", id);
                }
                if executor.clean(id)? {
                    removed.push(id.as_str());
                }
            }
            removed
        };

        match cli.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "root": executor.root(),
                    "removed": removed,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Text if !cli.quiet => {
                if self.ids.is_empty() {
                    output::success(&format!(
                        "Removed {}",
                        output::path_style().apply_to(executor.root().display())
                    ));
                } else {
                    output::success(&format!("Cleaned {}", output::plural(removed.len(), "step")));
                }
            }
            OutputFormat::Text => {}
        }
        Ok(())
    }
}
