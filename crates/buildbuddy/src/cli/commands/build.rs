//! Build command

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Args;
use console::style;
use tracing::info;

use buildbuddy_core::BuildConfig;
use buildbuddy_tasks::{BuildEvent, BuildReporter, TracingReporter};

use crate::cli::{output, Cli, OutputFormat};
use crate::pipeline;

use super::load_build_config;

/// Run the build
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Build file to use instead of searching for one
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Remove all persisted state first
    #[arg(long)]
    pub clean: bool,
}

impl BuildCommand {
    /// Execute the build command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!("executing build command");
        let (config, path) = load_build_config(self.config.as_deref())?;

        let reporter: Arc<dyn BuildReporter> = if cli.quiet || cli.format == OutputFormat::Json {
            Arc::new(TracingReporter)
        } else {
            Arc::new(ConsoleReporter::new(cli.verbose))
        };
        let executor = pipeline::executor(&config, reporter)?;

        if self.clean && executor.root().exists() {
            std::fs::remove_dir_all(executor.root())?;
        }

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Building {} from {}",
                style(config.name.as_deref().unwrap_or("project")).bold(),
                output::path_style().apply_to(path.display())
            ));
        }

        let runtime = runtime(&config)?;
        let started = Instant::now();
        let summaries = runtime.block_on(executor.execute(runtime.handle()))?;

        match cli.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "root": executor.root(),
                    "duration_ms": started.elapsed().as_millis(),
                    "outputs": summaries,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Text if !cli.quiet => {
                for (id, summary) in &summaries {
                    println!(
                        "  {} {}",
                        output::id_style().apply_to(id),
                        output::path_style().apply_to(summary.folder.display())
                    );
                }
                output::success(&format!(
                    "Build finished in {:.1}s",
                    started.elapsed().as_secs_f64()
                ));
            }
            OutputFormat::Text => {}
        }
        Ok(())
    }
}

fn runtime(config: &BuildConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.build.worker_threads {
        builder.worker_threads(threads);
    }
    builder.build()
}

/// Console reporter printing one line per step
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl BuildReporter for ConsoleReporter {
    fn report(&self, event: &BuildEvent) {
        match event {
            BuildEvent::SourceHashed { id, files } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("·").dim(),
                        id,
                        style(format!("({})", output::plural(*files, "file"))).dim()
                    );
                }
            }
            BuildEvent::StepStarted { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(id).bold(),
                    if self.verbose {
                        style(format!("({})", reason)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            BuildEvent::StepSkipped { id } => {
                println!(
                    "  {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    style("(up to date)").cyan()
                );
            }
            BuildEvent::StepPublished {
                id,
                files,
                duration,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    style(format!("({})", output::plural(*files, "file"))).dim(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim()
                );
            }
            BuildEvent::StepDeclined { id } => {
                println!(
                    "  {} {} {}",
                    style("!").yellow().bold(),
                    style(id).yellow(),
                    style("(kept previous output)").dim()
                );
            }
            BuildEvent::StepFailed { id, error, .. } => {
                println!("  {} {}: {}", style("✗").red().bold(), style(id).red(), error);
            }
            BuildEvent::BuildCompleted { .. } => {}
        }
    }
}
