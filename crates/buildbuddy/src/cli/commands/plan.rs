//! Plan command

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use console::style;
use serde::Serialize;

use buildbuddy_tasks::TracingReporter;

use crate::cli::{Cli, OutputFormat};
use crate::pipeline;

use super::load_build_config;

/// Show registered steps and their dependencies
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Build file to use instead of searching for one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PlannedNode<'a> {
    id: &'a str,
    dependencies: Vec<&'a str>,
    sink: bool,
}

impl PlanCommand {
    /// Execute the plan command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = load_build_config(self.config.as_deref())?;
        let executor = pipeline::executor(&config, Arc::new(TracingReporter))?;
        let graph = executor.graph();

        let sinks = graph.sinks();
        let nodes: Vec<PlannedNode> = graph
            .identities()
            .map(|id| PlannedNode {
                id,
                dependencies: graph
                    .dependencies(id)
                    .map(|deps| deps.collect())
                    .unwrap_or_default(),
                sink: sinks.contains(&id),
            })
            .collect();

        match cli.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "nodes": nodes,
                    "waves": graph.waves(),
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Text => {
                for node in &nodes {
                    let marker = if node.sink {
                        style("●").green()
                    } else {
                        style("○").dim()
                    };
                    if node.dependencies.is_empty() {
                        println!("{} {}", marker, style(node.id).bold());
                    } else {
                        println!(
                            "{} {} {} {}",
                            marker,
                            style(node.id).bold(),
                            style("←").dim(),
                            node.dependencies.join(", ")
                        );
                    }
                }
                if cli.verbose {
                    println!();
                    print!("{}", graph.execution_plan());
                }
            }
        }
        Ok(())
    }
}
