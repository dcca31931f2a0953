//! Turn a build file into a ready-to-run executor

use std::sync::Arc;

use buildbuddy_core::error::{BuildError, ConfigError};
use buildbuddy_core::{BuildConfig, StepConfig, StepKind};
use buildbuddy_steps::{Bind, DirectoryRepository, Fetch, ModuleDependencies, Process};
use buildbuddy_tasks::{AlwaysRun, BuildExecutor, BuildReporter, BuildStep};

/// Register every source and step of `config`, in file order
pub fn executor(
    config: &BuildConfig,
    reporter: Arc<dyn BuildReporter>,
) -> Result<BuildExecutor, BuildError> {
    let mut executor =
        BuildExecutor::with_reporter(&config.build.root, config.build.hash.function(), reporter);

    for source in &config.sources {
        executor.add_source(&source.id, &source.path)?;
    }
    for step in &config.steps {
        register(&mut executor, step)?;
    }
    Ok(executor)
}

fn register(executor: &mut BuildExecutor, config: &StepConfig) -> Result<(), BuildError> {
    let mut step = build_step(config)?;
    if config.always_run {
        step = Arc::new(AlwaysRun(step));
    }

    match &config.depends_on {
        Some(dependencies) => executor.add_step(&config.id, step, dependencies.iter().cloned()),
        None => executor.add_step_at_end(&config.id, step),
    }
}

fn build_step(config: &StepConfig) -> Result<Arc<dyn BuildStep>, BuildError> {
    let step: Arc<dyn BuildStep> = match &config.kind {
        StepKind::Bind { paths } if paths.is_empty() => Arc::new(Bind::as_sources()),
        StepKind::Bind { paths } => Arc::new(Bind::new(paths.clone())),
        StepKind::Process {
            program,
            args,
            include,
        } => {
            let mut process = Process::new(program).args(args.iter().cloned());
            if let Some(include) = include {
                process = process.include(include).map_err(|e| ConfigError::InvalidValue {
                    field: format!("steps.{}.include", config.id),
                    message: e.to_string(),
                })?;
            }
            Arc::new(process)
        }
        StepKind::Javac { program, release } => Arc::new(Process::javac(program, *release)),
        StepKind::Modules { repository: Some(repository) } => {
            Arc::new(ModuleDependencies::in_repository(repository))
        }
        StepKind::Modules { repository: None } => {
            Arc::new(ModuleDependencies::new(|coordinate: &str| coordinate.to_string()))
        }
        StepKind::Fetch { repositories } => Arc::new(repositories.iter().fold(
            Fetch::new(),
            |fetch, (name, path)| fetch.with_repository(name, DirectoryRepository::new(path)),
        )),
    };
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildbuddy_core::config::load_config;
    use buildbuddy_tasks::CollectingReporter;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, content: &str) -> BuildConfig {
        let path = temp.path().join("buildbuddy.toml");
        fs::write(&path, content).unwrap();
        load_config(&path).unwrap()
    }

    #[test]
    fn test_registers_in_file_order() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        let config = write_config(
            &temp,
            r#"
[[sources]]
id = "main"
path = "src"

[[steps]]
id = "bound"
kind = "bind"

[[steps]]
id = "compile"
kind = "javac"
release = 21
depends_on = ["bound"]

[[steps]]
id = "modules"
kind = "modules"
repository = "maven"
depends_on = ["bound"]

[[steps]]
id = "package"
kind = "process"
program = "jar"
args = ["cf", "{next}/app.jar"]
"#,
        );

        let executor = executor(&config, Arc::new(CollectingReporter::default())).unwrap();
        let graph = executor.graph();
        assert_eq!(
            graph.identities().collect::<Vec<_>>(),
            vec!["main", "bound", "compile", "modules", "package"]
        );
        assert_eq!(
            graph.dependencies("package").unwrap().collect::<Vec<_>>(),
            vec!["main", "bound", "compile", "modules"]
        );
        assert_eq!(graph.sinks(), vec!["package"]);
        assert_eq!(executor.root(), temp.path().join("target/buildbuddy"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_builds_bind_pipeline() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src/pkg")).unwrap();
        fs::write(temp.path().join("src/pkg/Main.java"), "class Main {}").unwrap();
        let config = write_config(
            &temp,
            r#"
[build]
root = "out"

[[sources]]
id = "main"
path = "src"

[[steps]]
id = "sources"
kind = "bind"
always_run = true
"#,
        );

        let reporter = Arc::new(CollectingReporter::default());
        let executor = executor(&config, reporter.clone()).unwrap();
        let handle = tokio::runtime::Handle::current();

        let summaries = executor.execute(&handle).await.unwrap();
        let output = temp.path().join("out/sources/output");
        assert_eq!(summaries["sources"].folder, output);
        assert!(output.join("sources/pkg/Main.java").is_file());

        executor.execute(&handle).await.unwrap();
        assert_eq!(reporter.started(), vec!["sources", "sources"]);
    }
}
