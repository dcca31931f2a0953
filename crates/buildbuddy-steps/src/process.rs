//! Run external programs as build steps

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use glob::Pattern;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info};

use buildbuddy_tasks::{BuildStep, BuildStepArguments, BuildStepContext, BuildStepResult};

const NEXT: &str = "{next}";
const PREVIOUS: &str = "{previous}";

/// Runs a program that writes its result into the step's output folder.
///
/// Arguments may contain `{next}` and `{previous}`, replaced by the output
/// folder and the previous output. Arguments mentioning `{previous}` are
/// dropped when there is no previous output. Dependency files matching the
/// `include` pattern are appended to the command line.
#[derive(Debug, Clone)]
pub struct Process {
    program: String,
    args: Vec<String>,
    include: Option<Pattern>,
}

impl Process {
    /// Create a step running `program` without arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            include: None,
        }
    }

    /// A `javac` invocation compiling every dependency `.java` file
    pub fn javac(program: impl Into<String>, release: Option<u32>) -> Self {
        let mut javac = Self::new(program);
        if let Some(release) = release {
            javac = javac.args(["--release".to_string(), release.to_string()]);
        }
        javac = javac.args(["-d", NEXT]);
        javac.include = Pattern::new("**/*.java").ok();
        javac
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append dependency files whose relative path matches `pattern`
    pub fn include(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.include = Some(Pattern::new(pattern)?);
        Ok(self)
    }

    /// Program being run
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for one invocation
    pub fn command_line(
        &self,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> Vec<String> {
        let next = context.next.display().to_string();
        let previous = context.previous.as_ref().map(|p| p.display().to_string());

        let mut line: Vec<String> = self
            .args
            .iter()
            .filter_map(|arg| match (&previous, arg.contains(PREVIOUS)) {
                (None, true) => None,
                (Some(previous), true) => Some(arg.replace(PREVIOUS, previous)),
                _ => Some(arg.clone()),
            })
            .map(|arg| arg.replace(NEXT, &next))
            .collect();

        if let Some(include) = &self.include {
            for argument in arguments.values() {
                line.extend(
                    argument
                        .checksums
                        .keys()
                        .filter(|path| include.matches_path(path))
                        .map(|path| argument.folder.join(path))
                        .map(|path: PathBuf| path.display().to_string()),
                );
            }
        }
        line
    }
}

#[async_trait]
impl BuildStep for Process {
    async fn apply(
        &self,
        _handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        let line = self.command_line(context, arguments);
        info!(program = %self.program, args = line.len(), "running process");

        let output = Command::new(&self.program)
            .args(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(program = %self.program, "{}", line);
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "{} exited with code {}: {}",
                self.program,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(BuildStepResult::published())
    }
}
