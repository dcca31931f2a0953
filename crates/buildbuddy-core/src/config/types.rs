//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::hash::HashAlgorithm;

use super::defaults::{DEFAULT_JAVAC, DEFAULT_ROOT_DIR};

/// Main configuration of a build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Project name
    pub name: Option<String>,

    /// Executor settings
    pub build: BuildSettings,

    /// Source folders, hashed on every build
    pub sources: Vec<SourceConfig>,

    /// Build steps, in registration order
    pub steps: Vec<StepConfig>,
}

impl BuildConfig {
    /// Resolve relative paths against the directory holding the build file
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        self.build.root = base.join(&self.build.root);
        for source in &mut self.sources {
            source.path = base.join(&source.path);
        }
        for step in &mut self.steps {
            if let StepKind::Fetch { repositories } = &mut step.kind {
                for path in repositories.values_mut() {
                    *path = base.join(&*path);
                }
            }
        }
        self
    }

    /// All registered identities, sources first
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .map(|s| s.id.as_str())
            .chain(self.steps.iter().map(|s| s.id.as_str()))
    }
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Directory holding every step's persisted output and checksums
    pub root: PathBuf,

    /// Content hash used for change detection
    pub hash: HashAlgorithm,

    /// Worker threads for the runtime (defaults to the number of CPUs)
    pub worker_threads: Option<usize>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_DIR),
            hash: HashAlgorithm::default(),
            worker_threads: None,
        }
    }
}

/// A source folder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Identity of the source
    pub id: String,

    /// Folder to hash
    pub path: PathBuf,
}

/// A build step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Identity of the step
    pub id: String,

    /// Direct dependencies. When absent, the step depends on everything
    /// registered before it.
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,

    /// Run even when no input changed
    #[serde(default)]
    pub always_run: bool,

    /// What the step does
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Kinds of build steps available from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepKind {
    /// Hard-link dependency trees into the output
    Bind {
        /// Source path inside each dependency to target path inside the output
        #[serde(default)]
        paths: BTreeMap<PathBuf, PathBuf>,
    },

    /// Run an external program
    Process {
        /// Program to execute
        program: String,

        /// Arguments; `{next}` and `{previous}` are substituted
        #[serde(default)]
        args: Vec<String>,

        /// Glob of dependency files appended to the arguments
        #[serde(default)]
        include: Option<String>,
    },

    /// Compile Java sources
    Javac {
        /// Path to the javac executable
        #[serde(default = "default_javac")]
        program: String,

        /// Value passed to `--release`
        #[serde(default)]
        release: Option<u32>,
    },

    /// List the artifacts required by Java module descriptors
    Modules {
        /// Repository name prefixed to every resolved coordinate
        #[serde(default)]
        repository: Option<String>,
    },

    /// Fetch artifacts listed by dependencies from local repositories
    Fetch {
        /// Repository name to Maven-layout directory
        #[serde(default)]
        repositories: BTreeMap<String, PathBuf>,
    },
}

impl StepKind {
    /// Short name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Process { .. } => "process",
            Self::Javac { .. } => "javac",
            Self::Modules { .. } => "modules",
            Self::Fetch { .. } => "fetch",
        }
    }
}

fn default_javac() -> String {
    DEFAULT_JAVAC.to_string()
}
