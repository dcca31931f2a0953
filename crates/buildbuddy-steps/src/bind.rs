//! Bind dependency trees into a layout

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, trace};
use walkdir::WalkDir;

use buildbuddy_tasks::{BuildStep, BuildStepArguments, BuildStepContext, BuildStepResult};

/// Folder holding bound source files
pub const SOURCES: &str = "sources";
/// Folder holding bound resource files
pub const RESOURCES: &str = "resources";
/// Folder holding coordinate property files
pub const COORDINATES: &str = "coordinates";
/// Folder holding dependency property files
pub const DEPENDENCIES: &str = "dependencies";

/// Links parts of every dependency's output into the step's output.
///
/// For each mapping `from -> to`, the tree at `<dependency>/from` is linked
/// to `<next>/to` when it exists. Files are hard-linked, falling back to a
/// copy when the link cannot be created.
#[derive(Debug, Clone)]
pub struct Bind {
    paths: Vec<(PathBuf, PathBuf)>,
}

impl Bind {
    /// Create a step binding each `from` to its `to`
    pub fn new<F, T>(paths: impl IntoIterator<Item = (F, T)>) -> Self
    where
        F: Into<PathBuf>,
        T: Into<PathBuf>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }

    /// Bind whole dependency folders under `sources/`
    pub fn as_sources() -> Self {
        Self::new([(".", SOURCES)])
    }

    /// Bind whole dependency folders under `resources/`
    pub fn as_resources() -> Self {
        Self::new([(".", RESOURCES)])
    }

    /// Bind each dependency's `name` folder, `coordinates/` by default, under `coordinates/`
    pub fn as_coordinates(name: Option<&str>) -> Self {
        Self::new([(name.unwrap_or(COORDINATES), COORDINATES)])
    }

    /// Bind each dependency's `name` folder, `dependencies/` by default, under `dependencies/`
    pub fn as_dependencies(name: Option<&str>) -> Self {
        Self::new([(name.unwrap_or(DEPENDENCIES), DEPENDENCIES)])
    }

    fn bind(&self, next: &Path, arguments: &BuildStepArguments) -> io::Result<usize> {
        let mut linked = 0;
        for argument in arguments.values() {
            for (from, to) in &self.paths {
                let source = argument.folder.join(from);
                if source.exists() {
                    linked += link_tree(&source, &next.join(to))?;
                }
            }
        }
        Ok(linked)
    }
}

#[async_trait]
impl BuildStep for Bind {
    async fn apply(
        &self,
        _handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        let linked = self.bind(&context.next, arguments)?;
        debug!(files = linked, "bound dependency files");
        Ok(BuildStepResult::published())
    }
}

/// Mirror the tree at `source` into `target` using links
pub(crate) fn link_tree(source: &Path, target: &Path) -> io::Result<usize> {
    let mut linked = 0;
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let destination = if relative.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(relative)
        };

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            link_or_copy(entry.path(), &destination)?;
            linked += 1;
        }
    }
    Ok(linked)
}

/// Hard-link `source` to `target`, copying when linking is not possible
pub(crate) fn link_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            trace!(source = %source.display(), error = %e, "hard link failed, copying");
            fs::copy(source, target).map(|_| ())
        }
    }
}
