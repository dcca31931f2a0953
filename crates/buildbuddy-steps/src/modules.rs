//! Derive artifact dependencies from Java module descriptors
//!
//! Dependencies may publish `modules/modules.properties`, mapping module names
//! to the coordinate of the artifact that provides them. Every dependency that
//! carries `sources/module-info.java` gets a `dependencies/<identity>.properties`
//! file listing the resolved coordinate of each module it requires.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::debug;

use buildbuddy_tasks::{BuildStep, BuildStepArguments, BuildStepContext, BuildStepResult};

use crate::bind::{DEPENDENCIES, SOURCES};
use crate::fetch::parse_properties;

/// Folder of a dependency holding the module table
pub const MODULES: &str = "modules";

const MODULE_TABLE: &str = "modules.properties";
const MODULE_INFO: &str = "module-info.java";

/// Maps a coordinate from a module table to the key written out
pub type Resolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Lists the artifacts required by each dependency's module descriptor
#[derive(Clone)]
pub struct ModuleDependencies {
    resolver: Resolver,
}

impl ModuleDependencies {
    pub fn new(resolver: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Prefix every coordinate with `repository/`, the form fetch requirements use
    pub fn in_repository(repository: impl Into<String>) -> Self {
        let repository = repository.into();
        Self::new(move |coordinate| format!("{}/{}", repository, coordinate))
    }

    async fn references(&self, arguments: &BuildStepArguments) -> anyhow::Result<BTreeMap<String, String>> {
        let mut references = BTreeMap::new();
        for argument in arguments.values() {
            let table = argument.folder.join(MODULES).join(MODULE_TABLE);
            if let Some(content) = read_optional(&table).await? {
                for (module, coordinate) in parse_properties(&content) {
                    references.insert(module, (self.resolver)(&coordinate));
                }
            }
        }
        Ok(references)
    }
}

impl fmt::Debug for ModuleDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDependencies").finish_non_exhaustive()
    }
}

#[async_trait]
impl BuildStep for ModuleDependencies {
    async fn apply(
        &self,
        _handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        let references = self.references(arguments).await?;

        let dependencies = context.next.join(DEPENDENCIES);
        tokio::fs::create_dir(&dependencies).await?;

        for (id, argument) in arguments {
            let descriptor = argument.folder.join(SOURCES).join(MODULE_INFO);
            let Some(content) = read_optional(&descriptor).await? else {
                continue;
            };

            let mut required = BTreeSet::new();
            for module in required_modules(&content)
                .with_context(|| format!("Cannot read module descriptor {}", descriptor.display()))?
            {
                let reference = references
                    .get(&module)
                    .ok_or_else(|| anyhow!("Unknown module: {}", module))?;
                required.insert(reference.clone());
            }

            debug!(dependency = %id, modules = required.len(), "resolved module requirements");
            let properties: String = required
                .iter()
                .map(|reference| format!("{}=\n", escape_key(reference)))
                .collect();
            tokio::fs::write(dependencies.join(format!("{}.properties", id)), properties).await?;
        }

        Ok(BuildStepResult::published())
    }
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Names of every module in a descriptor's `requires` directives
pub fn required_modules(source: &str) -> anyhow::Result<Vec<String>> {
    let source = strip_comments(source);
    let (Some(open), Some(close)) = (source.find('{'), source.rfind('}')) else {
        bail!("no module declaration");
    };
    if close < open {
        bail!("malformed module declaration");
    }

    let mut modules = Vec::new();
    for directive in source[open + 1..close].split(';') {
        let mut tokens = directive.split_whitespace();
        if tokens.next() != Some("requires") {
            continue;
        }
        let name: String = tokens
            .skip_while(|token| matches!(*token, "transitive" | "static"))
            .collect();
        if name.is_empty() {
            bail!("requires directive without a module name");
        }
        modules.push(name);
    }
    Ok(modules)
}

fn strip_comments(source: &str) -> String {
    let mut stripped = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        match (c, next) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        stripped.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut previous = ' ';
                for c in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
                stripped.push(' ');
            }
            _ => stripped.push(c),
        }
    }
    stripped
}

/// Escape the characters a properties key cannot hold literally
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '\\' | ':' | '=' | ' ' | '#' | '!') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
