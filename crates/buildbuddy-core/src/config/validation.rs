//! Configuration validation

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{BuildConfig, StepKind};

/// Validate a build configuration.
///
/// Identities are checked in registration order (sources, then steps), so a
/// dependency must name an entry declared earlier in the file.
pub fn validate_config(config: &BuildConfig) -> Result<()> {
    debug!(
        sources = config.sources.len(),
        steps = config.steps.len(),
        "validating build configuration"
    );
    let mut seen: HashSet<&str> = HashSet::new();

    for (i, source) in config.sources.iter().enumerate() {
        validate_identity(&format!("sources[{}].id", i), &source.id)?;
        if !seen.insert(source.id.as_str()) {
            return Err(duplicate(format!("sources[{}].id", i), &source.id));
        }
    }

    for (i, step) in config.steps.iter().enumerate() {
        validate_identity(&format!("steps[{}].id", i), &step.id)?;

        for dependency in step.depends_on.iter().flatten() {
            if !seen.contains(dependency.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("steps[{}].depends_on", i),
                    message: format!("'{}' must be declared before '{}'", dependency, step.id),
                }
                .into());
            }
        }

        if !seen.insert(step.id.as_str()) {
            return Err(duplicate(format!("steps[{}].id", i), &step.id));
        }

        validate_kind(i, &step.kind)?;
    }

    debug!("build configuration validation passed");
    Ok(())
}

/// Why `id` cannot name a directory below the build root, if it cannot.
///
/// Identities must be a single plain path component. A leading '.' is
/// reserved for the executor's staging folders.
pub fn identity_problem(id: &str) -> Option<&'static str> {
    if id.is_empty() {
        Some("identity cannot be empty")
    } else if id.starts_with('.') {
        Some("identity cannot start with '.'")
    } else if id.contains(['/', '\\']) {
        Some("identity cannot contain path separators")
    } else {
        None
    }
}

fn validate_identity(field: &str, id: &str) -> Result<()> {
    match identity_problem(id) {
        Some(message) => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

fn duplicate(field: String, id: &str) -> crate::error::BuildError {
    ConfigError::InvalidValue {
        field,
        message: format!("identity '{}' is declared twice", id),
    }
    .into()
}

fn validate_kind(i: usize, kind: &StepKind) -> Result<()> {
    match kind {
        StepKind::Process { program, .. } | StepKind::Javac { program, .. }
            if program.is_empty() =>
        {
            Err(ConfigError::InvalidValue {
                field: format!("steps[{}].program", i),
                message: "program cannot be empty".to_string(),
            }
            .into())
        }
        StepKind::Process {
            include: Some(pattern),
            ..
        } if glob::Pattern::new(pattern).is_err() => Err(ConfigError::InvalidValue {
            field: format!("steps[{}].include", i),
            message: format!("'{}' is not a valid glob pattern", pattern),
        }
        .into()),
        StepKind::Fetch { repositories } if repositories.is_empty() => {
            Err(ConfigError::InvalidValue {
                field: format!("steps[{}].repositories", i),
                message: "at least one repository is required".to_string(),
            }
            .into())
        }
        _ => Ok(()),
    }
}
