//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::BuildConfig;
use super::validation::validate_config;

/// Load a build file. Relative paths inside it are resolved against the
/// directory that holds it.
pub fn load_config(path: &Path) -> Result<BuildConfig> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading build file");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: BuildConfig = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "build file loaded and validated");

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(config.resolve_paths(base))
}

/// Find a build file in `start_dir` or its parents. The first match wins.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for build file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found build file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no build file found");
    None
}

/// Load the build file from a directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(BuildConfig, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepKind;
    use crate::error::BuildError;
    use crate::hash::HashAlgorithm;
    use tempfile::TempDir;

    const BUILD_TOML: &str = r#"
name = "demo"

[build]
root = "out"
hash = "sha512"

[[sources]]
id = "main"
path = "src/main"

[[steps]]
id = "compile"
kind = "javac"
release = 21
depends_on = ["main"]

[[steps]]
id = "bound"
kind = "bind"
paths = { "." = "classes" }
"#;

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("buildbuddy.toml");
        std::fs::write(&config_path, "").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("buildbuddy.toml");
        std::fs::write(&toml_path, "").unwrap();
        std::fs::write(temp.path().join("buildbuddy.yaml"), "").unwrap();

        assert_eq!(find_config(temp.path()), Some(toml_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("buildbuddy.toml");
        std::fs::write(&config_path, BUILD_TOML).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.name.as_deref(), Some("demo"));
        assert_eq!(config.build.hash, HashAlgorithm::Sha512);
        assert_eq!(config.build.root, temp.path().join("out"));
        assert_eq!(config.sources[0].path, temp.path().join("src/main"));
        assert_eq!(config.steps.len(), 2);
        assert!(matches!(
            config.steps[0].kind,
            StepKind::Javac {
                release: Some(21),
                ..
            }
        ));
        assert!(config.steps[1].depends_on.is_none());
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("buildbuddy.yaml");
        std::fs::write(
            &config_path,
            "sources:\n  - id: main\n    path: src\nsteps:\n  - id: copy\n    kind: process\n    program: cp\n    args: [\"-r\", \"src\", \"{next}\"]\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.steps[0].kind.name(), "process");
    }

    #[test]
    fn test_load_config_missing_dir() {
        let temp = TempDir::new().unwrap();
        let err = load_config_from_dir(temp.path()).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(err.is_configuration());
    }
}
