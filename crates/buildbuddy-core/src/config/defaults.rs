//! Default configuration values

/// Default build file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "buildbuddy.toml";

/// Default build file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "buildbuddy.yaml";

/// Directory, relative to the build file, holding persisted step state
pub const DEFAULT_ROOT_DIR: &str = "target/buildbuddy";

/// javac executable used when none is configured
pub const DEFAULT_JAVAC: &str = "javac";

/// Get list of build file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".buildbuddy.toml",
        ".buildbuddy.yaml",
    ]
}
