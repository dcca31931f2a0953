//! Exit codes for the CLI

/// General error
pub const ERROR: i32 = 1;

/// Invalid build file or graph
pub const CONFIG_ERROR: i32 = 2;

/// A step failed
pub const BUILD_ERROR: i32 = 3;
