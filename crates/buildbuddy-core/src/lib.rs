//! buildbuddy core
//!
//! Foundational pieces shared by the build engine and its front ends: the
//! error taxonomy, the build file model, and content hashing of trees.

pub mod config;
pub mod error;
pub mod hash;

pub use config::{BuildConfig, BuildSettings, SourceConfig, StepConfig, StepKind};
pub use error::{BuildError, ConfigError, GraphError, Result};
pub use hash::{Checksums, HashAlgorithm, HashFunction, Sha256Hash, Sha512Hash};
