//! buildbuddy steps
//!
//! Ready-made [`BuildStep`](buildbuddy_tasks::BuildStep) implementations:
//! binding dependency trees into a layout, running external programs such
//! as `javac`, deriving artifact requirements from Java module descriptors,
//! and fetching verified artifacts from repositories.

pub mod bind;
pub mod fetch;
pub mod modules;
pub mod process;
pub mod repository;

pub use bind::Bind;
pub use fetch::Fetch;
pub use modules::ModuleDependencies;
pub use process::Process;
pub use repository::{DirectoryRepository, MavenCoordinate, Repository, RepositoryItem};
