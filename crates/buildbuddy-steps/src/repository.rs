//! Artifact repositories

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;

/// An artifact resolved by a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryItem {
    /// The artifact already exists as a local file
    File(PathBuf),
    /// The artifact's content
    Bytes(Vec<u8>),
}

/// Resolves coordinates to artifacts
#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up `coordinate`; `None` when the repository does not know it
    async fn fetch(&self, coordinate: &str) -> anyhow::Result<Option<RepositoryItem>>;
}

/// A Maven coordinate.
///
/// Accepted forms are `group:artifact:version`, `group:artifact:version:type`
/// and `group:artifact:version:classifier:type`. The type defaults to `jar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavenCoordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub classifier: Option<String>,
    pub extension: String,
}

impl MavenCoordinate {
    /// Location of the artifact relative to a repository root
    pub fn path(&self) -> PathBuf {
        let mut path: PathBuf = self.group.split('.').collect();
        path.push(&self.artifact);
        path.push(&self.version);
        let file = match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact, self.version, classifier, self.extension
            ),
            None => format!("{}-{}.{}", self.artifact, self.version, self.extension),
        };
        path.push(file);
        path
    }
}

impl FromStr for MavenCoordinate {
    type Err = anyhow::Error;

    fn from_str(coordinate: &str) -> Result<Self, Self::Err> {
        let elements: Vec<&str> = coordinate.split(':').collect();
        if elements.iter().any(|e| e.is_empty()) {
            anyhow::bail!("Invalid Maven coordinate: {}", coordinate);
        }

        let (classifier, extension) = match elements.len() {
            3 => (None, "jar"),
            4 => (None, elements[3]),
            5 => (Some(elements[3].to_string()), elements[4]),
            _ => anyhow::bail!("Invalid Maven coordinate: {}", coordinate),
        };

        Ok(Self {
            group: elements[0].to_string(),
            artifact: elements[1].to_string(),
            version: elements[2].to_string(),
            classifier,
            extension: extension.to_string(),
        })
    }
}

impl fmt::Display for MavenCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{}", classifier)?;
        }
        write!(f, ":{}", self.extension)
    }
}

/// A local folder laid out like a Maven repository
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The user's local Maven repository, `~/.m2/repository`
    pub fn local() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".m2").join("repository")))
    }
}

#[async_trait]
impl Repository for DirectoryRepository {
    async fn fetch(&self, coordinate: &str) -> anyhow::Result<Option<RepositoryItem>> {
        let coordinate: MavenCoordinate = coordinate.parse()?;
        let file = self.root.join(coordinate.path());
        match tokio::fs::metadata(&file).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(RepositoryItem::File(file))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
