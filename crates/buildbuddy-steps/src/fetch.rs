//! Fetch verified artifacts from repositories
//!
//! Dependencies publish their requirements as properties files under
//! `flattened/`. Each entry maps `repository/coordinate` to an optional
//! expected digest written as `algorithm/base64-digest`:
//!
//! ```text
//! maven/org.example:lib:1.0=SHA-256/ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=
//! maven/org.example:other:2.0=
//! ```
//!
//! Artifacts land in `libs/<repository>:<coordinate>` of the step's output.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::try_join_all;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tokio::runtime::Handle;
use tracing::{debug, info};

use buildbuddy_tasks::{BuildStep, BuildStepArguments, BuildStepContext, BuildStepResult};

use crate::bind::link_or_copy;
use crate::repository::{Repository, RepositoryItem};

/// Folder of a dependency holding requirement files
pub const FLATTENED: &str = "flattened";
/// Folder of the output holding fetched artifacts
pub const LIBS: &str = "libs";

/// Digest algorithms accepted in expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// Still common in Maven repository metadata
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(bytes).to_vec(),
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            _ => bail!("Unsupported digest algorithm: {}", s),
        }
    }
}

/// Expected digest of an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
}

impl Expectation {
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.algorithm.digest(bytes) == self.digest
    }

    async fn matches_file(&self, path: &Path) -> anyhow::Result<bool> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(self.matches(&bytes))
    }
}

impl FromStr for Expectation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("Expected algorithm/digest, got: {}", s))?;
        Ok(Self {
            algorithm: algorithm.parse()?,
            digest: STANDARD
                .decode(digest)
                .with_context(|| format!("Invalid base64 digest: {}", digest))?,
        })
    }
}

/// One artifact a dependency asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub repository: String,
    pub coordinate: String,
    pub expectation: Option<Expectation>,
}

impl Requirement {
    fn parse(key: &str, value: &str) -> anyhow::Result<Self> {
        let (repository, coordinate) = key
            .split_once('/')
            .filter(|(repository, coordinate)| !repository.is_empty() && !coordinate.is_empty())
            .ok_or_else(|| anyhow!("Expected repository/coordinate, got: {}", key))?;
        let expectation = if value.is_empty() {
            None
        } else {
            Some(value.parse()?)
        };
        Ok(Self {
            repository: repository.to_string(),
            coordinate: coordinate.to_string(),
            expectation,
        })
    }

    /// File name of the artifact below `libs/`
    pub fn file_name(&self) -> String {
        format!("{}:{}", self.repository, self.coordinate)
    }
}

/// Fetches every artifact required by the step's dependencies
#[derive(Clone, Default)]
pub struct Fetch {
    repositories: BTreeMap<String, Arc<dyn Repository>>,
}

impl Fetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository under `name`
    pub fn with_repository(mut self, name: impl Into<String>, repository: impl Repository + 'static) -> Self {
        self.repositories.insert(name.into(), Arc::new(repository));
        self
    }
}

#[async_trait]
impl BuildStep for Fetch {
    async fn apply(
        &self,
        handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        let libs = context.next.join(LIBS);
        fs::create_dir(&libs)?;

        let mut requirements = BTreeMap::new();
        for argument in arguments.values() {
            for requirement in read_requirements(&argument.folder.join(FLATTENED))? {
                requirements.insert(requirement.file_name(), requirement);
            }
        }

        let mut tasks = Vec::with_capacity(requirements.len());
        for (name, requirement) in requirements {
            let repository = self
                .repositories
                .get(&requirement.repository)
                .cloned()
                .ok_or_else(|| anyhow!("Could not resolve repository: {}", requirement.repository))?;
            let previous = context
                .previous
                .as_ref()
                .map(|previous| previous.join(LIBS).join(&name))
                .filter(|path| path.is_file());
            let target = libs.join(&name);
            tasks.push(handle.spawn(fetch_artifact(repository, requirement, previous, target)));
        }

        let fetched = tasks.len();
        for result in try_join_all(tasks).await? {
            result?;
        }
        info!(artifacts = fetched, "fetched artifacts");
        Ok(BuildStepResult::published())
    }
}

async fn fetch_artifact(
    repository: Arc<dyn Repository>,
    requirement: Requirement,
    previous: Option<PathBuf>,
    target: PathBuf,
) -> anyhow::Result<()> {
    let name = requirement.file_name();

    if let Some(previous) = previous {
        let valid = match &requirement.expectation {
            Some(expectation) => expectation.matches_file(&previous).await?,
            None => true,
        };
        if valid {
            debug!(artifact = %name, "reusing previous artifact");
            link(previous, target).await?;
            return Ok(());
        }
    }

    let item = repository
        .fetch(&requirement.coordinate)
        .await?
        .ok_or_else(|| anyhow!("Unresolved: {}", requirement.coordinate))?;

    match item {
        RepositoryItem::File(file) => {
            if let Some(expectation) = &requirement.expectation {
                if !expectation.matches_file(&file).await? {
                    bail!("Mismatched digest for {}", name);
                }
            }
            link(file, target).await?;
        }
        RepositoryItem::Bytes(bytes) => {
            if let Some(expectation) = &requirement.expectation {
                if !expectation.matches(&bytes) {
                    bail!("Mismatched digest for {}", name);
                }
            }
            tokio::fs::write(&target, bytes).await?;
        }
    }
    debug!(artifact = %name, "fetched artifact");
    Ok(())
}

async fn link(source: PathBuf, target: PathBuf) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || link_or_copy(&source, &target)).await??;
    Ok(())
}

/// Requirements from every `*.properties` file in `folder`, if it exists
fn read_requirements(folder: &Path) -> anyhow::Result<Vec<Requirement>> {
    if !folder.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "properties"))
        .collect();
    files.sort();

    let mut requirements = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        for (key, value) in parse_properties(&content) {
            requirements.push(
                Requirement::parse(&key, &value)
                    .with_context(|| format!("Invalid requirement in {}", file.display()))?,
            );
        }
    }
    Ok(requirements)
}

/// `key=value` lines; `#` and `!` start comments, `\` escapes a key character
pub(crate) fn parse_properties(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .map(|line| {
            let mut key = String::new();
            let mut chars = line.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => key.extend(chars.next()),
                    '=' => return (key.trim_end().to_string(), chars.as_str().trim().to_string()),
                    c => key.push(c),
                }
            }
            (key.trim_end().to_string(), String::new())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DirectoryRepository;
    use tempfile::TempDir;

    struct MemoryRepository(BTreeMap<String, Vec<u8>>);

    #[async_trait]
    impl Repository for MemoryRepository {
        async fn fetch(&self, coordinate: &str) -> anyhow::Result<Option<RepositoryItem>> {
            Ok(self.0.get(coordinate).cloned().map(RepositoryItem::Bytes))
        }
    }

    fn memory(entries: &[(&str, &str)]) -> MemoryRepository {
        MemoryRepository(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        )
    }

    fn sha256(content: &str) -> String {
        format!("SHA-256/{}", STANDARD.encode(Sha256::digest(content.as_bytes())))
    }

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
            }
        }

        fn dependency(&self, properties: &str) -> BuildStepArguments {
            let folder = self.temp.path().join("dep");
            fs::create_dir_all(folder.join(FLATTENED)).unwrap();
            fs::write(folder.join(FLATTENED).join("dependencies.properties"), properties).unwrap();

            let mut arguments = BuildStepArguments::new();
            arguments.insert(
                "dep".to_string(),
                buildbuddy_tasks::BuildStepArgument {
                    folder,
                    checksums: Default::default(),
                    status: Default::default(),
                },
            );
            arguments
        }

        fn context(&self, name: &str, previous: Option<PathBuf>) -> BuildStepContext {
            let next = self.temp.path().join(name);
            fs::create_dir(&next).unwrap();
            BuildStepContext { previous, next }
        }
    }

    #[test]
    fn test_parse_properties() {
        let parsed = parse_properties("# comment\n\nmaven/a\\:b=SHA-256/abc=\n! other\nkey = \n");
        assert_eq!(
            parsed,
            vec![
                ("maven/a:b".to_string(), "SHA-256/abc=".to_string()),
                ("key".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_requirement() {
        let requirement = Requirement::parse("maven/org.example:lib:1.0", &sha256("jar")).unwrap();
        assert_eq!(requirement.repository, "maven");
        assert_eq!(requirement.file_name(), "maven:org.example:lib:1.0");
        let expectation = requirement.expectation.unwrap();
        assert_eq!(expectation.algorithm, DigestAlgorithm::Sha256);
        assert!(expectation.matches(b"jar"));

        assert!(Requirement::parse("no-repository", "").is_err());
        assert!(Requirement::parse("maven/x", "SHA-384/AAAA").is_err());
        assert!(Requirement::parse("maven/x", "MD5/AAAA").is_err());
        assert!(Requirement::parse("maven/x", "SHA-512/not base64!").is_err());
    }

    #[tokio::test]
    async fn test_fetch_verified_bytes() {
        let fixture = Fixture::new();
        let arguments = fixture.dependency(&format!("mem/lib={}\nmem/plain=\n", sha256("jar")));
        let context = fixture.context("next", None);

        let fetch = Fetch::new().with_repository("mem", memory(&[("lib", "jar"), ("plain", "txt")]));
        let result = fetch
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap();

        assert!(result.published);
        let libs = context.next.join(LIBS);
        assert_eq!(fs::read_to_string(libs.join("mem:lib")).unwrap(), "jar");
        assert_eq!(fs::read_to_string(libs.join("mem:plain")).unwrap(), "txt");
    }

    #[test]
    fn test_sha1_expectation() {
        let digest = STANDARD.encode(Sha1::digest(b"jar"));
        for name in ["SHA-1", "sha1", "SHA1"] {
            let expectation: Expectation = format!("{}/{}", name, digest).parse().unwrap();
            assert_eq!(expectation.algorithm, DigestAlgorithm::Sha1);
            assert!(expectation.matches(b"jar"));
            assert!(!expectation.matches(b"other"));
        }
    }

    #[tokio::test]
    async fn test_fetch_verifies_sha1_file() {
        let fixture = Fixture::new();
        let repository = fixture.temp.path().join("m2");
        let folder = repository.join("org/example/lib/1.0");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("lib-1.0.jar"), "jar").unwrap();

        let expected = format!("SHA-1/{}", STANDARD.encode(Sha1::digest(b"jar")));
        let arguments = fixture.dependency(&format!("maven/org.example:lib:1.0={}\n", expected));
        let context = fixture.context("next", None);

        Fetch::new()
            .with_repository("maven", DirectoryRepository::new(&repository))
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap();
        assert!(context.next.join(LIBS).join("maven:org.example:lib:1.0").is_file());

        let tampered = format!("SHA-1/{}", STANDARD.encode(Sha1::digest(b"other")));
        let arguments = fixture.dependency(&format!("maven/org.example:lib:1.0={}\n", tampered));
        let context = fixture.context("again", None);
        let err = Fetch::new()
            .with_repository("maven", DirectoryRepository::new(&repository))
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Mismatched digest"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_mismatched_digest() {
        let fixture = Fixture::new();
        let arguments = fixture.dependency(&format!("mem/lib={}\n", sha256("expected")));
        let context = fixture.context("next", None);

        let err = Fetch::new()
            .with_repository("mem", memory(&[("lib", "tampered")]))
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Mismatched digest for mem:lib"));
    }

    #[tokio::test]
    async fn test_fetch_from_directory_repository() {
        let fixture = Fixture::new();
        let repository = fixture.temp.path().join("m2");
        let folder = repository.join("org/example/lib/1.0");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("lib-1.0.jar"), "jar").unwrap();

        let arguments = fixture.dependency(&format!("maven/org.example:lib:1.0={}\n", sha256("jar")));
        let context = fixture.context("next", None);

        Fetch::new()
            .with_repository("maven", DirectoryRepository::new(&repository))
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap();

        let fetched = context.next.join(LIBS).join("maven:org.example:lib:1.0");
        assert_eq!(fs::read_to_string(fetched).unwrap(), "jar");
    }

    #[tokio::test]
    async fn test_fetch_reuses_valid_previous_artifact() {
        let fixture = Fixture::new();
        let arguments = fixture.dependency(&format!("mem/lib={}\nmem/stale={}\n", sha256("jar"), sha256("new")));

        let previous = fixture.temp.path().join("previous");
        fs::create_dir_all(previous.join(LIBS)).unwrap();
        fs::write(previous.join(LIBS).join("mem:lib"), "jar").unwrap();
        fs::write(previous.join(LIBS).join("mem:stale"), "old").unwrap();
        let context = fixture.context("next", Some(previous));

        Fetch::new()
            .with_repository("mem", memory(&[("stale", "new")]))
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap();

        let libs = context.next.join(LIBS);
        assert_eq!(fs::read_to_string(libs.join("mem:lib")).unwrap(), "jar");
        assert_eq!(fs::read_to_string(libs.join("mem:stale")).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_fetch_unknown_repository() {
        let fixture = Fixture::new();
        let arguments = fixture.dependency("other/lib=\n");
        let context = fixture.context("next", None);

        let err = Fetch::new()
            .apply(&Handle::current(), &context, &arguments)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not resolve repository: other"));
    }

    #[tokio::test]
    async fn test_fetch_without_requirements() {
        let fixture = Fixture::new();
        let context = fixture.context("next", None);

        let result = Fetch::new()
            .apply(&Handle::current(), &context, &BuildStepArguments::new())
            .await
            .unwrap();
        assert!(result.published);
        assert!(context.next.join(LIBS).is_dir());
    }
}
