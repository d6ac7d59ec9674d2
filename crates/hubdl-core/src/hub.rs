//! Hub collaborators: repository listing, credentials, and the local cache layout

use crate::error::{HubdlError, MetadataError};
use crate::patterns::FileFilter;
use async_trait::async_trait;
use hubdl_types::{RepoRef, OFFICIAL_ENDPOINT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One file of a remote repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path relative to the repository root
    pub path: String,
    /// Size in bytes (0 when unknown)
    pub size: u64,
    /// Content hash; only present for large-object-tracked files
    pub sha256: Option<String>,
}

/// Lists the files of a repository revision
#[async_trait]
pub trait RepoMetadataProvider: Send + Sync {
    async fn repo_files(&self, repo: &RepoRef) -> Result<Vec<RemoteFile>, MetadataError>;
}

/// Supplies the bearer token for authenticated requests
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Finds existing files in the local cache
pub trait CacheResolver: Send + Sync {
    /// Snapshot directory the default cache uses for this repository revision
    fn snapshot_dir(&self, repo: &RepoRef) -> PathBuf;

    /// Local copy of `file`, if one exists
    fn locate(&self, repo: &RepoRef, file: &str) -> Option<PathBuf> {
        let path = self.snapshot_dir(repo).join(file);
        path.exists().then_some(path)
    }
}

/// Files matching the filter, in listing order
pub fn select_files(files: Vec<RemoteFile>, include: &[String], exclude: &[String]) -> Vec<RemoteFile> {
    let filter = FileFilter::new(include, exclude);
    files.into_iter().filter(|f| filter.matches(&f.path)).collect()
}

/// `(total_bytes, total_files)` counting only files with a known size
pub fn totals(files: &[RemoteFile]) -> (u64, u64) {
    files
        .iter()
        .filter(|f| f.size > 0)
        .fold((0, 0), |(bytes, count), f| (bytes + f.size, count + 1))
}

// ============================================================================
// Credentials
// ============================================================================

/// Reads the token from `HF_TOKEN` or `HUGGING_FACE_HUB_TOKEN`
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn token(&self) -> Option<String> {
        ["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|v| !v.trim().is_empty())
    }
}

/// A fixed token, or none
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

// ============================================================================
// Metadata client
// ============================================================================

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    sha256: String,
    #[serde(default)]
    size: Option<u64>,
}

impl From<Sibling> for RemoteFile {
    fn from(s: Sibling) -> Self {
        let size = s
            .size
            .or_else(|| s.lfs.as_ref().and_then(|l| l.size))
            .unwrap_or(0);
        Self {
            path: s.rfilename,
            size,
            sha256: s.lfs.map(|l| l.sha256),
        }
    }
}

/// Parse the body of a revision info response
pub fn parse_repo_files(body: &str) -> Result<Vec<RemoteFile>, MetadataError> {
    let info: RepoInfo =
        serde_json::from_str(body).map_err(|e| MetadataError::Malformed(e.to_string()))?;
    Ok(info.siblings.into_iter().map(RemoteFile::from).collect())
}

/// Build the HTTP client used for hub traffic
pub fn http_client(proxy: Option<&str>) -> Result<reqwest::Client, HubdlError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("hubdl/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30));
    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Repository listing over the hub REST API
#[derive(Clone)]
pub struct HubApi {
    client: reqwest::Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HubApi {
    pub fn new(
        endpoint: impl Into<String>,
        proxy: Option<&str>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, HubdlError> {
        Ok(Self {
            client: http_client(proxy)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_official(&self) -> bool {
        self.endpoint == OFFICIAL_ENDPOINT
    }
}

#[async_trait]
impl RepoMetadataProvider for HubApi {
    async fn repo_files(&self, repo: &RepoRef) -> Result<Vec<RemoteFile>, MetadataError> {
        let url = format!(
            "{}/api/{}/{}/revision/{}",
            self.endpoint,
            repo.kind.plural(),
            repo.id,
            urlencoding::encode(&repo.revision)
        );
        debug!("Fetching file list from {}", url);

        let mut request = self.client.get(&url).query(&[("blobs", "true")]);
        if let Some(token) = self.credentials.token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if matches!(status.as_u16(), 401 | 403 | 404) {
            if !self.is_official() {
                return Err(MetadataError::GatedOnMirror {
                    repo: repo.id.clone(),
                    endpoint: self.endpoint.clone(),
                    official_url: format!(
                        "{}/{}{}",
                        OFFICIAL_ENDPOINT,
                        repo.kind.url_prefix(),
                        repo.id
                    ),
                });
            }
            return Err(MetadataError::NotFound(repo.id.clone()));
        }
        if !status.is_success() {
            return Err(MetadataError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.text().await?;
        parse_repo_files(&body)
    }
}

// ============================================================================
// Cache layout
// ============================================================================

/// The standard hub cache: `<root>/<kind>s--<id>/snapshots/<commit>/`
#[derive(Debug, Clone)]
pub struct HubCacheLayout {
    root: PathBuf,
}

impl HubCacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `HF_HUB_CACHE`, then `HF_HOME/hub`, then `~/.cache/huggingface/hub`
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
            return Self::new(dir);
        }
        if let Ok(home) = std::env::var("HF_HOME") {
            return Self::new(Path::new(&home).join("hub"));
        }
        let root = directories::BaseDirs::new()
            .map(|b| b.home_dir().join(".cache").join("huggingface").join("hub"))
            .unwrap_or_else(|| PathBuf::from(".cache/huggingface/hub"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo: &RepoRef) -> PathBuf {
        self.root.join(repo.folder_name())
    }

    /// Commit a revision points at, read from `refs/<revision>` when present
    fn resolve_revision(&self, repo: &RepoRef) -> String {
        let ref_file = self.repo_dir(repo).join("refs").join(&repo.revision);
        std::fs::read_to_string(ref_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| repo.revision.clone())
    }
}

impl CacheResolver for HubCacheLayout {
    fn snapshot_dir(&self, repo: &RepoRef) -> PathBuf {
        self.repo_dir(repo)
            .join("snapshots")
            .join(self.resolve_revision(repo))
    }
}
