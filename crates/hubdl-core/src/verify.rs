//! Integrity verification against remote content hashes

use crate::error::HubdlError;
use crate::hub::{select_files, CacheResolver, RepoMetadataProvider};
use futures::stream::{self, StreamExt};
use hubdl_types::{RepoRef, VerificationResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A file with a known content hash
#[derive(Debug, Clone)]
pub struct ExpectedFile {
    pub path: String,
    pub sha256: String,
}

enum Outcome {
    Valid,
    Corrupted,
    Missing,
}

/// Compares local files with the hashes the hub publishes for
/// large-object-tracked files
#[derive(Clone)]
pub struct Verifier {
    metadata: Arc<dyn RepoMetadataProvider>,
    cache: Arc<dyn CacheResolver>,
    workers: usize,
}

impl Verifier {
    pub fn new(
        metadata: Arc<dyn RepoMetadataProvider>,
        cache: Arc<dyn CacheResolver>,
        workers: usize,
    ) -> Self {
        Self {
            metadata,
            cache,
            workers: workers.max(1),
        }
    }

    /// Verify the files of `repo` selected by the patterns.
    ///
    /// Files are looked up under `local_dir` when given, otherwise in the cache.
    pub async fn verify(
        &self,
        repo: &RepoRef,
        include: &[String],
        exclude: &[String],
        local_dir: Option<&Path>,
    ) -> Result<VerificationResult, HubdlError> {
        let files = self.metadata.repo_files(repo).await?;
        let expected: Vec<ExpectedFile> = select_files(files, include, exclude)
            .into_iter()
            .filter_map(|f| {
                f.sha256.map(|sha256| ExpectedFile {
                    path: f.path,
                    sha256,
                })
            })
            .collect();

        info!("Verifying {} files of {}", expected.len(), repo.id);

        let result = verify_files(expected, self.workers, |file| match local_dir {
            Some(dir) => {
                let path = dir.join(file);
                path.exists().then_some(path)
            }
            None => self.cache.locate(repo, file),
        })
        .await;

        if result.is_valid {
            info!("Verification passed for {}", repo.id);
        } else {
            warn!(
                "Verification failed for {}: {} corrupted, {} missing",
                repo.id,
                result.corrupted_files.len(),
                result.missing_files.len()
            );
        }
        Ok(result)
    }
}

/// Classify each expected file, hashing at most `workers` files at a time
pub async fn verify_files<F>(expected: Vec<ExpectedFile>, workers: usize, locate: F) -> VerificationResult
where
    F: Fn(&str) -> Option<PathBuf>,
{
    let located: Vec<(ExpectedFile, Option<PathBuf>)> = expected
        .into_iter()
        .map(|file| {
            let path = locate(&file.path);
            (file, path)
        })
        .collect();

    let outcomes: Vec<(String, Outcome)> = stream::iter(located)
        .map(|(file, path)| async move {
            let Some(path) = path else {
                return (file.path, Outcome::Missing);
            };
            match hash_file(path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(&file.sha256) => (file.path, Outcome::Valid),
                Ok(_) => (file.path, Outcome::Corrupted),
                Err(e) => {
                    debug!("Could not hash {}: {}", file.path, e);
                    (file.path, Outcome::Missing)
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut valid = Vec::new();
    let mut corrupted = Vec::new();
    let mut missing = Vec::new();
    for (path, outcome) in outcomes {
        match outcome {
            Outcome::Valid => valid.push(path),
            Outcome::Corrupted => corrupted.push(path),
            Outcome::Missing => missing.push(path),
        }
    }
    valid.sort();
    corrupted.sort();
    missing.sort();

    VerificationResult::new(valid, corrupted, missing)
}

/// Hex SHA-256 of a file, computed off the async runtime
pub async fn hash_file(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"weights weights weights";
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, data).unwrap();

        let expected = vec![ExpectedFile {
            path: "model.safetensors".into(),
            sha256: sha(data),
        }];
        let locate = |f: &str| {
            let p = dir.path().join(f);
            p.exists().then_some(p)
        };

        let result = verify_files(expected.clone(), 4, locate).await;
        assert_eq!(result.valid_files, vec!["model.safetensors"]);
        assert!(result.is_valid);

        let mut flipped = data.to_vec();
        flipped[0] ^= 0xff;
        std::fs::write(&path, &flipped).unwrap();
        let result = verify_files(expected.clone(), 4, locate).await;
        assert_eq!(result.corrupted_files, vec!["model.safetensors"]);
        assert!(!result.is_valid);

        std::fs::remove_file(&path).unwrap();
        let result = verify_files(expected, 4, locate).await;
        assert_eq!(result.missing_files, vec!["model.safetensors"]);
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn test_empty_set_is_valid() {
        let result = verify_files(Vec::new(), 4, |_| None).await;
        assert!(result.is_valid);
        assert_eq!(result.total_files, 0);
    }
}
