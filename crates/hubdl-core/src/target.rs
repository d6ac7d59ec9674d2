//! Target directory resolution, duplicate detection, and file cleanup

use crate::error::HubdlError;
use crate::patterns::FileFilter;
use hubdl_types::{DuplicateAction, RepoRef};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// File suffixes that mark an interrupted transfer
pub const PARTIAL_MARKERS: &[&str] = &["aria2", "incomplete"];

/// `<base>/<kind>s--<id with / escaped>`
pub fn resolve_target_dir(base: &Path, repo: &RepoRef) -> PathBuf {
    base.join(repo.folder_name())
}

/// Pick the directory a new task downloads into.
///
/// Returns `Ok(None)` when no base directory was given (default cache).
pub async fn choose_target_dir(
    base: Option<&Path>,
    repo: &RepoRef,
    action: DuplicateAction,
) -> Result<Option<PathBuf>, HubdlError> {
    let Some(base) = base.filter(|b| !b.as_os_str().is_empty()) else {
        return Ok(None);
    };

    let resolved = resolve_target_dir(base, repo);
    if !is_occupied(&resolved).await? {
        return Ok(Some(resolved));
    }

    match action {
        DuplicateAction::Overwrite => Ok(Some(resolved)),
        DuplicateAction::Check => Err(HubdlError::DuplicateTarget { path: resolved }),
        DuplicateAction::Rename => {
            let folder = repo.folder_name();
            let mut counter = 1u32;
            loop {
                let candidate = base.join(format!("{}_{}", folder, counter));
                if !is_occupied(&candidate).await? {
                    debug!("Renamed target for {} to {}", repo.id, candidate.display());
                    return Ok(Some(candidate));
                }
                counter += 1;
            }
        }
    }
}

/// A directory is occupied when it exists, is not empty, and holds no partial marker
async fn is_occupied(dir: &Path) -> Result<bool, HubdlError> {
    if !dir_has_entries(dir).await? {
        return Ok(false);
    }
    Ok(!has_partial_marker(dir).await?)
}

async fn dir_has_entries(dir: &Path) -> Result<bool, HubdlError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(_) if dir.is_file() => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(entries.next_entry().await?.is_some())
}

/// Whether any file under `dir` (recursively) carries a partial-transfer suffix
pub async fn has_partial_marker(dir: &Path) -> Result<bool, HubdlError> {
    for file in walk_files(dir).await? {
        let is_marker = file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| PARTIAL_MARKERS.contains(&e))
            .unwrap_or(false);
        if is_marker {
            return Ok(true);
        }
    }
    Ok(false)
}

/// All regular files under `dir`. A missing directory yields nothing.
pub async fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, HubdlError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    Ok(files)
}

/// Total size in bytes of all files under `dir`
pub async fn dir_size(dir: &Path) -> u64 {
    let Ok(files) = walk_files(dir).await else {
        return 0;
    };
    let mut total = 0;
    for file in files {
        if let Ok(meta) = fs::metadata(&file).await {
            total += meta.len();
        }
    }
    total
}

/// `<id with / → -->_<revision>_<8 hex content hash>_<8 hex random>`
///
/// Identical requests get distinct ids.
pub fn generate_task_id(
    repo: &RepoRef,
    include: &[String],
    exclude: &[String],
    target: Option<&Path>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.id.as_bytes());
    hasher.update(repo.kind.as_str().as_bytes());
    hasher.update(repo.revision.as_bytes());
    hasher.update(include.join(",").as_bytes());
    hasher.update(exclude.join(",").as_bytes());
    if let Some(target) = target {
        hasher.update(target.to_string_lossy().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    let random = uuid::Uuid::new_v4().simple().to_string();

    format!(
        "{}_{}_{}_{}",
        repo.id.replace('/', "--"),
        repo.revision,
        &digest[..8],
        &random[..8]
    )
}

/// Delete a task's files.
///
/// With include patterns only matching files go (by relative path or file
/// name); otherwise the whole directory is removed.
pub async fn remove_files(dir: &Path, include: &[String]) -> Result<(), HubdlError> {
    if !fs::try_exists(dir).await? {
        return Ok(());
    }

    let filter = FileFilter::new(include, &[]);
    if !filter.has_includes() {
        debug!("Removing directory {}", dir.display());
        fs::remove_dir_all(dir).await?;
        return Ok(());
    }

    for file in walk_files(dir).await? {
        let Ok(rel) = file.strip_prefix(dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let rel = strip_marker(&rel);
        if filter.includes_path_or_name(rel) {
            if let Err(e) = fs::remove_file(&file).await {
                warn!("Failed to delete {}: {}", file.display(), e);
            } else {
                debug!("Deleted {}", file.display());
            }
        }
    }
    Ok(())
}

fn strip_marker(rel: &str) -> &str {
    PARTIAL_MARKERS
        .iter()
        .find_map(|m| rel.strip_suffix(&format!(".{}", m)))
        .unwrap_or(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubdl_types::RepoKind;

    #[tokio::test]
    async fn test_missing_base_keeps_default_cache() {
        let repo = RepoRef::model("org/model");
        let dir = choose_target_dir(None, &repo, DuplicateAction::Check).await.unwrap();
        assert!(dir.is_none());
    }

    #[tokio::test]
    async fn test_check_rejects_occupied_dir() {
        let base = tempfile::tempdir().unwrap();
        let repo = RepoRef::model("org/model");
        let occupied = base.path().join("models--org--model");
        std::fs::create_dir_all(&occupied).unwrap();
        std::fs::write(occupied.join("config.json"), b"{}").unwrap();

        let err = choose_target_dir(Some(base.path()), &repo, DuplicateAction::Check)
            .await
            .unwrap_err();
        match err {
            HubdlError::DuplicateTarget { path } => assert_eq!(path, occupied),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_partial_marker_is_resumable() {
        let base = tempfile::tempdir().unwrap();
        let repo = RepoRef::new("org/set", RepoKind::Dataset, "main");
        let target = base.path().join("datasets--org--set");
        std::fs::create_dir_all(target.join("data")).unwrap();
        std::fs::write(target.join("data/train.parquet.incomplete"), b"xx").unwrap();

        let dir = choose_target_dir(Some(base.path()), &repo, DuplicateAction::Check)
            .await
            .unwrap();
        assert_eq!(dir, Some(target));
    }

    #[tokio::test]
    async fn test_rename_finds_next_free_suffix() {
        let base = tempfile::tempdir().unwrap();
        let repo = RepoRef::model("org/model");
        for name in ["models--org--model", "models--org--model_1"] {
            let dir = base.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("a.bin"), b"1").unwrap();
        }

        let dir = choose_target_dir(Some(base.path()), &repo, DuplicateAction::Rename)
            .await
            .unwrap();
        assert_eq!(dir, Some(base.path().join("models--org--model_2")));
    }

    #[test]
    fn test_task_ids_do_not_dedupe() {
        let repo = RepoRef::model("org/model");
        let a = generate_task_id(&repo, &[], &[], None);
        let b = generate_task_id(&repo, &[], &[], None);
        assert_ne!(a, b);
        assert!(a.starts_with("org--model_main_"));
        // Same request hash, different random suffix
        assert_eq!(&a[..a.len() - 8], &b[..b.len() - 8]);
    }

    #[tokio::test]
    async fn test_remove_files_by_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"1").unwrap();
        std::fs::write(dir.path().join("sub/other.gguf.aria2"), b"1").unwrap();
        std::fs::write(dir.path().join("README.md"), b"1").unwrap();

        remove_files(dir.path(), &["*.gguf".to_string()]).await.unwrap();

        assert!(!dir.path().join("model.gguf").exists());
        assert!(!dir.path().join("sub/other.gguf.aria2").exists());
        assert!(dir.path().join("README.md").exists());
    }
}
