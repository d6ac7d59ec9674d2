//! Fakes of the engine's collaborators
#![allow(dead_code)]

use async_trait::async_trait;
use hubdl_core::accelerator::{AcceleratorRpc, AddRequest, JobFile, JobStatus};
use hubdl_core::hub::{HubCacheLayout, RemoteFile, RepoMetadataProvider, StaticCredentials};
use hubdl_core::{AcceleratorError, Collaborators, HubdlCore, MetadataError};
use hubdl_types::{Backend, DownloadTask, EngineSettings, RepoRef};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct FixedListing(pub Vec<RemoteFile>);

#[async_trait]
impl RepoMetadataProvider for FixedListing {
    async fn repo_files(&self, _repo: &RepoRef) -> Result<Vec<RemoteFile>, MetadataError> {
        Ok(self.0.clone())
    }
}

/// Listing that takes `delay` to answer
pub struct SlowListing {
    pub delay: Duration,
    pub files: Vec<RemoteFile>,
}

#[async_trait]
impl RepoMetadataProvider for SlowListing {
    async fn repo_files(&self, _repo: &RepoRef) -> Result<Vec<RemoteFile>, MetadataError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.files.clone())
    }
}

pub fn lfs_file(path: &str, content: &[u8]) -> RemoteFile {
    RemoteFile {
        path: path.to_string(),
        size: content.len() as u64,
        sha256: Some(hex::encode(Sha256::digest(content))),
    }
}

#[derive(Debug, Clone)]
struct FakeJob {
    status: String,
    path: PathBuf,
}

/// In-memory accelerator daemon
pub struct FakeRpc {
    initial_status: String,
    error: Option<(String, String)>,
    jobs: Mutex<HashMap<String, FakeJob>>,
    add_delay: Duration,
    pub add_calls: AtomicUsize,
    next_gid: AtomicUsize,
}

impl FakeRpc {
    /// Jobs start in `status` (active, complete, ...)
    pub fn new(status: &str) -> Arc<Self> {
        Arc::new(Self {
            initial_status: status.to_string(),
            error: None,
            jobs: Mutex::new(HashMap::new()),
            add_delay: Duration::ZERO,
            add_calls: AtomicUsize::new(0),
            next_gid: AtomicUsize::new(1),
        })
    }

    /// Jobs fail right away with `code` and `message`
    pub fn failing(code: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            initial_status: "error".to_string(),
            error: Some((code.to_string(), message.to_string())),
            jobs: Mutex::new(HashMap::new()),
            add_delay: Duration::ZERO,
            add_calls: AtomicUsize::new(0),
            next_gid: AtomicUsize::new(1),
        })
    }

    /// Like [`FakeRpc::new`], but submitting jobs takes `add_delay`
    pub fn slow(status: &str, add_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            initial_status: status.to_string(),
            error: None,
            jobs: Mutex::new(HashMap::new()),
            add_delay,
            add_calls: AtomicUsize::new(0),
            next_gid: AtomicUsize::new(1),
        })
    }

    /// Status of every job ever submitted
    pub fn job_statuses(&self) -> Vec<String> {
        self.jobs.lock().values().map(|j| j.status.clone()).collect()
    }

    pub fn status_of(&self, gid: &str) -> Option<String> {
        self.jobs.lock().get(gid).map(|j| j.status.clone())
    }

    fn set_status(&self, gids: &[String], status: &str) {
        let mut jobs = self.jobs.lock();
        for gid in gids {
            if let Some(job) = jobs.get_mut(gid) {
                job.status = status.to_string();
            }
        }
    }
}

#[async_trait]
impl AcceleratorRpc for FakeRpc {
    async fn version(&self) -> Result<String, AcceleratorError> {
        Ok("fake".into())
    }

    async fn add_batch(&self, requests: &[AddRequest]) -> Result<Vec<String>, AcceleratorError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if !self.add_delay.is_zero() {
            tokio::time::sleep(self.add_delay).await;
        }
        let mut jobs = self.jobs.lock();
        Ok(requests
            .iter()
            .map(|r| {
                let gid = format!("{:016x}", self.next_gid.fetch_add(1, Ordering::SeqCst));
                jobs.insert(
                    gid.clone(),
                    FakeJob {
                        status: self.initial_status.clone(),
                        path: r.dir.join(&r.out),
                    },
                );
                gid
            })
            .collect())
    }

    async fn statuses(&self, gids: &[String]) -> Result<Vec<Option<JobStatus>>, AcceleratorError> {
        let jobs = self.jobs.lock();
        Ok(gids
            .iter()
            .map(|gid| {
                jobs.get(gid).map(|job| JobStatus {
                    gid: gid.clone(),
                    status: job.status.clone(),
                    total_length: 0,
                    completed_length: 0,
                    download_speed: 0,
                    error_code: self.error.as_ref().map(|(c, _)| c.clone()),
                    error_message: self.error.as_ref().map(|(_, m)| m.clone()),
                    files: vec![JobFile {
                        path: job.path.to_string_lossy().to_string(),
                    }],
                })
            })
            .collect())
    }

    async fn pause(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.set_status(gids, "paused");
        Ok(())
    }

    async fn unpause(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.set_status(gids, "active");
        Ok(())
    }

    async fn remove(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.set_status(gids, "removed");
        Ok(())
    }

    async fn change_global_options(&self, _options: Map<String, Value>) -> Result<(), AcceleratorError> {
        Ok(())
    }
}

/// Settings for accelerator-backed tests with a fast poll
pub fn accelerator_settings(poll_interval_ms: u64) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.backend = Backend::Accelerator;
    settings.accelerator.poll_interval_ms = poll_interval_ms;
    settings
}

pub async fn core_with(
    dir: &Path,
    settings: EngineSettings,
    files: Vec<RemoteFile>,
    rpc: Arc<FakeRpc>,
) -> HubdlCore {
    core_with_metadata(dir, settings, Arc::new(FixedListing(files)), rpc).await
}

pub async fn core_with_metadata(
    dir: &Path,
    settings: EngineSettings,
    metadata: Arc<dyn RepoMetadataProvider>,
    rpc: Arc<FakeRpc>,
) -> HubdlCore {
    let collaborators = Collaborators {
        metadata,
        credentials: Arc::new(StaticCredentials(None)),
        cache: Arc::new(HubCacheLayout::new(dir.join("cache"))),
        accelerator_rpc: rpc,
        manage_daemon: false,
    };
    HubdlCore::with_collaborators(dir.join("data"), settings, collaborators)
        .await
        .unwrap()
}

/// Poll until `pred` holds for the task, or panic after a few seconds
pub async fn wait_for<F>(core: &HubdlCore, id: &str, pred: F) -> DownloadTask
where
    F: Fn(&DownloadTask) -> bool,
{
    for _ in 0..250 {
        if let Some(task) = core.get_task(id) {
            if pred(&task) {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached the expected state: {:?}", core.get_task(id));
}
