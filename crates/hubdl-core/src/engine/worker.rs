//! Worker unit - one task's transfer plus verification
//!
//! The worker runs in its own process. It receives everything it needs by
//! value in [`WorkerParams`] and talks back only through its progress sink.

use crate::engine::sink::{ProgressSink, StdoutSink};
use crate::engine::transfer::{HubTransfer, TransferBackend, TransferPlan};
use crate::error::{HubdlError, TransferError};
use crate::hub::{
    select_files, totals, CacheResolver, HubApi, HubCacheLayout, RepoMetadataProvider,
    StaticCredentials,
};
use crate::target::dir_size;
use crate::verify::Verifier;
use hubdl_types::{ProgressKind, RepoRef, TaskStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often the disk sampler measures the target directory
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Everything a worker needs, passed by value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerParams {
    pub task_id: String,
    pub repo: RepoRef,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Destination (None = default cache snapshot)
    pub local_dir: Option<PathBuf>,
    pub accelerated: bool,
    pub endpoint: String,
    pub proxy_url: Option<String>,
    pub token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub transfer_workers: usize,
    pub verify_workers: usize,
}

/// The collaborators a worker runs against
pub struct WorkerUnit {
    metadata: Arc<dyn RepoMetadataProvider>,
    transfer: Arc<dyn TransferBackend>,
    cache: Arc<dyn CacheResolver>,
    verifier: Verifier,
}

impl WorkerUnit {
    pub fn new(
        metadata: Arc<dyn RepoMetadataProvider>,
        transfer: Arc<dyn TransferBackend>,
        cache: Arc<dyn CacheResolver>,
        verify_workers: usize,
    ) -> Self {
        let verifier = Verifier::new(metadata.clone(), cache.clone(), verify_workers);
        Self {
            metadata,
            transfer,
            cache,
            verifier,
        }
    }

    /// Build the default hub-backed collaborators from the parameters
    pub fn from_params(params: &WorkerParams) -> Result<Self, HubdlError> {
        let credentials = Arc::new(StaticCredentials(params.token.clone()));
        let proxy = params.proxy_url.as_deref();
        let metadata = Arc::new(HubApi::new(&params.endpoint, proxy, credentials.clone())?);
        let transfer = Arc::new(HubTransfer::new(
            &params.endpoint,
            proxy,
            credentials,
            params.transfer_workers,
        )?);
        let cache: Arc<dyn CacheResolver> = match &params.cache_dir {
            Some(dir) => Arc::new(HubCacheLayout::new(dir)),
            None => Arc::new(HubCacheLayout::from_env()),
        };
        Ok(Self::new(metadata, transfer, cache, params.verify_workers))
    }

    /// Run the task to a terminal event.
    ///
    /// Failures are reported as a single `error` event. A cancelled run
    /// reports nothing.
    pub async fn run(&self, params: &WorkerParams, sink: Arc<dyn ProgressSink>, cancel: CancellationToken) {
        match self.execute(params, sink.clone(), &cancel).await {
            Ok(()) => {}
            Err(HubdlError::Transfer(TransferError::Cancelled)) => {
                info!("Task {} stopped", params.task_id);
            }
            Err(e) => {
                error!("Task {} failed: {}", params.task_id, e);
                sink.emit(ProgressKind::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn execute(
        &self,
        params: &WorkerParams,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), HubdlError> {
        let files = self.metadata.repo_files(&params.repo).await?;
        let files = select_files(files, &params.include_patterns, &params.exclude_patterns);
        let (total_bytes, total_files) = totals(&files);
        sink.emit(ProgressKind::Meta {
            total_bytes,
            total_files,
        });

        let local_dir = params
            .local_dir
            .clone()
            .unwrap_or_else(|| self.cache.snapshot_dir(&params.repo));
        tokio::fs::create_dir_all(&local_dir).await?;

        let plan = TransferPlan {
            repo: params.repo.clone(),
            files,
            local_dir: local_dir.clone(),
        };

        let result = match self.transfer_once(&plan, params.accelerated, &sink, cancel).await {
            Err(e) if params.accelerated && !matches!(e, TransferError::Cancelled) => {
                warn!(
                    "Accelerated transfer of {} failed ({}), retrying without acceleration",
                    params.task_id, e
                );
                sink.emit(ProgressKind::TransferRestart { accelerated: false });
                self.transfer_once(&plan, false, &sink, cancel).await?
            }
            other => other?,
        };

        sink.emit(ProgressKind::DownloadDone {
            result_path: result.clone(),
        });
        sink.emit(ProgressKind::StatusChange {
            status: TaskStatus::Verifying,
        });

        let verification = self
            .verifier
            .verify(
                &params.repo,
                &params.include_patterns,
                &params.exclude_patterns,
                Some(&result),
            )
            .await?;

        if verification.is_valid {
            sink.emit(ProgressKind::Completed {
                result_path: Some(result),
            });
        } else {
            sink.emit(ProgressKind::VerificationFailed {
                message: verification.failure_message(),
            });
        }
        Ok(())
    }

    /// One transfer attempt, with disk sampling when the backend is silent
    async fn transfer_once(
        &self,
        plan: &TransferPlan,
        accelerated: bool,
        sink: &Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        let sampler = if self.transfer.reports_bytes(accelerated) {
            None
        } else {
            let stop = cancel.child_token();
            let handle = tokio::spawn(sample_disk(plan.local_dir.clone(), sink.clone(), stop.clone()));
            Some((stop, handle))
        };

        let result = self
            .transfer
            .transfer(plan, accelerated, sink.as_ref(), cancel)
            .await;

        if let Some((stop, handle)) = sampler {
            stop.cancel();
            let _ = handle.await;
        }
        result
    }
}

/// Emit `monitor_update` with the on-disk size of `dir` whenever it changes
async fn sample_disk(dir: PathBuf, sink: Arc<dyn ProgressSink>, stop: CancellationToken) {
    let mut last = None;
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }
        let size = dir_size(&dir).await;
        if last != Some(size) {
            sink.emit(ProgressKind::MonitorUpdate {
                downloaded_bytes: size,
            });
            last = Some(size);
        }
    }
}

/// Worker process entry point.
///
/// Reads one JSON [`WorkerParams`] line from stdin and writes progress events
/// to stdout. Closing stdin asks the worker to stop.
pub async fn run_stdio() -> Result<(), HubdlError> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    stdin.read_line(&mut line).await?;
    let params: WorkerParams = serde_json::from_str(line.trim())?;

    info!("Worker started for task {}", params.task_id);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            // Anything after the parameter line is ignored; EOF means stop
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut stdin, &mut sink).await;
            cancel.cancel();
        })
    };

    let sink: Arc<dyn ProgressSink> = Arc::new(StdoutSink::new(params.task_id.clone()));
    let unit = match WorkerUnit::from_params(&params) {
        Ok(unit) => unit,
        Err(e) => {
            sink.emit(ProgressKind::Error {
                message: e.to_string(),
            });
            return Err(e);
        }
    };
    unit.run(&params, sink, cancel).await;

    watcher.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sink::ChannelSink;
    use crate::error::MetadataError;
    use crate::hub::RemoteFile;
    use async_trait::async_trait;
    use hubdl_types::ProgressEvent;
    use sha2::{Digest, Sha256};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FixedListing(Vec<RemoteFile>);

    #[async_trait]
    impl RepoMetadataProvider for FixedListing {
        async fn repo_files(&self, _repo: &RepoRef) -> Result<Vec<RemoteFile>, MetadataError> {
            Ok(self.0.clone())
        }
    }

    /// Writes fixed content; an accelerated attempt fails after `fail_after` files
    struct LocalTransfer {
        content: Vec<u8>,
        fail_accelerated: bool,
        fail_after: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TransferBackend for LocalTransfer {
        fn reports_bytes(&self, _accelerated: bool) -> bool {
            true
        }

        async fn transfer(
            &self,
            plan: &TransferPlan,
            accelerated: bool,
            sink: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> Result<PathBuf, TransferError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            for (i, file) in plan.files.iter().enumerate() {
                if accelerated && self.fail_accelerated && i == self.fail_after {
                    return Err(TransferError::Status {
                        file: file.path.clone(),
                        status: 500,
                    });
                }
                std::fs::write(plan.local_dir.join(&file.path), &self.content)?;
                sink.emit(ProgressKind::Progress {
                    inc: self.content.len() as u64,
                    is_byte_unit: true,
                });
                sink.emit(ProgressKind::Progress {
                    inc: 1,
                    is_byte_unit: false,
                });
            }
            Ok(plan.local_dir.clone())
        }
    }

    struct NoCache;

    impl CacheResolver for NoCache {
        fn snapshot_dir(&self, _repo: &RepoRef) -> PathBuf {
            PathBuf::from("/nonexistent")
        }
    }

    fn params(dir: &Path, accelerated: bool) -> WorkerParams {
        WorkerParams {
            task_id: "t1".into(),
            repo: RepoRef::model("org/model"),
            include_patterns: vec!["*.safetensors".into()],
            exclude_patterns: Vec::new(),
            local_dir: Some(dir.to_path_buf()),
            accelerated,
            endpoint: "https://hub.example".into(),
            proxy_url: None,
            token: None,
            cache_dir: None,
            transfer_workers: 2,
            verify_workers: 2,
        }
    }

    async fn run_unit(
        content: &[u8],
        expected_sha: String,
        fail_accelerated: bool,
        accelerated: bool,
    ) -> (Vec<ProgressEvent>, usize) {
        let dir = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing(vec![
            RemoteFile {
                path: "model.safetensors".into(),
                size: content.len() as u64,
                sha256: Some(expected_sha),
            },
            RemoteFile {
                path: "pytorch_model.bin".into(),
                size: 10,
                sha256: None,
            },
        ]));
        let transfer = Arc::new(LocalTransfer {
            content: content.to_vec(),
            fail_accelerated,
            fail_after: 0,
            attempts: AtomicUsize::new(0),
        });
        let unit = WorkerUnit::new(listing, transfer.clone(), Arc::new(NoCache), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn ProgressSink> = Arc::new(ChannelSink::new("t1", tx));
        unit.run(&params(dir.path(), accelerated), sink, CancellationToken::new())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (events, transfer.attempts.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_worker_emits_meta_then_completed() {
        let content = b"tensor data".to_vec();
        let sha = hex::encode(Sha256::digest(&content));
        let (events, _) = run_unit(&content, sha, false, false).await;

        assert_eq!(
            events[0].kind,
            ProgressKind::Meta {
                total_bytes: content.len() as u64,
                total_files: 1
            }
        );
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, ProgressKind::StatusChange { status: TaskStatus::Verifying })));
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(ProgressKind::Completed { result_path: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_worker_reports_verification_failure() {
        let (events, _) = run_unit(b"tensor data", "00".repeat(32), false, false).await;
        match events.last().map(|e| &e.kind) {
            Some(ProgressKind::VerificationFailed { message }) => {
                assert_eq!(message, "Verification failed: 1 files corrupted");
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accelerated_failure_retries_once_unaccelerated() {
        let content = b"tensor data".to_vec();
        let sha = hex::encode(Sha256::digest(&content));
        let (events, attempts) = run_unit(&content, sha, true, true).await;

        assert_eq!(attempts, 2);
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(ProgressKind::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fallback_retry_keeps_counts_within_totals() {
        use crate::engine::ProgressMonitor;
        use hubdl_types::{Backend, DownloadTask, Transition};
        use std::time::Instant;

        let content = vec![7u8; 500];
        let sha = hex::encode(Sha256::digest(&content));
        let dir = tempfile::tempdir().unwrap();
        let listing = Arc::new(FixedListing(
            ["a.safetensors", "b.safetensors"]
                .iter()
                .map(|path| RemoteFile {
                    path: path.to_string(),
                    size: 500,
                    sha256: Some(sha.clone()),
                })
                .collect(),
        ));
        // The accelerated attempt lands the first file, then fails
        let transfer = Arc::new(LocalTransfer {
            content,
            fail_accelerated: true,
            fail_after: 1,
            attempts: AtomicUsize::new(0),
        });
        let unit = WorkerUnit::new(listing, transfer.clone(), Arc::new(NoCache), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn ProgressSink> = Arc::new(ChannelSink::new("t1", tx));
        unit.run(&params(dir.path(), true), sink, CancellationToken::new())
            .await;
        assert_eq!(transfer.attempts.load(Ordering::SeqCst), 2);

        let mut monitor = ProgressMonitor::new();
        let mut task = DownloadTask::new("t1".into(), RepoRef::model("org/model"), Backend::IsolatedProcess);
        task.transition(Transition::Start).unwrap();
        let now = Instant::now();
        while let Ok(event) = rx.try_recv() {
            monitor.apply(&mut task, &event.kind, now);
            assert!(task.downloaded_bytes <= 1000, "bytes overshot: {}", task.downloaded_bytes);
            assert!(task.downloaded_files <= 2, "files overshot: {}", task.downloaded_files);
        }
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.downloaded_bytes, 1000);
        assert_eq!(task.downloaded_files, 2);
    }
}
