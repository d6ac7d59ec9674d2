//! Accelerator bridge - runs tasks as job groups inside the shared daemon
//!
//! Each dispatched task gets a polling loop that folds the daemon's job
//! statuses into the same progress events a worker process would emit.

use crate::accelerator::daemon::{global_options, AcceleratorDaemon};
use crate::accelerator::rpc::{AcceleratorRpc, AddRequest, JobStatus};
use crate::engine::{resolve_url, ProgressSink};
use crate::error::HubdlError;
use crate::hub::{select_files, totals, CacheResolver, CredentialProvider, RepoMetadataProvider};
use crate::verify::Verifier;
use hubdl_types::{AcceleratorSettings, DownloadTask, ProgressKind, RepoRef, TaskStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Text used when the daemon gives no reason for a failed job
pub const UNKNOWN_JOB_ERROR: &str = "Typically network timeout or file IO error.";

/// Consecutive failed status polls before the task is failed
const MAX_POLL_FAILURES: u32 = 10;

/// Request from the orchestrator to a running monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobControl {
    Run,
    Pause,
    Cancel,
}

/// What the monitor loop needs to know about its task
#[derive(Debug, Clone)]
struct MonitorTarget {
    task_id: String,
    repo: RepoRef,
    include: Vec<String>,
    exclude: Vec<String>,
    local_dir: PathBuf,
}

/// Aggregate state of one job group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub downloaded_bytes: u64,
    pub downloaded_files: u64,
    pub speed_bytes_per_sec: u64,
    pub all_complete: bool,
    pub current_file: Option<String>,
    /// Aggregated message when any job failed
    pub error: Option<String>,
}

/// Fold job statuses into one summary
pub fn summarize(gids: &[String], statuses: &[Option<JobStatus>], local_dir: &Path) -> JobSummary {
    let mut summary = JobSummary {
        all_complete: true,
        ..Default::default()
    };
    let mut errors = Vec::new();

    for (gid, status) in gids.iter().zip(statuses) {
        let short: String = gid.chars().take(6).collect();
        let Some(status) = status else {
            summary.all_complete = false;
            errors.push(format!("GID {}: job is no longer known to the daemon", short));
            continue;
        };

        summary.downloaded_bytes += status.completed_length;
        summary.speed_bytes_per_sec += status.download_speed;

        if status.is_complete() {
            summary.downloaded_files += 1;
        } else {
            summary.all_complete = false;
        }

        if status.is_error() {
            let message = status
                .error_message
                .as_deref()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(UNKNOWN_JOB_ERROR);
            errors.push(format!(
                "GID {}: Code {} - {}",
                short,
                status.error_code.as_deref().unwrap_or("?"),
                message
            ));
        }

        if summary.current_file.is_none() && status.status == "active" {
            summary.current_file = status
                .files
                .first()
                .filter(|f| !f.path.is_empty())
                .map(|f| display_path(Path::new(&f.path), local_dir));
        }
    }

    if !errors.is_empty() {
        summary.error = Some(HubdlError::AcceleratorJob(errors.join("; ")).to_string());
    }
    summary
}

/// Path relative to the task directory when possible, else the file name
fn display_path(path: &Path, local_dir: &Path) -> String {
    match path.strip_prefix(local_dir) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string()),
    }
}

/// Drives the accelerator daemon on behalf of the orchestrator
pub struct AcceleratorBridge {
    rpc: Arc<dyn AcceleratorRpc>,
    daemon: Option<Arc<AcceleratorDaemon>>,
    metadata: Arc<dyn RepoMetadataProvider>,
    credentials: Arc<dyn CredentialProvider>,
    cache: Arc<dyn CacheResolver>,
    verifier: Verifier,
    endpoint: String,
    fallback_proxy: Option<String>,
    poll_interval: Mutex<Duration>,
    /// task id -> job ids
    groups: Mutex<HashMap<String, Vec<String>>>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

struct MonitorHandle {
    control: watch::Sender<JobControl>,
    join: JoinHandle<()>,
}

impl AcceleratorBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<dyn AcceleratorRpc>,
        daemon: Option<Arc<AcceleratorDaemon>>,
        metadata: Arc<dyn RepoMetadataProvider>,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<dyn CacheResolver>,
        verifier: Verifier,
        endpoint: String,
        fallback_proxy: Option<String>,
        settings: &AcceleratorSettings,
    ) -> Self {
        Self {
            rpc,
            daemon,
            metadata,
            credentials,
            cache,
            verifier,
            endpoint,
            fallback_proxy,
            poll_interval: Mutex::new(Duration::from_millis(settings.poll_interval_ms.max(50))),
            groups: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start the daemon ahead of the first dispatch
    pub async fn warm_up(&self) {
        if let Some(daemon) = &self.daemon {
            if let Err(e) = daemon.ensure_running().await {
                warn!("Accelerator daemon not available yet: {}", e);
            }
        }
    }

    /// Job ids currently recorded for a task
    pub fn job_group(&self, task_id: &str) -> Option<Vec<String>> {
        self.groups.lock().get(task_id).cloned()
    }

    /// Re-attach a job group recorded by an earlier process. The next
    /// dispatch resumes it, or submits anew if the daemon lost the jobs.
    pub fn restore_group(&self, task_id: &str, gids: Vec<String>) {
        if gids.is_empty() {
            return;
        }
        self.groups.lock().entry(task_id.to_string()).or_insert(gids);
    }

    /// Submit a task, or resume its existing job group.
    ///
    /// `status_of` reads the task's current status from the registry. If the
    /// task was paused or cancelled while the jobs were being set up, they are
    /// paused or removed again and `Ok(false)` is returned.
    pub async fn dispatch<F>(
        self: &Arc<Self>,
        task: &DownloadTask,
        sink: Arc<dyn ProgressSink>,
        status_of: F,
    ) -> Result<bool, HubdlError>
    where
        F: Fn() -> Option<TaskStatus> + Send + Sync,
    {
        if let Some(daemon) = &self.daemon {
            daemon.ensure_running().await?;
        }

        let target = MonitorTarget {
            task_id: task.id.clone(),
            repo: task.repo.clone(),
            include: task.include_patterns.clone(),
            exclude: task.exclude_patterns.clone(),
            local_dir: task
                .resolved_target_dir
                .clone()
                .unwrap_or_else(|| self.cache.snapshot_dir(&task.repo)),
        };

        if let Some(gids) = self.job_group(&task.id) {
            if self.resume_group(&gids).await {
                info!("Resumed {} accelerator jobs for task {}", gids.len(), task.id);
                return Ok(self.adopt(target, gids, sink, &status_of).await);
            }
            info!("Job group of task {} is stale, dispatching again", task.id);
            self.groups.lock().remove(&task.id);
            if let Err(e) = self.rpc.remove(&gids).await {
                debug!("Removing stale jobs of task {} failed: {}", task.id, e);
            }
        }

        let files = self.metadata.repo_files(&task.repo).await?;
        if !status_of().is_some_and(TaskStatus::is_active) {
            info!("Task {} stopped before its jobs were submitted", task.id);
            return Ok(false);
        }
        let files = select_files(files, &task.include_patterns, &task.exclude_patterns);
        let (total_bytes, total_files) = totals(&files);
        sink.emit(ProgressKind::Meta {
            total_bytes,
            total_files,
        });

        let headers: Vec<String> = self
            .credentials
            .token()
            .map(|t| vec![format!("Authorization: Bearer {}", t)])
            .unwrap_or_default();

        let requests: Vec<AddRequest> = files
            .iter()
            .map(|file| {
                let dest = target.local_dir.join(&file.path);
                AddRequest {
                    uri: resolve_url(&self.endpoint, &task.repo, &file.path),
                    dir: dest.parent().map(Path::to_path_buf).unwrap_or_else(|| target.local_dir.clone()),
                    out: dest
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| file.path.clone()),
                    headers: headers.clone(),
                }
            })
            .collect();

        let gids = self.rpc.add_batch(&requests).await?;
        info!("Dispatched {} accelerator jobs for task {}", gids.len(), task.id);
        Ok(self.adopt(target, gids, sink, &status_of).await)
    }

    /// Record a job group and start its monitor, unless the task stopped
    /// meanwhile. Returns whether the jobs are running.
    async fn adopt<F>(
        self: &Arc<Self>,
        target: MonitorTarget,
        gids: Vec<String>,
        sink: Arc<dyn ProgressSink>,
        status_of: &F,
    ) -> bool
    where
        F: Fn() -> Option<TaskStatus>,
    {
        let task_id = target.task_id.clone();

        // Pause and cancel look for the group under this lock
        let status = {
            let mut groups = self.groups.lock();
            let status = status_of();
            match status {
                Some(s) if s.is_active() => {
                    groups.insert(task_id.clone(), gids.clone());
                    self.spawn_monitor(target, gids.clone(), sink);
                }
                Some(TaskStatus::Paused) => {
                    groups.insert(task_id.clone(), gids.clone());
                }
                _ => {
                    groups.remove(&task_id);
                }
            }
            status
        };

        match status {
            Some(s) if s.is_active() => true,
            Some(TaskStatus::Paused) => {
                info!("Task {} was paused during dispatch, pausing its jobs", task_id);
                if let Err(e) = self.rpc.pause(&gids).await {
                    warn!("Failed to pause jobs of task {}: {}", task_id, e);
                }
                false
            }
            _ => {
                info!("Task {} stopped during dispatch, removing its jobs", task_id);
                if let Err(e) = self.rpc.remove(&gids).await {
                    debug!("Removing jobs of task {} failed: {}", task_id, e);
                }
                false
            }
        }
    }

    /// Unpause a previous job group. Returns false if any job is unusable.
    async fn resume_group(&self, gids: &[String]) -> bool {
        let statuses = match self.rpc.statuses(gids).await {
            Ok(statuses) => statuses,
            Err(e) => {
                debug!("Could not query job group: {}", e);
                return false;
            }
        };

        let mut paused = Vec::new();
        for (gid, status) in gids.iter().zip(&statuses) {
            match status {
                Some(s) if s.is_paused() => paused.push(gid.clone()),
                Some(s) if s.is_live() || s.is_complete() => {}
                _ => return false,
            }
        }

        if paused.is_empty() {
            return true;
        }
        match self.rpc.unpause(&paused).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to unpause jobs: {}", e);
                false
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, target: MonitorTarget, gids: Vec<String>, sink: Arc<dyn ProgressSink>) {
        let (control, rx) = watch::channel(JobControl::Run);
        let task_id = target.task_id.clone();
        let bridge = self.clone();
        let join = tokio::spawn(async move { bridge.monitor_loop(target, gids, sink, rx).await });
        if let Some(previous) = self.monitors.lock().insert(task_id, MonitorHandle { control, join }) {
            previous.join.abort();
        }
    }

    async fn monitor_loop(
        self: Arc<Self>,
        target: MonitorTarget,
        gids: Vec<String>,
        sink: Arc<dyn ProgressSink>,
        mut control: watch::Receiver<JobControl>,
    ) {
        let poll_interval = *self.poll_interval.lock();
        let mut interval = tokio::time::interval(poll_interval);
        let mut current_file: Option<String> = None;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() {
                        debug!("Monitor for task {} released", target.task_id);
                        return;
                    }
                    let request = *control.borrow_and_update();
                    match request {
                        JobControl::Run => continue,
                        JobControl::Pause => {
                            if let Err(e) = self.rpc.pause(&gids).await {
                                warn!("Failed to pause jobs of task {}: {}", target.task_id, e);
                            }
                            return;
                        }
                        JobControl::Cancel => {
                            if let Err(e) = self.rpc.remove(&gids).await {
                                warn!("Failed to remove jobs of task {}: {}", target.task_id, e);
                            }
                            return;
                        }
                    }
                }
                _ = interval.tick() => {}
            }

            let statuses = match self.rpc.statuses(&gids).await {
                Ok(statuses) => {
                    failures = 0;
                    statuses
                }
                Err(e) => {
                    failures += 1;
                    warn!("Status poll for task {} failed ({}): {}", target.task_id, failures, e);
                    if failures >= MAX_POLL_FAILURES {
                        self.release(&target.task_id);
                        sink.emit(ProgressKind::Error {
                            message: format!("Accelerator daemon unreachable: {}", e),
                        });
                        return;
                    }
                    continue;
                }
            };

            let summary = summarize(&gids, &statuses, &target.local_dir);
            if summary.current_file != current_file {
                if let Some(file) = &summary.current_file {
                    sink.emit(ProgressKind::FileStart {
                        filename: file.clone(),
                    });
                }
                current_file = summary.current_file.clone();
            }
            sink.emit(ProgressKind::AcceleratorUpdate {
                downloaded_bytes: summary.downloaded_bytes,
                downloaded_files: summary.downloaded_files,
                speed_bytes_per_sec: summary.speed_bytes_per_sec,
            });

            if let Some(message) = summary.error {
                warn!("Accelerator jobs of task {} failed: {}", target.task_id, message);
                self.release(&target.task_id);
                sink.emit(ProgressKind::Error { message });
                return;
            }

            if summary.all_complete {
                self.release(&target.task_id);
                self.finish(&target, sink.as_ref()).await;
                return;
            }
        }
    }

    /// Verification after every job completed
    async fn finish(&self, target: &MonitorTarget, sink: &dyn ProgressSink) {
        sink.emit(ProgressKind::DownloadDone {
            result_path: target.local_dir.clone(),
        });
        sink.emit(ProgressKind::StatusChange {
            status: TaskStatus::Verifying,
        });

        match self
            .verifier
            .verify(&target.repo, &target.include, &target.exclude, Some(&target.local_dir))
            .await
        {
            Ok(result) if result.is_valid => sink.emit(ProgressKind::Completed {
                result_path: Some(target.local_dir.clone()),
            }),
            Ok(result) => sink.emit(ProgressKind::VerificationFailed {
                message: result.failure_message(),
            }),
            Err(e) => sink.emit(ProgressKind::Error {
                message: e.to_string(),
            }),
        }
    }

    /// The job group is done with; forget it
    fn release(&self, task_id: &str) {
        self.groups.lock().remove(task_id);
        self.monitors.lock().remove(task_id);
    }

    /// Suspend a task's jobs, keeping the job group for a later resume.
    ///
    /// Returns after the pause request reached the daemon.
    pub async fn pause(&self, task_id: &str) {
        let monitor = self.monitors.lock().remove(task_id);
        match monitor {
            Some(monitor) => {
                let _ = monitor.control.send(JobControl::Pause);
                if let Err(e) = monitor.join.await {
                    debug!("Monitor for task {} ended abnormally: {}", task_id, e);
                }
            }
            None => {
                if let Some(gids) = self.job_group(task_id) {
                    if let Err(e) = self.rpc.pause(&gids).await {
                        warn!("Failed to pause jobs of task {}: {}", task_id, e);
                    }
                }
            }
        }
    }

    /// Remove a task's jobs from the daemon. Does not wait for acknowledgment.
    pub fn cancel(&self, task_id: &str) {
        let gids = self.groups.lock().remove(task_id);
        let monitor = self.monitors.lock().remove(task_id);
        match (monitor, gids) {
            (Some(monitor), _) => {
                let _ = monitor.control.send(JobControl::Cancel);
            }
            (None, Some(gids)) => {
                let rpc = self.rpc.clone();
                tokio::spawn(async move {
                    if let Err(e) = rpc.remove(&gids).await {
                        debug!("Removing jobs failed: {}", e);
                    }
                });
            }
            (None, None) => {}
        }
    }

    /// Push changed tunables to the daemon. Failures are logged only.
    pub async fn update_options(&self, settings: &AcceleratorSettings) {
        *self.poll_interval.lock() = Duration::from_millis(settings.poll_interval_ms.max(50));
        if let Some(daemon) = &self.daemon {
            daemon.set_settings(settings);
        }

        let options = global_options(settings, self.fallback_proxy.as_deref());
        match self.rpc.change_global_options(options).await {
            Ok(()) => debug!("Accelerator options updated"),
            Err(e) => warn!("Could not update accelerator options (daemon may not be running): {}", e),
        }
    }

    /// Stop all monitor loops and a daemon this process spawned
    pub async fn shutdown(&self) {
        let monitors: Vec<MonitorHandle> = self.monitors.lock().drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.join.abort();
        }
        if let Some(daemon) = &self.daemon {
            daemon.shutdown().await;
        }
    }
}
