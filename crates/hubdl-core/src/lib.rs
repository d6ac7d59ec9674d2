//! hubdl Core - Download Orchestration Engine
//!
//! This crate fetches filtered subsets of hub repositories. Each task runs
//! in an isolated worker process or as a job group in the accelerator
//! daemon; both report through one progress channel into a single monitor
//! that owns all task mutation.

pub mod accelerator;
pub mod engine;
mod error;
pub mod hub;
mod patterns;
mod storage;
mod target;
mod verify;

pub use engine::run_stdio;
pub use error::*;
pub use patterns::*;
pub use storage::*;
pub use target::*;
pub use verify::*;

use accelerator::{AcceleratorBridge, AcceleratorDaemon, AcceleratorRpc, Aria2Client};
use engine::{
    Applied, ChannelSink, Persistence, ProgressMonitor, ProgressSink, TaskDatabase, WorkerHandle,
    WorkerLauncher, WorkerParams,
};
use hub::{CacheResolver, CredentialProvider, EnvCredentials, HubApi, HubCacheLayout, RepoMetadataProvider};
use hubdl_types::{
    Backend, DownloadTask, DuplicateAction, EngineSettings, PatternPreset, ProgressEvent, RepoRef,
    TaskEvent, TaskStatus, Transition, VerificationResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the monitor looks for stalled tasks
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Receives a snapshot after every task mutation.
///
/// Failures and panics are swallowed; observers never affect the engine.
pub trait TaskObserver: Send + Sync {
    fn on_task(&self, task: &DownloadTask) -> anyhow::Result<()>;
}

impl<F> TaskObserver for F
where
    F: Fn(&DownloadTask) -> anyhow::Result<()> + Send + Sync,
{
    fn on_task(&self, task: &DownloadTask) -> anyhow::Result<()> {
        self(task)
    }
}

/// External services the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn RepoMetadataProvider>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub cache: Arc<dyn CacheResolver>,
    pub accelerator_rpc: Arc<dyn AcceleratorRpc>,
    /// Start and stop the accelerator daemon from this process
    pub manage_daemon: bool,
}

impl Collaborators {
    /// Hub-backed defaults built from the settings and the environment
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, HubdlError> {
        let credentials: Arc<dyn CredentialProvider> = Arc::new(EnvCredentials);
        let metadata = Arc::new(HubApi::new(
            settings.endpoint.clone(),
            settings.proxy_url.as_deref(),
            credentials.clone(),
        )?);
        let accel = &settings.accelerator;
        let rpc = Aria2Client::new(accel.port, &accel.secret, accel.batch_size)?;

        Ok(Self {
            metadata,
            credentials,
            cache: Arc::new(HubCacheLayout::from_env()),
            accelerator_rpc: Arc::new(rpc),
            manage_daemon: true,
        })
    }
}

/// Download request for [`HubdlCore::queue_download`]
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub repo: RepoRef,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub preset: Option<PatternPreset>,
    /// Base directory (None = settings, then the default cache)
    pub target_dir: Option<PathBuf>,
    pub on_duplicate: DuplicateAction,
    /// Override of the configured backend
    pub backend: Option<Backend>,
    pub accelerated: Option<bool>,
}

impl QueueRequest {
    pub fn new(repo: RepoRef) -> Self {
        Self {
            repo,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            preset: None,
            target_dir: None,
            on_duplicate: DuplicateAction::default(),
            backend: None,
            accelerated: None,
        }
    }
}

/// Worker process of a task, or the promise of one while it starts
enum WorkerSlot {
    /// `started` resolves once the spawn attempt settled
    Starting {
        attempt: u64,
        started: oneshot::Receiver<()>,
    },
    Running(WorkerHandle),
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, DownloadTask>,
    monitor: ProgressMonitor,
}

/// State shared with the monitor task
struct Shared {
    registry: Mutex<Registry>,
    workers: Mutex<HashMap<String, WorkerSlot>>,
    spawn_attempts: AtomicU64,
    persistence: Persistence,
    event_tx: broadcast::Sender<TaskEvent>,
    observers: Mutex<Vec<Arc<dyn TaskObserver>>>,
}

impl Shared {
    fn notify(&self, task: &DownloadTask) {
        let _ = self.event_tx.send(TaskEvent::Updated { task: task.clone() });

        let observers = self.observers.lock().clone();
        for observer in observers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_task(task))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Observer failed for task {}: {}", task.id, e),
                Err(_) => warn!("Observer panicked for task {}", task.id),
            }
        }
    }

    /// Apply one progress event under the registry lock
    fn apply_event(&self, event: ProgressEvent) {
        let (snapshot, finished) = {
            let mut registry = self.registry.lock();
            let Registry { tasks, monitor } = &mut *registry;
            let Some(task) = tasks.get_mut(&event.task_id) else {
                debug!("Progress for unknown task {}", event.task_id);
                return;
            };
            let applied = monitor.apply(task, &event.kind, Instant::now());
            if !applied.changed() {
                return;
            }
            if applied == Applied::Finished {
                task.accelerator_jobs.clear();
            }
            self.persistence.upsert(task);
            (task.clone(), applied == Applied::Finished)
        };

        if finished {
            match snapshot.status {
                TaskStatus::Completed => info!("Task {} completed", snapshot.id),
                _ => warn!(
                    "Task {} failed: {}",
                    snapshot.id,
                    snapshot.error_message.as_deref().unwrap_or_default()
                ),
            }
            let handle = {
                let mut workers = self.workers.lock();
                match workers.remove(&snapshot.id) {
                    Some(WorkerSlot::Running(handle)) => Some(handle),
                    Some(starting) => {
                        workers.insert(snapshot.id.clone(), starting);
                        None
                    }
                    None => None,
                }
            };
            if let Some(handle) = handle {
                tokio::spawn(handle.reap());
            }
        }
        self.notify(&snapshot);
    }

    fn sweep(&self) {
        let snapshots: Vec<DownloadTask> = {
            let mut registry = self.registry.lock();
            let Registry { tasks, monitor } = &mut *registry;
            let changed = monitor.sweep(tasks.values_mut(), Instant::now());
            changed.iter().filter_map(|id| tasks.get(id).cloned()).collect()
        };
        for task in &snapshots {
            self.notify(task);
        }
    }
}

/// The single consumer of the progress channel
async fn run_monitor(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => shared.apply_event(event),
                None => break,
            },
            _ = sweep.tick() => shared.sweep(),
        }
    }
    debug!("Progress monitor stopped");
}

/// The main hubdl core instance
#[derive(Clone)]
pub struct HubdlCore {
    shared: Arc<Shared>,
    storage: Storage,
    settings: Arc<RwLock<EngineSettings>>,
    collaborators: Collaborators,
    bridge: Arc<AcceleratorBridge>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    shutdown: CancellationToken,
    /// Held until shutdown so only one process drives the data directory
    dir_lock: Arc<Mutex<Option<DataDirLock>>>,
}

/// Tasks and settings as stored, read without taking over the data directory
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tasks: Vec<DownloadTask>,
    pub settings: EngineSettings,
}

/// Read the stored registry while another process may be running it.
///
/// Active tasks are reported as stored; nothing is rewritten.
pub async fn read_snapshot(data_dir: PathBuf) -> Result<Snapshot, HubdlError> {
    let storage = Storage::new(data_dir).await?;
    let settings = storage.load_settings().await?;
    let tasks = TaskDatabase::new(storage.database_path()).await?.load_all_tasks().await?;
    Ok(Snapshot { tasks, settings })
}

impl HubdlCore {
    /// Create a core with settings from `data_dir` and the default collaborators
    pub async fn new(data_dir: PathBuf) -> Result<Self, HubdlError> {
        let storage = Storage::new(data_dir.clone()).await?;
        let settings = storage.load_settings().await?;
        let collaborators = Collaborators::from_settings(&settings)?;
        Self::with_collaborators(data_dir, settings, collaborators).await
    }

    /// Create a core with explicit settings and collaborators.
    ///
    /// Fails with [`HubdlError::DataDirBusy`] while another core holds `data_dir`.
    pub async fn with_collaborators(
        data_dir: PathBuf,
        settings: EngineSettings,
        collaborators: Collaborators,
    ) -> Result<Self, HubdlError> {
        let storage = Storage::new(data_dir).await?;
        let dir_lock = storage.lock()?;
        let db = TaskDatabase::new(storage.database_path()).await?;
        let loaded = db.load_all_tasks().await?;
        let persistence = Persistence::spawn(db);

        // Interrupted tasks never come back as running
        let mut tasks = HashMap::new();
        let mut restart = Vec::new();
        let mut job_groups = Vec::new();
        for mut task in loaded {
            if task.status.is_active() {
                task.status = if settings.auto_resume_incomplete {
                    restart.push(task.id.clone());
                    TaskStatus::Pending
                } else {
                    TaskStatus::Paused
                };
                task.speed_bytes_per_sec = 0;
                task.current_file = None;
                task.recompute_progress();
                persistence.upsert(&task);
                info!("Task {} was interrupted, now {}", task.id, task.status);
            }
            if task.backend == Backend::Accelerator && !task.status.is_finished() && !task.accelerator_jobs.is_empty() {
                job_groups.push((task.id.clone(), task.accelerator_jobs.clone()));
            }
            tasks.insert(task.id.clone(), task);
        }
        info!("Loaded {} tasks", tasks.len());

        let (event_tx, _) = broadcast::channel(1000);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                tasks,
                monitor: ProgressMonitor::new(),
            }),
            workers: Mutex::new(HashMap::new()),
            spawn_attempts: AtomicU64::new(0),
            persistence,
            event_tx,
            observers: Mutex::new(Vec::new()),
        });

        let daemon = collaborators.manage_daemon.then(|| {
            Arc::new(AcceleratorDaemon::new(
                settings.accelerator.clone(),
                settings.proxy_url.clone(),
                collaborators.accelerator_rpc.clone(),
            ))
        });
        let verifier = Verifier::new(
            collaborators.metadata.clone(),
            collaborators.cache.clone(),
            settings.verify_workers as usize,
        );
        let bridge = Arc::new(AcceleratorBridge::new(
            collaborators.accelerator_rpc.clone(),
            daemon,
            collaborators.metadata.clone(),
            collaborators.credentials.clone(),
            collaborators.cache.clone(),
            verifier,
            settings.endpoint.clone(),
            settings.proxy_url.clone(),
            &settings.accelerator,
        ));
        for (id, gids) in job_groups {
            debug!("Task {} has {} accelerator jobs from an earlier run", id, gids.len());
            bridge.restore_group(&id, gids);
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_monitor(shared.clone(), progress_rx, shutdown.clone()));

        let core = Self {
            shared,
            storage,
            settings: Arc::new(RwLock::new(settings)),
            collaborators,
            bridge,
            progress_tx,
            shutdown,
            dir_lock: Arc::new(Mutex::new(Some(dir_lock))),
        };

        for id in restart {
            let core = core.clone();
            tokio::spawn(async move {
                if let Err(e) = core.start_download(&id).await {
                    error!("Failed to resume task {}: {}", id, e);
                }
            });
        }

        Ok(core)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register an observer called on every task mutation
    pub fn subscribe(&self, observer: impl TaskObserver + 'static) {
        self.shared.observers.lock().push(Arc::new(observer));
    }

    /// Broadcast of task updates and removals
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Sink feeding events for `task_id` into the progress channel
    pub fn progress_sink(&self, task_id: &str) -> Arc<dyn ProgressSink> {
        Arc::new(ChannelSink::new(task_id, self.progress_tx.clone()))
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create a PENDING task. Fails if the target is taken under `Check`.
    pub async fn queue_download(&self, request: QueueRequest) -> Result<String, HubdlError> {
        let QueueRequest {
            repo,
            mut include_patterns,
            mut exclude_patterns,
            preset,
            target_dir,
            on_duplicate,
            backend,
            accelerated,
        } = request;

        if let Some(preset) = preset {
            apply_preset(&mut include_patterns, &mut exclude_patterns, preset);
        }

        let (base, default_backend, default_accelerated) = {
            let settings = self.settings.read();
            (
                target_dir.or_else(|| settings.download_dir.clone()),
                settings.backend,
                settings.accelerated_transfer,
            )
        };

        let resolved = choose_target_dir(base.as_deref(), &repo, on_duplicate).await?;
        let id = generate_task_id(&repo, &include_patterns, &exclude_patterns, resolved.as_deref());

        let mut task = DownloadTask::new(id.clone(), repo, backend.unwrap_or(default_backend));
        task.include_patterns = include_patterns;
        task.exclude_patterns = exclude_patterns;
        task.target_dir = base;
        task.resolved_target_dir = resolved;
        task.accelerated = accelerated.unwrap_or(default_accelerated);

        info!("Queued task {} for {}", id, task.repo.id);
        self.shared.registry.lock().tasks.insert(id.clone(), task.clone());
        self.shared.persistence.upsert(&task);
        self.shared.notify(&task);
        Ok(id)
    }

    /// Dispatch a task to its backend.
    ///
    /// Returns `Ok(false)` if the task is already running, or if it was paused
    /// or cancelled before its backend took it over.
    pub async fn start_download(&self, id: &str) -> Result<bool, HubdlError> {
        let task = {
            let mut registry = self.shared.registry.lock();
            let Registry { tasks, monitor } = &mut *registry;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| HubdlError::NotFound(id.to_string()))?;
            if task.status.is_active() {
                return Ok(false);
            }
            task.transition(Transition::Start)?;
            if task.backend == Backend::IsolatedProcess {
                // The worker re-reports what is already on disk
                task.downloaded_bytes = 0;
                task.downloaded_files = 0;
                task.current_file = None;
                task.recompute_progress();
            }
            monitor.reset(task, Instant::now());
            self.shared.persistence.upsert(task);
            task.clone()
        };
        self.shared.notify(&task);
        info!("Starting task {} on {}", task.id, task.backend.as_str());

        let dispatched = match task.backend {
            Backend::IsolatedProcess => self.spawn_worker(&task).await,
            Backend::Accelerator => {
                let shared = self.shared.clone();
                let task_id = task.id.clone();
                let status_of = move || shared.registry.lock().tasks.get(&task_id).map(|t| t.status);
                let dispatched = self.bridge.dispatch(&task, self.progress_sink(&task.id), status_of).await;
                self.record_job_group(&task.id);
                dispatched
            }
        };

        match dispatched {
            Ok(running) => {
                if !running {
                    debug!("Task {} stopped before its backend took it", task.id);
                }
                Ok(running)
            }
            Err(e) => {
                error!("Failed to start task {}: {}", task.id, e);
                self.fail_task(&task.id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Same as [`start_download`](Self::start_download); the accelerator
    /// backend unpauses an existing job group before dispatching anew
    pub async fn resume_download(&self, id: &str) -> Result<bool, HubdlError> {
        self.start_download(id).await
    }

    /// Pause a downloading task. Returns `Ok(false)` if it was not downloading.
    pub async fn pause_download(&self, id: &str) -> Result<bool, HubdlError> {
        let Some(task) = self.stop_transition(id, Transition::Pause)? else {
            return Ok(false);
        };
        self.stop_execution(&task, false).await;
        Ok(true)
    }

    /// Cancel a task. When this returns, no worker process of the task is alive.
    pub async fn cancel_download(&self, id: &str) -> Result<bool, HubdlError> {
        let Some(task) = self.stop_transition(id, Transition::Cancel)? else {
            return Ok(false);
        };
        self.stop_execution(&task, true).await;
        Ok(true)
    }

    /// Remove a task, stopping it first; optionally delete its files
    pub async fn remove_task(&self, id: &str, delete_files: bool) -> Result<bool, HubdlError> {
        let Some(task) = self.get_task(id) else {
            return Ok(false);
        };
        self.stop_execution(&task, true).await;

        {
            let mut registry = self.shared.registry.lock();
            registry.tasks.remove(id);
            registry.monitor.forget(id);
            self.shared.persistence.delete(id);
        }
        let _ = self.shared.event_tx.send(TaskEvent::Removed { id: id.to_string() });
        info!("Removed task {}", id);

        if delete_files {
            match &task.resolved_target_dir {
                Some(dir) => remove_files(dir, &task.include_patterns).await?,
                None => warn!("Task {} used the shared cache; files were kept", id),
            }
        }
        Ok(true)
    }

    /// Remove all completed, failed, and cancelled tasks
    pub fn clear_completed(&self) -> usize {
        let removed: Vec<String> = {
            let mut registry = self.shared.registry.lock();
            let Registry { tasks, monitor } = &mut *registry;
            let ids: Vec<String> = tasks
                .values()
                .filter(|t| t.status.is_finished())
                .map(|t| t.id.clone())
                .collect();
            for id in &ids {
                tasks.remove(id);
                monitor.forget(id);
                self.shared.persistence.delete(id);
            }
            ids
        };

        for id in &removed {
            let _ = self.shared.event_tx.send(TaskEvent::Removed { id: id.clone() });
        }
        if !removed.is_empty() {
            info!("Cleared {} finished tasks", removed.len());
        }
        removed.len()
    }

    /// Check a task's files against the published hashes without changing the task
    pub async fn verify_task(&self, id: &str) -> Result<VerificationResult, HubdlError> {
        let task = self
            .get_task(id)
            .ok_or_else(|| HubdlError::NotFound(id.to_string()))?;
        let workers = self.settings.read().verify_workers as usize;
        let verifier = Verifier::new(
            self.collaborators.metadata.clone(),
            self.collaborators.cache.clone(),
            workers,
        );
        let local_dir = task.resolved_target_dir.as_deref().or(task.result_path.as_deref());
        verifier
            .verify(&task.repo, &task.include_patterns, &task.exclude_patterns, local_dir)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_task(&self, id: &str) -> Option<DownloadTask> {
        self.shared.registry.lock().tasks.get(id).cloned()
    }

    /// Snapshot of all tasks, oldest first
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.shared.registry.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Process id of a task's running worker
    pub fn worker_pid(&self, id: &str) -> Option<u32> {
        match self.shared.workers.lock().get(id) {
            Some(WorkerSlot::Running(handle)) => handle.pid(),
            _ => None,
        }
    }

    /// Job ids the accelerator holds for a task
    pub fn accelerator_jobs(&self, id: &str) -> Option<Vec<String>> {
        self.bridge.job_group(id)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Persist new settings and push accelerator tunables to a running daemon
    pub async fn update_settings(&self, settings: EngineSettings) -> Result<(), HubdlError> {
        self.storage.save_settings(&settings).await?;
        let accelerator_changed = {
            let mut current = self.settings.write();
            let changed = current.accelerator != settings.accelerator;
            *current = settings.clone();
            changed
        };
        if accelerator_changed {
            self.bridge.update_options(&settings.accelerator).await;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait until all task changes so far are on disk
    pub async fn flush(&self) {
        self.shared.persistence.flush().await;
    }

    /// Stop workers, monitor loops, and a daemon we started; flush the
    /// registry and release the data directory
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let slots: Vec<WorkerSlot> = self.shared.workers.lock().drain().map(|(_, slot)| slot).collect();
        futures::future::join_all(slots.into_iter().map(stop_slot)).await;
        self.bridge.shutdown().await;
        self.shutdown.cancel();
        self.flush().await;
        self.dir_lock.lock().take();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn launcher(&self) -> Result<WorkerLauncher, HubdlError> {
        let settings = self.settings.read();
        let grace = Duration::from_secs(settings.cancel_grace_secs);
        match &settings.worker_program {
            Some(program) => Ok(WorkerLauncher::new(program.clone(), settings.worker_args.clone(), grace)),
            None => WorkerLauncher::current_exe(settings.worker_args.clone(), grace),
        }
    }

    fn worker_params(&self, task: &DownloadTask) -> WorkerParams {
        let settings = self.settings.read();
        WorkerParams {
            task_id: task.id.clone(),
            repo: task.repo.clone(),
            include_patterns: task.include_patterns.clone(),
            exclude_patterns: task.exclude_patterns.clone(),
            local_dir: task.resolved_target_dir.clone(),
            accelerated: task.accelerated,
            endpoint: settings.endpoint.clone(),
            proxy_url: settings.proxy_url.clone(),
            token: self.collaborators.credentials.token(),
            cache_dir: None,
            transfer_workers: settings.transfer_workers as usize,
            verify_workers: settings.verify_workers as usize,
        }
    }

    fn is_active(&self, id: &str) -> bool {
        self.shared
            .registry
            .lock()
            .tasks
            .get(id)
            .is_some_and(|t| t.status.is_active())
    }

    /// Start the task's worker process. Returns false if the task stopped
    /// before the worker could be handed over.
    async fn spawn_worker(&self, task: &DownloadTask) -> Result<bool, HubdlError> {
        let launcher = self.launcher()?;
        let params = self.worker_params(task);

        // Pause and cancel wait on this slot until the spawn settled
        let attempt = self.shared.spawn_attempts.fetch_add(1, Ordering::Relaxed);
        let (started_tx, started) = oneshot::channel();
        {
            let mut workers = self.shared.workers.lock();
            if !self.is_active(&task.id) {
                return Ok(false);
            }
            workers.insert(task.id.clone(), WorkerSlot::Starting { attempt, started });
        }
        let _started = started_tx;

        let ours = |slot: Option<&WorkerSlot>| matches!(slot, Some(WorkerSlot::Starting { attempt: a, .. }) if *a == attempt);

        let handle = match launcher.spawn(&params, self.progress_tx.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                let mut workers = self.shared.workers.lock();
                if ours(workers.get(&task.id)) {
                    workers.remove(&task.id);
                }
                return Err(e);
            }
        };

        // The task may have been paused or cancelled, or may have finished,
        // while the process was starting. A stopper that already took the
        // slot waits for `_started`; otherwise the slot stays for the stopper
        // still to come and resolves when this returns.
        let orphan = {
            let mut workers = self.shared.workers.lock();
            if ours(workers.get(&task.id)) && self.is_active(&task.id) {
                workers.insert(task.id.clone(), WorkerSlot::Running(handle));
                None
            } else {
                Some(handle)
            }
        };
        match orphan {
            None => Ok(true),
            Some(handle) => {
                debug!("Task {} stopped while its worker started", task.id);
                handle.terminate().await;
                Ok(false)
            }
        }
    }

    /// Mirror the bridge's job group into the stored task
    fn record_job_group(&self, id: &str) {
        let jobs = self.bridge.job_group(id).unwrap_or_default();
        let mut registry = self.shared.registry.lock();
        let Some(task) = registry.tasks.get_mut(id) else {
            return;
        };
        let jobs = if task.status.is_finished() { Vec::new() } else { jobs };
        if task.accelerator_jobs != jobs {
            task.accelerator_jobs = jobs;
            self.shared.persistence.upsert(task);
        }
    }

    /// Apply a pause/cancel transition; `None` if the table rejects it
    fn stop_transition(&self, id: &str, transition: Transition) -> Result<Option<DownloadTask>, HubdlError> {
        let task = {
            let mut registry = self.shared.registry.lock();
            let Registry { tasks, monitor } = &mut *registry;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| HubdlError::NotFound(id.to_string()))?;
            if let Err(e) = task.transition(transition) {
                debug!("Task {}: {}", id, e);
                return Ok(None);
            }
            monitor.forget(id);
            self.shared.persistence.upsert(task);
            task.clone()
        };
        info!("Task {} is now {}", id, task.status);
        self.shared.notify(&task);
        Ok(Some(task))
    }

    /// Stop whatever executes a task
    async fn stop_execution(&self, task: &DownloadTask, cancel: bool) {
        let slot = self.shared.workers.lock().remove(&task.id);
        if let Some(slot) = slot {
            stop_slot(slot).await;
        }
        if task.backend == Backend::Accelerator {
            if cancel {
                self.bridge.cancel(&task.id);
            } else {
                self.bridge.pause(&task.id).await;
            }
            self.record_job_group(&task.id);
        }
    }

    fn fail_task(&self, id: &str, message: &str) {
        let snapshot = {
            let mut registry = self.shared.registry.lock();
            let Some(task) = registry.tasks.get_mut(id) else {
                return;
            };
            if task.transition(Transition::Fail).is_err() {
                return;
            }
            task.error_message = Some(message.to_string());
            self.shared.persistence.upsert(task);
            task.clone()
        };
        self.shared.notify(&snapshot);
    }
}

/// Terminate a running worker, or wait until a starting one was dealt with
async fn stop_slot(slot: WorkerSlot) {
    match slot {
        WorkerSlot::Running(handle) => handle.terminate().await,
        // The spawner sees its slot gone and terminates the process itself
        WorkerSlot::Starting { started, .. } => {
            let _ = started.await;
        }
    }
}
