//! Shared types for hubdl
//!
//! This crate contains the data structures shared by the download engine,
//! the isolated worker process, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Repository Types
// ============================================================================

/// Kind of remote repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoKind::Model => "model",
            RepoKind::Dataset => "dataset",
            RepoKind::Space => "space",
        }
    }

    /// Plural form used in folder names and API routes ("models", ...)
    pub fn plural(self) -> &'static str {
        match self {
            RepoKind::Model => "models",
            RepoKind::Dataset => "datasets",
            RepoKind::Space => "spaces",
        }
    }

    /// Path prefix used in file resolve URLs. Models have none.
    pub fn url_prefix(self) -> &'static str {
        match self {
            RepoKind::Model => "",
            RepoKind::Dataset => "datasets/",
            RepoKind::Space => "spaces/",
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model" | "models" => Ok(RepoKind::Model),
            "dataset" | "datasets" => Ok(RepoKind::Dataset),
            "space" | "spaces" => Ok(RepoKind::Space),
            other => Err(ParseEnumError::new("repo kind", other)),
        }
    }
}

/// Reference to a remote repository at a given revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Repository identifier, e.g. `org/model`
    pub id: String,
    pub kind: RepoKind,
    /// Branch, tag, or commit hash
    pub revision: String,
}

impl RepoRef {
    pub fn new(id: impl Into<String>, kind: RepoKind, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            revision: revision.into(),
        }
    }

    /// A model repository on the `main` branch
    pub fn model(id: impl Into<String>) -> Self {
        Self::new(id, RepoKind::Model, "main")
    }

    /// Folder name for this repository, e.g. `models--org--model`
    pub fn folder_name(&self) -> String {
        format!("{}--{}", self.kind.plural(), self.id.replace('/', "--"))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.id, self.revision)
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Verifying,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Requested change of a task's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    BeginVerify,
    Complete,
    Fail,
    Pause,
    Cancel,
}

impl TaskStatus {
    /// The transition table. Returns `None` for transitions that are not allowed.
    pub fn apply(self, transition: Transition) -> Option<TaskStatus> {
        use TaskStatus::*;
        use Transition::*;

        match (self, transition) {
            (Pending | Paused | Failed | Cancelled, Start) => Some(Downloading),
            (Downloading, BeginVerify) => Some(Verifying),
            (Downloading | Verifying, Complete) => Some(Completed),
            (Downloading | Verifying, Fail) => Some(Failed),
            (Downloading, Pause) => Some(Paused),
            (Pending | Downloading | Verifying | Paused, Cancel) => Some(Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a transfer or verification is in flight
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Verifying)
    }

    /// Completed and cancelled tasks never move again.
    /// Failed tasks only move when explicitly restarted.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Statuses removed by a bulk clear
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_start(self) -> bool {
        self.apply(Transition::Start).is_some()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "verifying" => Ok(TaskStatus::Verifying),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// A transition the table rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub transition: Transition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot apply {:?} to a {} task", self.transition, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Execution path that handles a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// One isolated worker process per task
    #[default]
    IsolatedProcess,
    /// Jobs submitted to the shared accelerator daemon
    Accelerator,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::IsolatedProcess => "isolated_process",
            Backend::Accelerator => "accelerator",
        }
    }
}

impl FromStr for Backend {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated_process" | "process" | "python" => Ok(Backend::IsolatedProcess),
            "accelerator" | "aria2" => Ok(Backend::Accelerator),
            other => Err(ParseEnumError::new("backend", other)),
        }
    }
}

/// What to do when the resolved target directory is already occupied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    #[default]
    Check,
    Overwrite,
    Rename,
}

impl FromStr for DuplicateAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "check" => Ok(DuplicateAction::Check),
            "overwrite" => Ok(DuplicateAction::Overwrite),
            "rename" => Ok(DuplicateAction::Rename),
            other => Err(ParseEnumError::new("duplicate action", other)),
        }
    }
}

/// Named include/exclude pattern sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternPreset {
    SafetensorsOnly,
    GgufOnly,
    NoPytorch,
    ConfigOnly,
}

impl PatternPreset {
    pub fn include(self) -> &'static [&'static str] {
        match self {
            PatternPreset::SafetensorsOnly => {
                &["*.safetensors", "config.json", "*.json", "tokenizer*"]
            }
            PatternPreset::GgufOnly => &["*.gguf", "README.md"],
            PatternPreset::NoPytorch => &[],
            PatternPreset::ConfigOnly => &["*.json", "*.yaml", "*.yml", "*.txt", "README.md"],
        }
    }

    pub fn exclude(self) -> &'static [&'static str] {
        match self {
            PatternPreset::SafetensorsOnly => &["*.bin", "*.pt", "*.pth", "*.ckpt"],
            PatternPreset::NoPytorch => &["*.bin", "*.pt", "*.pth", "pytorch_model*"],
            PatternPreset::GgufOnly | PatternPreset::ConfigOnly => &[],
        }
    }
}

impl FromStr for PatternPreset {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "safetensors_only" => Ok(PatternPreset::SafetensorsOnly),
            "gguf_only" => Ok(PatternPreset::GgufOnly),
            "no_pytorch" => Ok(PatternPreset::NoPytorch),
            "config_only" => Ok(PatternPreset::ConfigOnly),
            other => Err(ParseEnumError::new("pattern preset", other)),
        }
    }
}

/// A request to fetch a filtered subset of a remote repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub repo: RepoRef,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Base directory as requested (None = default cache)
    pub target_dir: Option<PathBuf>,
    /// Final directory the files land in, e.g. `<base>/models--org--model`
    pub resolved_target_dir: Option<PathBuf>,
    pub status: TaskStatus,
    /// 0.0 to 100.0
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub downloaded_files: u64,
    pub total_files: u64,
    pub speed_bytes_per_sec: u64,
    /// Set when no progress arrived for a while
    #[serde(default)]
    pub stalled: bool,
    pub current_file: Option<String>,
    pub error_message: Option<String>,
    pub result_path: Option<PathBuf>,
    pub backend: Backend,
    /// Whether the accelerated transfer mode was requested for the worker
    #[serde(default)]
    pub accelerated: bool,
    /// Job ids the accelerator daemon holds for this task, kept so a paused
    /// group can be resumed by a later process
    #[serde(default)]
    pub accelerator_jobs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(id: String, repo: RepoRef, backend: Backend) -> Self {
        Self {
            id,
            repo,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            target_dir: None,
            resolved_target_dir: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            downloaded_files: 0,
            total_files: 0,
            speed_bytes_per_sec: 0,
            stalled: false,
            current_file: None,
            error_message: None,
            result_path: None,
            backend,
            accelerated: false,
            accelerator_jobs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Apply a transition from the table, updating derived fields
    pub fn transition(&mut self, transition: Transition) -> Result<TaskStatus, InvalidTransition> {
        let next = self.status.apply(transition).ok_or(InvalidTransition {
            from: self.status,
            transition,
        })?;

        self.status = next;
        match transition {
            Transition::Start => {
                self.error_message = None;
                self.stalled = false;
            }
            Transition::Complete => {
                self.current_file = None;
            }
            _ => {}
        }
        if !next.is_active() {
            self.speed_bytes_per_sec = 0;
        }
        self.recompute_progress();
        Ok(next)
    }

    /// Recompute `progress` from byte counts.
    ///
    /// Only a completed task reports 100; anything else is capped just below.
    pub fn recompute_progress(&mut self) {
        self.progress = if self.status == TaskStatus::Completed {
            100.0
        } else if self.total_bytes > 0 {
            (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(99.9)
        } else {
            0.0
        };
    }
}

// ============================================================================
// Progress Channel Types
// ============================================================================

/// One message on the progress channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(task_id: impl Into<String>, kind: ProgressKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
        }
    }
}

/// Payload of a progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    /// Aggregate size of the filtered file set
    Meta { total_bytes: u64, total_files: u64 },
    FileStart { filename: String },
    /// Size of a single file
    TotalUpdate { total: u64 },
    /// Increment in bytes, or in files when `is_byte_unit` is false
    Progress { inc: u64, is_byte_unit: bool },
    /// Absolute on-disk byte count from the directory sampler
    MonitorUpdate { downloaded_bytes: u64 },
    /// A new transfer attempt begins and re-reports what is already on disk
    TransferRestart { accelerated: bool },
    /// Aggregated job state reported by the accelerator bridge
    AcceleratorUpdate {
        downloaded_bytes: u64,
        downloaded_files: u64,
        speed_bytes_per_sec: u64,
    },
    StatusChange { status: TaskStatus },
    DownloadDone { result_path: PathBuf },
    Completed { result_path: Option<PathBuf> },
    Error { message: String },
    VerificationFailed { message: String },
}

impl ProgressKind {
    /// Events after which the producer goes away
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressKind::Completed { .. }
                | ProgressKind::Error { .. }
                | ProgressKind::VerificationFailed { .. }
        )
    }
}

// ============================================================================
// Verification Types
// ============================================================================

/// Outcome of comparing local files with remote content hashes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid_files: Vec<String>,
    pub corrupted_files: Vec<String>,
    pub missing_files: Vec<String>,
    pub total_files: usize,
    pub is_valid: bool,
}

impl VerificationResult {
    pub fn new(
        valid_files: Vec<String>,
        corrupted_files: Vec<String>,
        missing_files: Vec<String>,
    ) -> Self {
        let total_files = valid_files.len() + corrupted_files.len() + missing_files.len();
        let is_valid = corrupted_files.is_empty() && missing_files.is_empty();
        Self {
            valid_files,
            corrupted_files,
            missing_files,
            total_files,
            is_valid,
        }
    }

    /// Failure message listing corrupted and missing counts
    pub fn failure_message(&self) -> String {
        let mut parts = Vec::new();
        if !self.corrupted_files.is_empty() {
            parts.push(format!("{} files corrupted", self.corrupted_files.len()));
        }
        if !self.missing_files.is_empty() {
            parts.push(format!("{} files missing", self.missing_files.len()));
        }
        format!("Verification failed: {}", parts.join(", "))
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the core to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TaskEvent {
    Updated { task: DownloadTask },
    Removed { id: String },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Base directory for downloads (None = default cache)
    pub download_dir: Option<PathBuf>,
    pub backend: Backend,
    /// Ask workers for the accelerated transfer mode
    pub accelerated_transfer: bool,
    /// Scheduling hint; not enforced by the engine
    pub max_concurrent_downloads: u32,
    /// Parallel file transfers per worker
    pub transfer_workers: u32,
    /// Parallel hash computations during verification
    pub verify_workers: u32,
    /// Restart interrupted tasks on startup instead of pausing them
    pub auto_resume_incomplete: bool,
    /// Hub endpoint used for metadata and file URLs
    pub endpoint: String,
    pub proxy_url: Option<String>,
    /// Program run as the worker process (None = the current executable)
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
    /// Seconds a worker gets to exit before it is killed
    pub cancel_grace_secs: u64,
    pub accelerator: AcceleratorSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            download_dir: None,
            backend: Backend::IsolatedProcess,
            accelerated_transfer: false,
            max_concurrent_downloads: 3,
            transfer_workers: 8,
            verify_workers: 4,
            auto_resume_incomplete: false,
            endpoint: OFFICIAL_ENDPOINT.to_string(),
            proxy_url: None,
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            cancel_grace_secs: 2,
            accelerator: AcceleratorSettings::default(),
        }
    }
}

/// The official hub endpoint
pub const OFFICIAL_ENDPOINT: &str = "https://huggingface.co";

/// Accelerator daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorSettings {
    /// Daemon executable (None = `aria2c` on PATH)
    pub binary: Option<PathBuf>,
    pub port: u16,
    pub secret: String,
    pub max_connection_per_server: u32,
    pub split: u32,
    pub min_split_size: String,
    pub check_certificate: bool,
    /// Proxy for the daemon (falls back to the engine proxy)
    pub all_proxy: Option<String>,
    pub reuse_uri: bool,
    /// Health-check attempts after spawning, 100ms apart
    pub startup_attempts: u32,
    pub poll_interval_ms: u64,
    /// Calls per multicall envelope
    pub batch_size: usize,
    /// Kill leftover daemons from a previous run before starting
    pub kill_strays: bool,
}

impl Default for AcceleratorSettings {
    fn default() -> Self {
        Self {
            binary: None,
            port: 6810,
            secret: "hubdl_secret".to_string(),
            max_connection_per_server: 16,
            split: 16,
            min_split_size: "1M".to_string(),
            check_certificate: false,
            all_proxy: None,
            reuse_uri: true,
            startup_attempts: 20,
            poll_interval_ms: 1000,
            batch_size: 50,
            kill_strays: true,
        }
    }
}

/// Default data directory for the engine's database and settings
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("hubdl"))
        .unwrap_or_else(|| PathBuf::from(".hubdl"))
}

// ============================================================================
// Parse Errors
// ============================================================================

/// Error returned when parsing one of the string-backed enums
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_name_escapes_separator() {
        let repo = RepoRef::new("org/model", RepoKind::Model, "main");
        assert_eq!(repo.folder_name(), "models--org--model");

        let repo = RepoRef::new("org/set", RepoKind::Dataset, "main");
        assert_eq!(repo.folder_name(), "datasets--org--set");
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        use Transition::*;

        assert_eq!(Pending.apply(Start), Some(Downloading));
        assert_eq!(Failed.apply(Start), Some(Downloading));
        assert_eq!(Downloading.apply(BeginVerify), Some(Verifying));
        assert_eq!(Verifying.apply(Complete), Some(Completed));
        assert_eq!(Downloading.apply(Pause), Some(Paused));
        assert_eq!(Paused.apply(Cancel), Some(Cancelled));

        assert_eq!(Downloading.apply(Start), None);
        assert_eq!(Completed.apply(Start), None);
        assert_eq!(Verifying.apply(Pause), None);
        assert_eq!(Cancelled.apply(Fail), None);
        assert_eq!(Completed.apply(Cancel), None);
        assert_eq!(Pending.apply(Complete), None);
    }

    #[test]
    fn test_progress_is_100_only_when_completed() {
        let mut task = DownloadTask::new("t".into(), RepoRef::model("org/model"), Backend::default());
        task.transition(Transition::Start).unwrap();
        task.total_bytes = 1000;
        task.downloaded_bytes = 1000;
        task.recompute_progress();
        assert!(task.progress < 100.0);

        task.transition(Transition::Complete).unwrap();
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn test_rejected_transition_leaves_task_untouched() {
        let mut task = DownloadTask::new("t".into(), RepoRef::model("org/model"), Backend::default());
        let err = task.transition(Transition::Pause).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_progress_event_wire_shape() {
        let event = ProgressEvent::new(
            "abc",
            ProgressKind::Progress {
                inc: 400,
                is_byte_unit: true,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["task_id"], "abc");
        assert_eq!(json["inc"], 400);

        let parsed: ProgressEvent =
            serde_json::from_str(r#"{"type":"meta","task_id":"x","total_bytes":5,"total_files":1}"#)
                .unwrap();
        assert_eq!(
            parsed.kind,
            ProgressKind::Meta {
                total_bytes: 5,
                total_files: 1
            }
        );
    }

    #[test]
    fn test_verification_failure_message() {
        let result = VerificationResult::new(
            vec!["a".into()],
            vec!["b".into(), "c".into()],
            vec!["d".into()],
        );
        assert!(!result.is_valid);
        assert_eq!(result.total_files, 4);
        assert_eq!(
            result.failure_message(),
            "Verification failed: 2 files corrupted, 1 files missing"
        );
    }

    #[test]
    fn test_settings_fill_missing_keys_with_defaults() {
        let settings: EngineSettings = serde_json::from_str(r#"{"transfer_workers": 2}"#).unwrap();
        assert_eq!(settings.transfer_workers, 2);
        assert_eq!(settings.cancel_grace_secs, 2);
        assert_eq!(settings.accelerator.port, 6810);
    }
}
