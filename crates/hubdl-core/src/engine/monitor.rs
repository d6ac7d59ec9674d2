//! Progress monitor - applies progress events to tasks
//!
//! The monitor is plain state: the core drains the progress channel and calls
//! [`ProgressMonitor::apply`] under the registry lock, and calls
//! [`ProgressMonitor::sweep`] on a timer. Time is passed in explicitly.

use hubdl_types::{Backend, DownloadTask, ProgressKind, TaskStatus, Transition};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum spacing between speed recomputations
pub const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Silence after which a downloading task counts as stalled
pub const STALL_AFTER: Duration = Duration::from_secs(3);

/// Rolling byte counter for one task
#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    last_bytes: u64,
    last_at: Instant,
    seen_bytes: u64,
    /// When the byte count last moved
    advanced_at: Instant,
}

impl SpeedSample {
    fn new(bytes: u64, now: Instant) -> Self {
        Self {
            last_bytes: bytes,
            last_at: now,
            seen_bytes: bytes,
            advanced_at: now,
        }
    }
}

/// Counts re-reported by a restarted transfer attempt.
///
/// The task's counters only move once the recount passes them.
#[derive(Debug, Clone, Copy, Default)]
struct Recount {
    bytes: u64,
    files: u64,
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Dropped without touching the task
    Ignored,
    Updated,
    /// The task reached a terminal state; its producer can be released
    Finished,
}

impl Applied {
    pub fn changed(self) -> bool {
        !matches!(self, Applied::Ignored)
    }
}

#[derive(Debug, Default)]
pub struct ProgressMonitor {
    samples: HashMap<String, SpeedSample>,
    recounts: HashMap<String, Recount>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh speed sample, e.g. when a task is (re)started
    pub fn reset(&mut self, task: &DownloadTask, now: Instant) {
        self.samples
            .insert(task.id.clone(), SpeedSample::new(task.downloaded_bytes, now));
        self.recounts.remove(&task.id);
    }

    pub fn forget(&mut self, task_id: &str) {
        self.samples.remove(task_id);
        self.recounts.remove(task_id);
    }

    /// Apply one event to its task
    pub fn apply(&mut self, task: &mut DownloadTask, event: &ProgressKind, now: Instant) -> Applied {
        if let ProgressKind::Meta {
            total_bytes,
            total_files,
        } = event
        {
            task.total_bytes = *total_bytes;
            task.total_files = *total_files;
            task.recompute_progress();
            return Applied::Updated;
        }

        if !task.status.is_active() {
            debug!("Dropping {:?} for {} task {}", event, task.status, task.id);
            return Applied::Ignored;
        }

        let applied = match event {
            ProgressKind::Meta { .. } => Applied::Ignored,
            ProgressKind::FileStart { filename } => {
                task.current_file = Some(filename.clone());
                Applied::Updated
            }
            // Per-file sizes are informational; totals come from `meta`
            ProgressKind::TotalUpdate { .. } => Applied::Ignored,
            ProgressKind::Progress { inc, is_byte_unit } => {
                match self.recounts.get_mut(&task.id) {
                    Some(recount) if *is_byte_unit => {
                        recount.bytes = recount.bytes.saturating_add(*inc);
                        task.downloaded_bytes = task.downloaded_bytes.max(recount.bytes);
                    }
                    Some(recount) => {
                        recount.files = recount.files.saturating_add(*inc);
                        task.downloaded_files = task.downloaded_files.max(recount.files);
                    }
                    None if *is_byte_unit => {
                        task.downloaded_bytes = task.downloaded_bytes.saturating_add(*inc);
                    }
                    None => {
                        task.downloaded_files = task.downloaded_files.saturating_add(*inc);
                    }
                }
                task.recompute_progress();
                Applied::Updated
            }
            ProgressKind::TransferRestart { accelerated } => {
                debug!("Task {} restarts its transfer (accelerated: {})", task.id, accelerated);
                self.recounts.insert(task.id.clone(), Recount::default());
                Applied::Ignored
            }
            ProgressKind::MonitorUpdate { downloaded_bytes } => {
                if *downloaded_bytes > task.downloaded_bytes {
                    task.downloaded_bytes = *downloaded_bytes;
                    task.recompute_progress();
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            ProgressKind::AcceleratorUpdate {
                downloaded_bytes,
                downloaded_files,
                speed_bytes_per_sec,
            } => {
                task.downloaded_bytes = task.downloaded_bytes.max(*downloaded_bytes);
                task.downloaded_files = task.downloaded_files.max(*downloaded_files);
                task.speed_bytes_per_sec = *speed_bytes_per_sec;
                if *speed_bytes_per_sec > 0 {
                    task.stalled = false;
                }
                task.recompute_progress();
                Applied::Updated
            }
            ProgressKind::StatusChange { status } => match status {
                TaskStatus::Verifying => transition(task, Transition::BeginVerify, Applied::Updated),
                _ => Applied::Ignored,
            },
            ProgressKind::DownloadDone { result_path } => {
                task.result_path = Some(result_path.clone());
                Applied::Updated
            }
            ProgressKind::Completed { result_path } => {
                let applied = transition(task, Transition::Complete, Applied::Finished);
                if applied == Applied::Finished {
                    if let Some(path) = result_path {
                        task.result_path = Some(path.clone());
                    }
                    task.downloaded_bytes = task.downloaded_bytes.max(task.total_bytes);
                    task.downloaded_files = task.downloaded_files.max(task.total_files);
                }
                applied
            }
            ProgressKind::Error { message } | ProgressKind::VerificationFailed { message } => {
                let applied = transition(task, Transition::Fail, Applied::Finished);
                if applied == Applied::Finished {
                    task.error_message = Some(if message.trim().is_empty() {
                        "Download failed".to_string()
                    } else {
                        message.clone()
                    });
                }
                applied
            }
        };

        if applied.changed() {
            self.sample(task, now);
        }
        applied
    }

    /// Recompute speed on a 2s cadence and track when bytes last moved
    fn sample(&mut self, task: &mut DownloadTask, now: Instant) {
        let sample = self
            .samples
            .entry(task.id.clone())
            .or_insert_with(|| SpeedSample::new(task.downloaded_bytes, now));

        if task.downloaded_bytes > sample.seen_bytes {
            sample.seen_bytes = task.downloaded_bytes;
            sample.advanced_at = now;
        }

        if !task.status.is_active() {
            self.samples.remove(&task.id);
            self.recounts.remove(&task.id);
            return;
        }

        let elapsed = now.saturating_duration_since(sample.last_at);
        if elapsed >= SPEED_WINDOW {
            let delta = task.downloaded_bytes.saturating_sub(sample.last_bytes);
            // The accelerator reports its own speed
            if task.backend == Backend::IsolatedProcess {
                task.speed_bytes_per_sec = (delta as f64 / elapsed.as_secs_f64()) as u64;
            }
            if delta > 0 {
                task.stalled = false;
            }
            sample.last_bytes = task.downloaded_bytes;
            sample.last_at = now;
        }
    }

    /// Zero the speed of downloading tasks that have been silent too long.
    ///
    /// Returns the ids of tasks that changed. Status is left alone.
    pub fn sweep<'a>(
        &mut self,
        tasks: impl Iterator<Item = &'a mut DownloadTask>,
        now: Instant,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for task in tasks {
            if task.status != TaskStatus::Downloading {
                continue;
            }
            let sample = self
                .samples
                .entry(task.id.clone())
                .or_insert_with(|| SpeedSample::new(task.downloaded_bytes, now));
            let silent = now.saturating_duration_since(sample.advanced_at) > STALL_AFTER;
            if silent && (task.speed_bytes_per_sec != 0 || !task.stalled) {
                debug!("Task {} stalled", task.id);
                task.speed_bytes_per_sec = 0;
                task.stalled = true;
                changed.push(task.id.clone());
            }
        }
        changed
    }
}

fn transition(task: &mut DownloadTask, t: Transition, applied: Applied) -> Applied {
    match task.transition(t) {
        Ok(_) => applied,
        Err(e) => {
            debug!("Ignoring event for task {}: {}", task.id, e);
            Applied::Ignored
        }
    }
}
