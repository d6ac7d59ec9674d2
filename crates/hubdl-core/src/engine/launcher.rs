//! Worker process launcher
//!
//! Spawns one OS process per active task, hands it its parameters over
//! stdin, and turns its stdout into progress events. Closing stdin is the
//! graceful stop signal; a worker still alive after the grace period is killed.

use crate::engine::worker::WorkerParams;
use crate::error::HubdlError;
use hubdl_types::{ProgressEvent, ProgressKind};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message for a stream that ended without a terminal event
pub const CRASH_MESSAGE: &str = "Worker process exited unexpectedly";

/// How workers are started
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl WorkerLauncher {
    pub fn new(program: PathBuf, args: Vec<String>, grace: Duration) -> Self {
        Self {
            program,
            args,
            grace,
        }
    }

    /// Launcher running the current executable
    pub fn current_exe(args: Vec<String>, grace: Duration) -> Result<Self, HubdlError> {
        Ok(Self::new(std::env::current_exe()?, args, grace))
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start a worker for `params`, forwarding its events into `events`
    pub async fn spawn(
        &self,
        params: &WorkerParams,
        events: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<WorkerHandle, HubdlError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let task_id = params.task_id.clone();
        info!(
            "Spawned worker for task {} (pid {:?})",
            task_id,
            child.id()
        );

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubdlError::WorkerCrash("worker stdin unavailable".to_string()))?;
        let mut line = serde_json::to_string(params)?;
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            let _ = child.kill().await;
            return Err(HubdlError::WorkerCrash(format!(
                "failed to send parameters: {}",
                e
            )));
        }
        stdin.flush().await?;

        let reader = child.stdout.take().map(|stdout| {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut finished = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<ProgressEvent>(&line) {
                        Ok(mut event) => {
                            event.task_id = task_id.clone();
                            finished |= event.kind.is_terminal();
                            let _ = events.send(event);
                        }
                        Err(e) => debug!("Task {}: unparseable worker output ({}): {}", task_id, e, line),
                    }
                }
                if !finished {
                    let _ = events.send(ProgressEvent::new(
                        task_id,
                        ProgressKind::Error {
                            message: CRASH_MESSAGE.to_string(),
                        },
                    ));
                }
            })
        });

        if let Some(stderr) = child.stderr.take() {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, "worker: {}", line);
                }
            });
        }

        Ok(WorkerHandle {
            task_id,
            child,
            stdin: Some(stdin),
            reader,
            grace: self.grace,
        })
    }
}

/// A running worker process
pub struct WorkerHandle {
    task_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the worker: close stdin, wait out the grace period, then kill.
    ///
    /// Returns once the process has been reaped.
    pub async fn terminate(mut self) {
        drop(self.stdin.take());

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker for task {} exited with {}", self.task_id, status),
            Ok(Err(e)) => warn!("Failed to wait for worker of task {}: {}", self.task_id, e),
            Err(_) => {
                warn!(
                    "Worker for task {} did not exit within {:?}, killing it",
                    self.task_id, self.grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill worker of task {}: {}", self.task_id, e);
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            // Output may still be buffered in the pipe; drop it
            reader.abort();
        }
    }

    /// Wait for a worker that already reported a terminal event
    pub async fn reap(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = tokio::time::timeout(self.grace, reader).await;
        }
        self.terminate().await;
    }
}
