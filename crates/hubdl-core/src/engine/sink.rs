//! Progress sinks: where transfer backends, workers, and the accelerator
//! bridge send their events

use hubdl_types::{ProgressEvent, ProgressKind};
use parking_lot::Mutex;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::warn;

/// Receives the progress events of one task
pub trait ProgressSink: Send + Sync {
    fn emit(&self, kind: ProgressKind);
}

/// Forwards events into the in-process progress channel
#[derive(Clone)]
pub struct ChannelSink {
    task_id: String,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(task_id: impl Into<String>, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            task_id: task_id.into(),
            tx,
        }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, kind: ProgressKind) {
        // The receiver only goes away during shutdown
        let _ = self.tx.send(ProgressEvent::new(self.task_id.clone(), kind));
    }
}

/// Writes events as newline-delimited JSON to stdout (worker process side)
pub struct StdoutSink {
    task_id: String,
    out: Mutex<std::io::Stdout>,
}

impl StdoutSink {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            out: Mutex::new(std::io::stdout()),
        }
    }
}

impl ProgressSink for StdoutSink {
    fn emit(&self, kind: ProgressKind) {
        let event = ProgressEvent::new(self.task_id.clone(), kind);
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode progress event: {}", e);
                return;
            }
        };
        let mut out = self.out.lock();
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            // Parent closed the pipe; nothing left to report to
            warn!("Progress channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_tags_task_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new("task-1", tx);
        sink.emit(ProgressKind::FileStart {
            filename: "config.json".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, "task-1");
        assert!(matches!(event.kind, ProgressKind::FileStart { .. }));
    }
}
