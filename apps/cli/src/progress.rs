//! Progress bar utilities for CLI downloads

use console::style;
use hubdl_types::{DownloadTask, TaskEvent, TaskStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

/// Manages progress bars for the watched tasks
pub struct TaskProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

impl TaskProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a task
    pub fn add_task(&mut self, task: &DownloadTask) {
        let pb = self.multi.add(ProgressBar::new(task.total_bytes));
        pb.set_style(bar_style());
        pb.set_position(task.downloaded_bytes);
        pb.set_message(style(&task.repo.id).bold().to_string());
        self.bars.insert(task.id.clone(), pb);
    }

    /// Update a progress bar from an event
    pub fn handle_event(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Updated { task } => {
                let Some(pb) = self.bars.get(&task.id) else {
                    return;
                };
                if task.total_bytes > 0 {
                    pb.set_length(task.total_bytes);
                }
                pb.set_position(task.downloaded_bytes);

                match task.status {
                    TaskStatus::Downloading => {
                        let mut message = style(&task.repo.id).bold().to_string();
                        if task.stalled {
                            message.push_str(&format!(" {}", style("stalled").yellow()));
                        } else if task.speed_bytes_per_sec > 0 {
                            message.push_str(&format!(" {}", crate::output::format_speed(task.speed_bytes_per_sec)));
                        }
                        if let Some(file) = &task.current_file {
                            message.push_str(&format!(" {}", style(file).dim()));
                        }
                        pb.set_message(message);
                    }
                    TaskStatus::Verifying => {
                        pb.set_message(format!("{} Verifying", style("…").cyan()));
                    }
                    TaskStatus::Completed => {
                        pb.finish_with_message(format!(
                            "{} {} complete",
                            style("✓").green().bold(),
                            task.repo.id
                        ));
                    }
                    TaskStatus::Failed => {
                        pb.abandon_with_message(format!(
                            "{} Failed: {}",
                            style("✗").red().bold(),
                            task.error_message.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                    TaskStatus::Paused => {
                        pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
                    }
                    TaskStatus::Cancelled => {
                        pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                    }
                    TaskStatus::Pending => {}
                }
            }
            TaskEvent::Removed { id } => {
                if let Some(pb) = self.bars.remove(id) {
                    pb.finish_and_clear();
                }
            }
        }
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self::new()
    }
}
