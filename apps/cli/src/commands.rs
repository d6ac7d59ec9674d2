//! CLI command implementations

use crate::output::{format_bytes, format_eta, format_speed, print_json, truncate};
use crate::progress::TaskProgress;
use crate::{ConfigAction, OutputFormat, RepoArgs};
use anyhow::{anyhow, bail, Result};
use console::style;
use hubdl_core::{HubdlCore, QueueRequest};
use hubdl_types::{DownloadTask, EngineSettings, RepoRef, TaskStatus};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Task Commands
// ============================================================================

pub async fn add_task(core: &HubdlCore, args: RepoArgs, start: bool, format: OutputFormat) -> Result<()> {
    let mut request = QueueRequest::new(RepoRef {
        id: args.repo,
        kind: args.kind,
        revision: args.revision,
    });
    request.include_patterns = args.include;
    request.exclude_patterns = args.exclude;
    request.preset = args.preset;
    request.target_dir = args.dir;
    request.on_duplicate = args.on_duplicate;
    request.backend = args.backend;
    if args.accelerated {
        request.accelerated = Some(true);
    }

    let id = core.queue_download(request).await?;
    let task = core
        .get_task(&id)
        .ok_or_else(|| anyhow!("Task {} vanished", id))?;

    match format {
        OutputFormat::Json if !start => print_json(&task)?,
        OutputFormat::Json => {}
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Queued {}",
                style("✓").green().bold(),
                style(&task.repo.id).cyan()
            );
            println!("  ID: {}", task.id);
            if let Some(dir) = &task.resolved_target_dir {
                println!("  Target: {}", dir.display());
            }
        }
    }

    if start {
        start_tasks(core, vec![id], format).await?;
    }
    Ok(())
}

pub async fn start_tasks(core: &HubdlCore, ids: Vec<String>, format: OutputFormat) -> Result<()> {
    // Subscribe first so no update is missed
    let events = core.events();

    let mut started = Vec::new();
    for id in ids {
        match core.start_download(&id).await {
            Ok(true) => started.push(id),
            Ok(false) => match core.get_task(&id).map(|t| t.status) {
                Some(status) if status.is_active() => {
                    println!("{} Task {} is already running", style("·").dim(), id);
                    started.push(id);
                }
                Some(status) => println!("{} Task {} was stopped before it started ({})", style("·").dim(), id, status),
                None => eprintln!("{} Task {} is gone", style("✗").red().bold(), id),
            },
            Err(e) => eprintln!("{} Could not start {}: {}", style("✗").red().bold(), id, e),
        }
    }
    if started.is_empty() {
        bail!("No task was started");
    }

    watch(core, &started, events, format).await
}

/// Follow tasks until none of them is running. Ctrl-C pauses them.
async fn watch(
    core: &HubdlCore,
    ids: &[String],
    mut events: tokio::sync::broadcast::Receiver<hubdl_types::TaskEvent>,
    format: OutputFormat,
) -> Result<()> {
    let show_bars = !matches!(format, OutputFormat::Json);
    let mut progress = TaskProgress::new();
    if show_bars {
        for task in ids.iter().filter_map(|id| core.get_task(id)) {
            progress.add_task(&task);
        }
    }

    let running = |core: &HubdlCore| {
        ids.iter()
            .filter_map(|id| core.get_task(id))
            .any(|t| t.status.is_active())
    };
    let mut recheck = tokio::time::interval(Duration::from_secs(1));

    while running(core) {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if show_bars {
                        progress.handle_event(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Skipped {} progress updates", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = recheck.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                for id in ids {
                    if let Err(e) = core.pause_download(id).await {
                        tracing::warn!("Failed to pause {}: {}", id, e);
                    }
                }
                // Drain the pause updates so the bars show them
                while let Ok(event) = events.try_recv() {
                    if show_bars {
                        progress.handle_event(&event);
                    }
                }
                eprintln!("{} Paused; resume with `hubdl resume`", style("⏸").yellow());
                break;
            }
        }
    }

    let tasks: Vec<DownloadTask> = ids.iter().filter_map(|id| core.get_task(id)).collect();
    if show_bars {
        // Bars only move on events; settle them on the final state
        for task in &tasks {
            progress.handle_event(&hubdl_types::TaskEvent::Updated { task: task.clone() });
        }
    } else {
        print_json(&tasks)?;
    }

    let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
    if failed > 0 {
        bail!("{} task(s) failed", failed);
    }
    Ok(())
}

pub async fn pause_task(core: &HubdlCore, id: &str, _format: OutputFormat) -> Result<()> {
    if core.pause_download(id).await? {
        println!("{} Task paused", style("✓").green().bold());
    } else {
        println!("{} Task is not downloading", style("·").dim());
    }
    Ok(())
}

pub async fn cancel_task(core: &HubdlCore, id: &str, _format: OutputFormat) -> Result<()> {
    if core.cancel_download(id).await? {
        println!("{} Task cancelled", style("✓").green().bold());
    } else {
        println!("{} Task cannot be cancelled", style("·").dim());
    }
    Ok(())
}

pub async fn remove_task(core: &HubdlCore, id: &str, with_files: bool, _format: OutputFormat) -> Result<()> {
    if !core.remove_task(id, with_files).await? {
        bail!("Task not found: {}", id);
    }
    println!("{} Task removed", style("✓").green().bold());
    Ok(())
}

pub fn clear_completed(core: &HubdlCore, format: OutputFormat) -> Result<()> {
    let removed = core.clear_completed();
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "removed": removed }))?,
        _ => println!("{} Removed {} task(s)", style("✓").green().bold(), removed),
    }
    Ok(())
}

pub async fn verify_task(core: &HubdlCore, id: &str, format: OutputFormat) -> Result<()> {
    let result = core.verify_task(id).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        _ => {
            if result.is_valid {
                println!(
                    "{} {} file(s) verified",
                    style("✓").green().bold(),
                    result.valid_files.len()
                );
            } else {
                println!("{} {}", style("✗").red().bold(), result.failure_message());
                for file in &result.corrupted_files {
                    println!("    corrupted: {}", style(file).red());
                }
                for file in &result.missing_files {
                    println!("    missing:   {}", style(file).yellow());
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Listing
// ============================================================================

pub fn list_tasks(
    tasks: Vec<DownloadTask>,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status: Option<TaskStatus> = status_filter.map(|s| s.parse()).transpose()?;
    let tasks: Vec<DownloadTask> = tasks
        .into_iter()
        .filter(|t| status.map_or(true, |s| t.status == s))
        .collect();

    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TaskRow {
                id: String,
                repo: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<TaskRow> = tasks
                .iter()
                .map(|t| TaskRow {
                    id: truncate(&t.id, 40),
                    repo: truncate(&t.repo.id, 30),
                    size: if t.total_bytes > 0 {
                        format_bytes(t.total_bytes)
                    } else {
                        "?".to_string()
                    },
                    progress: format!("{:.1}%", t.progress),
                    status: t.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if tasks.is_empty() {
                println!("{}", style("No tasks found").dim());
                return Ok(());
            }

            for task in &tasks {
                print_task_summary(task, show_all);
            }
            println!();
            println!("{} task(s) total", style(tasks.len()).bold());
        }
    }

    Ok(())
}

fn print_task_summary(task: &DownloadTask, detailed: bool) {
    let status_icon = match task.status {
        TaskStatus::Completed => style("✓").green(),
        TaskStatus::Downloading | TaskStatus::Verifying => style("↓").cyan(),
        TaskStatus::Paused => style("⏸").yellow(),
        TaskStatus::Failed => style("✗").red(),
        TaskStatus::Cancelled => style("○").dim(),
        TaskStatus::Pending => style("·").dim(),
    };

    let progress = format!("{:.1}%", task.progress);

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&task.repo.id).bold(),
        style(&progress).dim(),
        style(task.status).dim()
    );

    if detailed {
        println!("    ID: {}", task.id);
        println!("    Repo: {}", task.repo);
        println!("    Backend: {}", task.backend.as_str());
        if let Some(dir) = &task.resolved_target_dir {
            println!("    Target: {}", dir.display());
        }
        if !task.include_patterns.is_empty() {
            println!("    Include: {}", task.include_patterns.join(", "));
        }
        if !task.exclude_patterns.is_empty() {
            println!("    Exclude: {}", task.exclude_patterns.join(", "));
        }
        println!(
            "    Size: {} / {} ({} / {} files)",
            format_bytes(task.downloaded_bytes),
            format_bytes(task.total_bytes),
            task.downloaded_files,
            task.total_files
        );
        if task.status.is_active() {
            let eta = task
                .total_bytes
                .saturating_sub(task.downloaded_bytes)
                .checked_div(task.speed_bytes_per_sec)
                .unwrap_or(0);
            println!(
                "    Speed: {}  ETA: {}",
                format_speed(task.speed_bytes_per_sec),
                format_eta(eta)
            );
        }
        if let Some(file) = &task.current_file {
            println!("    Current: {}", file);
        }
        if let Some(path) = &task.result_path {
            println!("    Result: {}", path.display());
        }
        if let Some(error) = &task.error_message {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

pub fn show_info(task: Option<DownloadTask>, id: &str, format: OutputFormat) -> Result<()> {
    let task = task.ok_or_else(|| anyhow!("Task not found: {}", id))?;

    match format {
        OutputFormat::Json => print_json(&task)?,
        _ => print_task_summary(&task, true),
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

/// Look up a dotted key such as `accelerator.split`
fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(root, |value, part| value.get(part))
}

fn lookup_mut<'a>(root: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    key.split('.').try_fold(root, |value, part| value.get_mut(part))
}

/// Parse a command-line value: JSON when it parses, a plain string otherwise
fn parse_value(raw: &str) -> Value {
    match raw {
        "none" | "null" => Value::Null,
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

pub fn show_config(settings: &EngineSettings, data_dir: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(settings)?,
        _ => {
            println!("hubdl Configuration:");
            println!();
            println!("  Data directory: {}", data_dir.display());
            println!(
                "  Download directory: {}",
                settings
                    .download_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "hub cache".to_string())
            );
            println!("  Endpoint: {}", settings.endpoint);
            println!("  Backend: {}", settings.backend.as_str());
            println!("  Accelerated transfer: {}", settings.accelerated_transfer);
            println!("  Transfer workers: {}", settings.transfer_workers);
            println!("  Verify workers: {}", settings.verify_workers);
            println!("  Max concurrent downloads: {}", settings.max_concurrent_downloads);
            println!("  Auto-resume incomplete: {}", settings.auto_resume_incomplete);
            println!(
                "  Proxy: {}",
                settings.proxy_url.as_deref().unwrap_or("none")
            );
            println!(
                "  Accelerator: port {}, {} connections, split {}",
                settings.accelerator.port,
                settings.accelerator.max_connection_per_server,
                settings.accelerator.split
            );
        }
    }

    Ok(())
}

/// Print one dotted config key
pub fn get_config(settings: &EngineSettings, key: &str) -> Result<()> {
    let settings = serde_json::to_value(settings)?;
    let value = lookup(&settings, key).ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
    match value {
        Value::String(s) => println!("{}", s),
        other => println!("{}", other),
    }
    Ok(())
}

pub async fn config_action(core: &HubdlCore, action: Option<ConfigAction>, format: OutputFormat) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            show_config(&core.settings(), core.storage().data_dir(), format)?;
        }

        Some(ConfigAction::Get { key }) => get_config(&core.settings(), &key)?,

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = serde_json::to_value(core.settings())?;
            let slot = lookup_mut(&mut settings, &key).ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            if slot.is_object() {
                bail!("{} is a section; set one of its keys", key);
            }
            *slot = parse_value(&value);

            let settings: EngineSettings = serde_json::from_value(settings)
                .map_err(|e| anyhow!("Invalid value for {}: {}", key, e))?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                core.update_settings(EngineSettings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_keys() {
        let mut settings = serde_json::to_value(EngineSettings::default()).unwrap();
        assert_eq!(lookup(&settings, "accelerator.split"), Some(&Value::from(16)));
        assert!(lookup(&settings, "accelerator.nope").is_none());

        *lookup_mut(&mut settings, "accelerator.split").unwrap() = parse_value("4");
        *lookup_mut(&mut settings, "proxy_url").unwrap() = parse_value("http://proxy:3128");
        let parsed: EngineSettings = serde_json::from_value(settings).unwrap();
        assert_eq!(parsed.accelerator.split, 4);
        assert_eq!(parsed.proxy_url.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("none"), Value::Null);
        assert_eq!(parse_value("rename"), Value::String("rename".into()));
    }
}
