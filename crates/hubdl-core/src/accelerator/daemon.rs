//! Supervisor for the local accelerator daemon

use crate::accelerator::rpc::AcceleratorRpc;
use crate::error::AcceleratorError;
use hubdl_types::AcceleratorSettings;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const DEFAULT_BINARY: &str = "aria2c";
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Starts the daemon on demand and keeps track of the process we spawned
pub struct AcceleratorDaemon {
    settings: Mutex<AcceleratorSettings>,
    /// Engine-wide proxy used when the daemon has none of its own
    fallback_proxy: Option<String>,
    rpc: Arc<dyn AcceleratorRpc>,
    child: tokio::sync::Mutex<Option<Child>>,
    strays_killed: AtomicBool,
}

impl AcceleratorDaemon {
    pub fn new(
        settings: AcceleratorSettings,
        fallback_proxy: Option<String>,
        rpc: Arc<dyn AcceleratorRpc>,
    ) -> Self {
        Self {
            settings: Mutex::new(settings),
            fallback_proxy,
            rpc,
            child: tokio::sync::Mutex::new(None),
            strays_killed: AtomicBool::new(false),
        }
    }

    fn binary(settings: &AcceleratorSettings) -> PathBuf {
        settings
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY))
    }

    /// Make sure a daemon answers on the RPC port, spawning one if needed
    pub async fn ensure_running(&self) -> Result<(), AcceleratorError> {
        let mut child = self.child.lock().await;

        if self.rpc.version().await.is_ok() {
            return Ok(());
        }

        let settings = self.settings.lock().clone();
        if settings.kill_strays && !self.strays_killed.swap(true, Ordering::SeqCst) {
            kill_strays(&settings).await;
        }

        let binary = Self::binary(&settings);
        let args = daemon_args(&settings, self.fallback_proxy.as_deref());
        info!("Starting accelerator daemon {} on port {}", binary.display(), settings.port);

        let mut process = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AcceleratorError::Spawn(format!("{}: {}", binary.display(), e)))?;

        for _ in 0..settings.startup_attempts.max(1) {
            tokio::time::sleep(STARTUP_POLL).await;

            if let Ok(Some(status)) = process.try_wait() {
                return Err(AcceleratorError::Spawn(format!(
                    "daemon exited immediately with {}",
                    status
                )));
            }
            if let Ok(version) = self.rpc.version().await {
                info!("Accelerator daemon {} is up", version);
                *child = Some(process);
                return Ok(());
            }
        }

        let _ = process.kill().await;
        Err(AcceleratorError::Spawn(format!(
            "daemon not reachable on port {} after {} attempts",
            settings.port, settings.startup_attempts
        )))
    }

    /// Settings used the next time the daemon is spawned
    pub fn set_settings(&self, settings: &AcceleratorSettings) {
        *self.settings.lock() = settings.clone();
    }

    /// Stop the daemon if this process started it
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            info!("Stopping accelerator daemon");
            if let Err(e) = child.kill().await {
                warn!("Failed to stop accelerator daemon: {}", e);
            }
        }
    }
}

/// Command-line flags for the daemon
pub fn daemon_args(settings: &AcceleratorSettings, fallback_proxy: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--enable-rpc=true".to_string(),
        format!("--rpc-listen-port={}", settings.port),
        format!("--rpc-secret={}", settings.secret),
        "--rpc-listen-all=false".to_string(),
        format!("--max-connection-per-server={}", settings.max_connection_per_server),
        format!("--split={}", settings.split),
        format!("--min-split-size={}", settings.min_split_size),
        "--daemon=false".to_string(),
        "--no-conf".to_string(),
        "--console-log-level=warn".to_string(),
        format!("--check-certificate={}", settings.check_certificate),
        format!("--reuse-uri={}", settings.reuse_uri),
        "--connect-timeout=60".to_string(),
        "--timeout=60".to_string(),
        "--max-tries=20".to_string(),
        "--retry-wait=3".to_string(),
    ];
    if let Some(proxy) = settings
        .all_proxy
        .as_deref()
        .or(fallback_proxy)
        .filter(|p| !p.is_empty())
    {
        args.push(format!("--all-proxy={}", proxy));
    }
    args
}

/// Runtime-changeable options pushed to a running daemon
pub fn global_options(settings: &AcceleratorSettings, fallback_proxy: Option<&str>) -> Map<String, Value> {
    let mut options = Map::new();
    options.insert(
        "max-connection-per-server".into(),
        Value::String(settings.max_connection_per_server.to_string()),
    );
    options.insert("split".into(), Value::String(settings.split.to_string()));
    options.insert("min-split-size".into(), Value::String(settings.min_split_size.clone()));
    options.insert(
        "check-certificate".into(),
        Value::String(settings.check_certificate.to_string()),
    );
    let proxy = settings.all_proxy.as_deref().or(fallback_proxy).unwrap_or_default();
    options.insert("all-proxy".into(), Value::String(proxy.to_string()));
    options
}

/// Kill daemons left over from a crashed run so the port is free
async fn kill_strays(settings: &AcceleratorSettings) {
    let binary = AcceleratorDaemon::binary(settings);
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_BINARY.to_string());

    let result = if cfg!(windows) {
        let image = if name.ends_with(".exe") {
            name
        } else {
            format!("{}.exe", name)
        };
        Command::new("taskkill")
            .args(["/F", "/T", "/IM", image.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
    } else {
        Command::new("pkill")
            .args(["-f", &format!("{}.*--rpc-listen-port={}", name, settings.port)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
    };

    match result {
        Ok(status) if status.success() => {
            info!("Killed stray accelerator daemons");
            // Give the OS a moment to release the port
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(_) => debug!("No stray accelerator daemons"),
        Err(e) => debug!("Could not look for stray daemons: {}", e),
    }
}
