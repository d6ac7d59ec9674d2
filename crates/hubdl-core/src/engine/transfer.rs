//! Transfer backends - move the bytes of a planned file set to disk
//!
//! A backend reports through a [`ProgressSink`] it is handed, never through
//! shared state. Backends that cannot report per-byte progress say so via
//! [`TransferBackend::reports_bytes`] and the worker samples the disk instead.

use crate::engine::sink::ProgressSink;
use crate::error::{HubdlError, TransferError};
use crate::hub::{http_client, CredentialProvider, RemoteFile};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use hubdl_types::{ProgressKind, RepoRef};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Suffix of files still being written
pub const INCOMPLETE_SUFFIX: &str = "incomplete";

const EMIT_INTERVAL: Duration = Duration::from_millis(250);

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub repo: RepoRef,
    pub files: Vec<RemoteFile>,
    pub local_dir: PathBuf,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Whether byte-level `progress` events are emitted in this mode
    fn reports_bytes(&self, accelerated: bool) -> bool;

    /// Fetch every file of the plan. Returns the directory the files landed in.
    async fn transfer(
        &self,
        plan: &TransferPlan,
        accelerated: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransferError>;
}

/// Plain HTTP transfer from the hub's resolve endpoint
pub struct HubTransfer {
    client: Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
    workers: usize,
}

impl HubTransfer {
    pub fn new(
        endpoint: impl Into<String>,
        proxy: Option<&str>,
        credentials: Arc<dyn CredentialProvider>,
        workers: usize,
    ) -> Result<Self, HubdlError> {
        Ok(Self {
            client: http_client(proxy)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
            workers: workers.max(1),
        })
    }

    fn parallelism(&self, accelerated: bool) -> usize {
        if accelerated {
            self.workers * 2
        } else {
            self.workers
        }
    }

    async fn fetch_file(
        &self,
        plan: &TransferPlan,
        file: &RemoteFile,
        report_bytes: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let dest = plan.local_dir.join(&file.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Already complete from an earlier attempt
        if let Ok(meta) = fs::metadata(&dest).await {
            if file.size == 0 || meta.len() == file.size {
                debug!("Skipping {} (already on disk)", file.path);
                if report_bytes && meta.len() > 0 {
                    sink.emit(ProgressKind::Progress {
                        inc: meta.len(),
                        is_byte_unit: true,
                    });
                }
                sink.emit(ProgressKind::Progress {
                    inc: 1,
                    is_byte_unit: false,
                });
                return Ok(());
            }
        }

        sink.emit(ProgressKind::FileStart {
            filename: file.path.clone(),
        });
        sink.emit(ProgressKind::TotalUpdate { total: file.size });

        let partial = partial_path(&dest);
        let offset = fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(resolve_url(&self.endpoint, &plan.repo, &file.path));
        if let Some(token) = self.credentials.token() {
            request = request.bearer_auth(token);
        }
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        let mut out = match status {
            StatusCode::PARTIAL_CONTENT => {
                debug!("Resuming {} from byte {}", file.path, offset);
                if report_bytes {
                    sink.emit(ProgressKind::Progress {
                        inc: offset,
                        is_byte_unit: true,
                    });
                }
                OpenOptions::new().append(true).open(&partial).await?
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                // The partial file already holds everything
                if report_bytes {
                    sink.emit(ProgressKind::Progress {
                        inc: offset,
                        is_byte_unit: true,
                    });
                }
                fs::rename(&partial, &dest).await?;
                sink.emit(ProgressKind::Progress {
                    inc: 1,
                    is_byte_unit: false,
                });
                return Ok(());
            }
            s if s.is_success() => fs::File::create(&partial).await?,
            s => {
                return Err(TransferError::Status {
                    file: file.path.clone(),
                    status: s.as_u16(),
                })
            }
        };

        let mut stream = response.bytes_stream();
        let mut pending = 0u64;
        let mut last_emit = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    out.flush().await?;
                    return Err(TransferError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            pending += chunk.len() as u64;

            if report_bytes && last_emit.elapsed() >= EMIT_INTERVAL {
                sink.emit(ProgressKind::Progress {
                    inc: pending,
                    is_byte_unit: true,
                });
                pending = 0;
                last_emit = Instant::now();
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if report_bytes && pending > 0 {
            sink.emit(ProgressKind::Progress {
                inc: pending,
                is_byte_unit: true,
            });
        }

        fs::rename(&partial, &dest).await?;
        sink.emit(ProgressKind::Progress {
            inc: 1,
            is_byte_unit: false,
        });
        debug!("Finished {}", file.path);
        Ok(())
    }
}

#[async_trait]
impl TransferBackend for HubTransfer {
    /// The accelerated mode trades per-byte callbacks for throughput
    fn reports_bytes(&self, accelerated: bool) -> bool {
        !accelerated
    }

    async fn transfer(
        &self,
        plan: &TransferPlan,
        accelerated: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        let report_bytes = self.reports_bytes(accelerated);
        info!(
            "Transferring {} files of {} to {} ({} at a time)",
            plan.files.len(),
            plan.repo.id,
            plan.local_dir.display(),
            self.parallelism(accelerated)
        );

        stream::iter(plan.files.iter().map(Ok::<_, TransferError>))
            .try_for_each_concurrent(self.parallelism(accelerated), |file| {
                self.fetch_file(plan, file, report_bytes, sink, cancel)
            })
            .await?;

        Ok(plan.local_dir.clone())
    }
}

/// `<file>.incomplete`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(INCOMPLETE_SUFFIX);
    PathBuf::from(name)
}

/// `{endpoint}/{prefix}{id}/resolve/{revision}/{path}`
pub fn resolve_url(endpoint: &str, repo: &RepoRef, path: &str) -> String {
    let encoded_path: Vec<String> = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}/{}{}/resolve/{}/{}",
        endpoint.trim_end_matches('/'),
        repo.kind.url_prefix(),
        repo.id,
        urlencoding::encode(&repo.revision),
        encoded_path.join("/")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubdl_types::RepoKind;

    #[test]
    fn test_resolve_url() {
        let repo = RepoRef::new("org/set", RepoKind::Dataset, "main");
        assert_eq!(
            resolve_url("https://hub.example/", &repo, "data/train 1.parquet"),
            "https://hub.example/datasets/org/set/resolve/main/data/train%201.parquet"
        );

        let repo = RepoRef::model("org/model");
        assert_eq!(
            resolve_url("https://hub.example", &repo, "config.json"),
            "https://hub.example/org/model/resolve/main/config.json"
        );
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/d/model.bin")),
            PathBuf::from("/d/model.bin.incomplete")
        );
    }
}
