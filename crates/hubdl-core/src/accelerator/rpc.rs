//! JSON-RPC client for the accelerator daemon (aria2 protocol)

use crate::error::AcceleratorError;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// One file submitted to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddRequest {
    pub uri: String,
    /// Directory the file is written to
    pub dir: PathBuf,
    /// File name inside `dir`
    pub out: String,
    /// Extra HTTP headers, `Name: value`
    pub headers: Vec<String>,
}

/// Status of one daemon job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub gid: String,
    /// active, waiting, paused, error, complete, or removed
    pub status: String,
    #[serde(default, deserialize_with = "number_string")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "number_string")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "number_string")]
    pub download_speed: u64,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files: Vec<JobFile>,
}

impl JobStatus {
    pub fn is_complete(&self) -> bool {
        self.status == "complete"
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }

    pub fn is_paused(&self) -> bool {
        self.status == "paused"
    }

    /// Running or queued inside the daemon
    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "active" | "waiting")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobFile {
    pub path: String,
}

/// The daemon reports numbers as decimal strings
fn number_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("negative length")),
        _ => Ok(0),
    }
}

/// Typed RPC surface of the accelerator daemon
#[async_trait]
pub trait AcceleratorRpc: Send + Sync {
    /// Health check; returns the daemon version
    async fn version(&self) -> Result<String, AcceleratorError>;

    /// Submit files; returns one job id per request, in order
    async fn add_batch(&self, requests: &[AddRequest]) -> Result<Vec<String>, AcceleratorError>;

    /// Status per job id; `None` for ids the daemon no longer knows
    async fn statuses(&self, gids: &[String]) -> Result<Vec<Option<JobStatus>>, AcceleratorError>;

    async fn pause(&self, gids: &[String]) -> Result<(), AcceleratorError>;

    async fn unpause(&self, gids: &[String]) -> Result<(), AcceleratorError>;

    async fn remove(&self, gids: &[String]) -> Result<(), AcceleratorError>;

    async fn change_global_options(&self, options: Map<String, Value>) -> Result<(), AcceleratorError>;
}

const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
    "files",
];

/// aria2 JSON-RPC over HTTP
#[derive(Clone)]
pub struct Aria2Client {
    client: reqwest::Client,
    url: String,
    token: String,
    batch_size: usize,
}

impl Aria2Client {
    pub fn new(port: u16, secret: &str, batch_size: usize) -> Result<Self, AcceleratorError> {
        // Loopback traffic never goes through a proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: format!("http://127.0.0.1:{}/jsonrpc", port),
            token: format!("token:{}", secret),
            batch_size: batch_size.max(1),
        })
    }

    fn params(&self, params: Vec<Value>) -> Vec<Value> {
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(Value::String(self.token.clone()));
        full.extend(params);
        full
    }

    /// A single call
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AcceleratorError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": self.params(params),
        });
        self.post(body).await
    }

    /// Many calls in `system.multicall` envelopes of at most `batch_size`.
    ///
    /// Returns one result per call, in order; individual faults do not fail the batch.
    pub async fn multicall(
        &self,
        calls: Vec<(&str, Vec<Value>)>,
    ) -> Result<Vec<Result<Value, AcceleratorError>>, AcceleratorError> {
        let mut results = Vec::with_capacity(calls.len());
        let mut calls = calls.into_iter().peekable();

        while calls.peek().is_some() {
            let chunk: Vec<Value> = calls
                .by_ref()
                .take(self.batch_size)
                .map(|(method, params)| json!({"methodName": method, "params": self.params(params)}))
                .collect();
            let expected = chunk.len();
            debug!("Sending multicall with {} calls", expected);

            let body = json!({
                "jsonrpc": "2.0",
                "id": uuid::Uuid::new_v4().to_string(),
                "method": "system.multicall",
                "params": [chunk],
            });
            let Value::Array(items) = self.post(body).await? else {
                return Err(AcceleratorError::Response("multicall result is not a list".into()));
            };
            if items.len() != expected {
                return Err(AcceleratorError::Response(format!(
                    "multicall returned {} results for {} calls",
                    items.len(),
                    expected
                )));
            }
            results.extend(items.into_iter().map(unwrap_multicall_item));
        }

        Ok(results)
    }

    async fn post(&self, body: Value) -> Result<Value, AcceleratorError> {
        let response: Value = self.client.post(&self.url).json(&body).send().await?.json().await?;
        parse_response(response)
    }

    async fn for_each(&self, method: &str, gids: &[String]) -> Result<(), AcceleratorError> {
        if gids.is_empty() {
            return Ok(());
        }
        let calls = gids
            .iter()
            .map(|gid| (method, vec![Value::String(gid.clone())]))
            .collect();
        for result in self.multicall(calls).await? {
            if let Err(e) = result {
                // Already in the requested state, or gone
                debug!("{} ignored: {}", method, e);
            }
        }
        Ok(())
    }
}

/// Pull `result` out of a response envelope, or turn `error` into an error
pub fn parse_response(mut response: Value) -> Result<Value, AcceleratorError> {
    if let Some(error) = response.get("error") {
        return Err(rpc_error(error));
    }
    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| AcceleratorError::Response("missing result".into()))
}

/// Multicall items are `[value]` on success or a fault struct
fn unwrap_multicall_item(item: Value) -> Result<Value, AcceleratorError> {
    match item {
        Value::Array(mut values) if !values.is_empty() => Ok(values.swap_remove(0)),
        Value::Object(_) => Err(rpc_error(&item)),
        other => Err(AcceleratorError::Response(format!("unexpected multicall item: {}", other))),
    }
}

fn rpc_error(error: &Value) -> AcceleratorError {
    let code = error
        .get("code")
        .or_else(|| error.get("faultCode"))
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let message = error
        .get("message")
        .or_else(|| error.get("faultString"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    AcceleratorError::Rpc { code, message }
}

#[async_trait]
impl AcceleratorRpc for Aria2Client {
    async fn version(&self) -> Result<String, AcceleratorError> {
        let result = self.call("aria2.getVersion", Vec::new()).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn add_batch(&self, requests: &[AddRequest]) -> Result<Vec<String>, AcceleratorError> {
        let calls = requests
            .iter()
            .map(|r| {
                let mut options = json!({
                    "dir": r.dir.to_string_lossy(),
                    "out": r.out,
                    "continue": "true",
                });
                if !r.headers.is_empty() {
                    options["header"] = json!(r.headers);
                }
                ("aria2.addUri", vec![json!([r.uri]), options])
            })
            .collect();

        let mut gids = Vec::with_capacity(requests.len());
        let mut failure = None;
        for result in self.multicall(calls).await? {
            let gid = result.and_then(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AcceleratorError::Response("job id is not a string".into()))
            });
            match gid {
                Ok(gid) => gids.push(gid),
                Err(e) => failure = failure.or(Some(e)),
            }
        }

        match failure {
            None => Ok(gids),
            Some(e) => {
                // Don't leave half a task behind in the daemon
                if let Err(remove_error) = self.remove(&gids).await {
                    debug!("Removing {} partially added jobs failed: {}", gids.len(), remove_error);
                }
                Err(e)
            }
        }
    }

    async fn statuses(&self, gids: &[String]) -> Result<Vec<Option<JobStatus>>, AcceleratorError> {
        let calls = gids
            .iter()
            .map(|gid| ("aria2.tellStatus", vec![Value::String(gid.clone()), json!(STATUS_KEYS)]))
            .collect();

        Ok(self
            .multicall(calls)
            .await?
            .into_iter()
            .map(|result| result.ok().and_then(|v| serde_json::from_value(v).ok()))
            .collect())
    }

    async fn pause(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.for_each("aria2.forcePause", gids).await
    }

    async fn unpause(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.for_each("aria2.unpause", gids).await
    }

    async fn remove(&self, gids: &[String]) -> Result<(), AcceleratorError> {
        self.for_each("aria2.forceRemove", gids).await
    }

    async fn change_global_options(&self, options: Map<String, Value>) -> Result<(), AcceleratorError> {
        self.call("aria2.changeGlobalOption", vec![Value::Object(options)])
            .await
            .map(|_| ())
    }
}
