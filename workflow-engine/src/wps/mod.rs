//! Client for the external WPS protocol: process description, asynchronous execute, and status
//! polling. This is the only part of the engine that speaks to the outside world.

mod xml;

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::error::{EmError, EmResult};
use log::debug;
use rand::Rng;
use tokio::sync::Mutex;

use crate::{
    error::{Error, Result},
    message::Kind,
};

/// Declared shape of one input or output of a remote process.
#[derive(Debug, Clone)]
pub enum DataType {
    Literal(String),
    Complex {
        default_mime_type: String,
        default_schema: Option<String>,
        default_encoding: Option<String>,
        supported_mime_types: Vec<String>,
    },
    BoundingBox { supported_crs: Vec<String> },
}

impl DataType {
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Literal(_) => Kind::Literal,
            Self::Complex { .. } => Kind::Complex,
            Self::BoundingBox { .. } => Kind::BoundingBox,
        }
    }
}

/// One declared input of a remote process.
#[derive(Debug, Clone)]
pub struct ProcessInput {
    pub identifier: String,
    pub title: String,
    pub data_type: DataType,
    pub min_occurs: u32,
    pub max_occurs: u64,
}

/// One declared output of a remote process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub identifier: String,
    pub title: String,
    pub data_type: DataType,
}

/// Remote process description, cached per `(url, identifier)` for the lifetime of one `run()`
/// call. Read-only after construction, so sharing it behind an [Arc] across graph nodes is safe.
#[derive(Debug, Clone)]
pub struct ProcessDescription {
    pub identifier: String,
    pub inputs: Vec<ProcessInput>,
    pub outputs: Vec<ProcessOutput>,
}

impl ProcessDescription {
    pub fn input(&self, identifier: &str) -> Option<&ProcessInput> {
        self.inputs.iter().find(|input| input.identifier == identifier)
    }

    pub fn output(&self, identifier: &str) -> Option<&ProcessOutput> {
        self.outputs.iter().find(|output| output.identifier == identifier)
    }
}

/// Value submitted for one input of an execute request.
#[derive(Debug, Clone)]
pub enum WpsInputValue {
    Literal(String),
    Complex {
        data: String,
        mime_type: String,
        is_reference: bool,
    },
    BoundingBox { crs: String, coords: Vec<f64> },
}

/// Status reported by a remote execution, as it progresses toward a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Accepted,
    Started,
    Paused,
    Succeeded,
    Failed,
}

/// One `ows:Exception` entry from a `ProcessFailed` status document.
#[derive(Debug, Clone)]
pub struct WpsError {
    pub code: Option<String>,
    pub locator: Option<String>,
    pub text: String,
}

/// Live handle to an in-flight (or completed) remote execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub status_location: String,
    pub status: ExecutionStatus,
    pub status_message: Option<String>,
    pub percent_completed: u8,
    pub process_outputs: Vec<crate::message::WpsOutputValue>,
    pub errors: Vec<WpsError>,
}

impl ExecutionHandle {
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

/// Fixed delays and retry budget governing the status-poll loop. Defaults match the standard
/// three/five second cadence; each can be overridden by environment variable for testing.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub poll_delay: Duration,
    pub retry_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(3),
            retry_delay: Duration::from_secs(5),
            max_consecutive_failures: 5,
        }
    }
}

impl PollTiming {
    /// Overrides any of `WE_POLL_DELAY_SECS`, `WE_RETRY_DELAY_SECS`, `WE_MAX_RETRIES` found in the
    /// environment, falling back to [`PollTiming::default`] for anything unset.
    pub fn from_env() -> EmResult<Self> {
        let mut timing = Self::default();
        if let Ok(raw) = std::env::var("WE_POLL_DELAY_SECS") {
            timing.poll_delay = Duration::from_secs(raw.parse()?);
        }
        if let Ok(raw) = std::env::var("WE_RETRY_DELAY_SECS") {
            timing.retry_delay = Duration::from_secs(raw.parse()?);
        }
        if let Ok(raw) = std::env::var("WE_MAX_RETRIES") {
            timing.max_consecutive_failures = raw.parse()?;
        }
        Ok(timing)
    }
}

/// Client abstraction over the WPS wire protocol. Exists as a trait so tests can substitute a
/// stub implementation without standing up an HTTP server, though the integration tests exercise
/// [`ReqwestWpsClient`] against a real stub server.
#[async_trait]
pub trait WpsClient: Send + Sync {
    async fn describe(&self, url: &str, identifier: &str) -> Result<Arc<ProcessDescription>>;

    async fn execute(
        &self,
        url: &str,
        identifier: &str,
        inputs: &[(String, WpsInputValue)],
        requested_outputs: &[(String, bool)],
        headers: &HashMap<String, String>,
    ) -> Result<ExecutionHandle>;

    async fn poll(&self, handle: &mut ExecutionHandle) -> Result<()>;
}

/// Generates a 16-character lowercase-alphanumeric `machineid` used for remote-side routing, one
/// per execute call.
pub fn machine_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Default [`WpsClient`] backed by `reqwest`.
pub struct ReqwestWpsClient {
    http: reqwest::Client,
    cache: Mutex<HashMap<(String, String), Arc<ProcessDescription>>>,
}

impl ReqwestWpsClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ReqwestWpsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WpsClient for ReqwestWpsClient {
    async fn describe(&self, url: &str, identifier: &str) -> Result<Arc<ProcessDescription>> {
        let key = (url.to_owned(), identifier.to_owned());
        if let Some(cached) = self.cache.lock().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let response = self
            .http
            .get(url)
            .query(&[
                ("service", "WPS"),
                ("version", "1.0.0"),
                ("request", "DescribeProcess"),
                ("identifier", identifier),
            ])
            .send()
            .await
            .map_err(|source| Error::RemoteUnavailable {
                url: url.to_owned(),
                source: EmError::from(source),
            })?;
        let body = response
            .text()
            .await
            .map_err(|source| Error::RemoteUnavailable {
                url: url.to_owned(),
                source: EmError::from(source),
            })?;
        let description = Arc::new(xml::parse_process_description(&body, identifier)?);
        self.cache.lock().await.insert(key, Arc::clone(&description));
        Ok(description)
    }

    async fn execute(
        &self,
        url: &str,
        identifier: &str,
        inputs: &[(String, WpsInputValue)],
        requested_outputs: &[(String, bool)],
        headers: &HashMap<String, String>,
    ) -> Result<ExecutionHandle> {
        let body = xml::build_execute_request(identifier, inputs, requested_outputs);
        let mut request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .header("machineid", machine_id())
            .body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|source| Error::RemoteUnavailable {
            url: url.to_owned(),
            source: EmError::from(source),
        })?;
        let response_url = response.url().to_string();
        let body = response.text().await.map_err(|source| Error::RemoteUnavailable {
            url: url.to_owned(),
            source: EmError::from(source),
        })?;
        xml::parse_execute_response(&body, &response_url)
    }

    async fn poll(&self, handle: &mut ExecutionHandle) -> Result<()> {
        let response = self
            .http
            .get(&handle.status_location)
            .send()
            .await
            .map_err(|source| Error::Common(EmError::from(source)))?;
        let body = response
            .text()
            .await
            .map_err(|source| Error::Common(EmError::from(source)))?;
        let refreshed = xml::parse_execute_response(&body, &handle.status_location)?;
        *handle = refreshed;
        Ok(())
    }
}

/// Drives [`WpsClient::poll`] until `handle` reaches a terminal state, honoring the fixed poll
/// delay, the distinct retry delay, and the consecutive-failure budget. `on_progress` is invoked
/// after every successful poll so the caller can decide whether to emit a progress event.
pub async fn poll_until_terminal<C, F>(
    client: &C,
    handle: &mut ExecutionHandle,
    timing: &PollTiming,
    mut on_progress: F,
) -> Result<()>
where
    C: WpsClient + ?Sized,
    F: FnMut(&ExecutionHandle),
{
    let mut consecutive_failures = 0u32;
    while !handle.is_terminal() {
        match client.poll(handle).await {
            Ok(()) => {
                consecutive_failures = 0;
                on_progress(handle);
            }
            Err(error) => {
                consecutive_failures += 1;
                debug!(
                    "status read failed ({consecutive_failures}/{}): {error}",
                    timing.max_consecutive_failures
                );
                if consecutive_failures > timing.max_consecutive_failures {
                    let source = match error {
                        Error::Common(inner) => inner,
                        other => EmError::Generic(other.to_string()),
                    };
                    return Err(Error::StatusReadFailed {
                        status_location: handle.status_location.clone(),
                        attempts: consecutive_failures,
                        source,
                    });
                }
                tokio::time::sleep(timing.retry_delay).await;
                continue;
            }
        }
        if handle.is_terminal() {
            break;
        }
        tokio::time::sleep(timing.poll_delay).await;
    }
    Ok(())
}
