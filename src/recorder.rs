use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use tracing::Instrument as _;

use crate::{
    canonical::{IdentityTransform, StubTransform, canonicalize},
    merge::{CaptureOptions, DuplicateKeyPolicy, MergeError, MergeOutcome, merge_observation},
    store::{StoreLocks, StubStoreError, load_stubs, write_stubs},
    stub::Payload,
    upstream::{Upstream, UpstreamError},
};

/// A request handed over by the interception layer.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedRequest {
    pub method: Method,
    /// The request target exactly as the client issued it.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Payload,
}

/// The real upstream response. `raw_body` is what the caller receives; `body` is what gets
/// recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Payload,
    pub raw_body: Bytes,
}

#[derive(Clone)]
pub struct RecorderOptions {
    pub capture: CaptureOptions,
    pub transform: Arc<dyn StubTransform>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            capture: CaptureOptions::default(),
            transform: Arc::new(IdentityTransform),
        }
    }
}

impl std::fmt::Debug for RecorderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderOptions")
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

impl RecorderOptions {
    pub fn include_headers(mut self, include_headers: bool) -> Self {
        self.capture.include_headers = include_headers;
        self
    }

    pub fn duplicate_keys(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.capture.duplicate_keys = policy;
        self
    }

    pub fn with_transform(mut self, transform: impl StubTransform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }
}

#[derive(Debug)]
pub enum RecordError {
    Network(UpstreamError),
    Store(StubStoreError),
    Merge(MergeError),
    Join(tokio::task::JoinError),
}

impl RecordError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Store(err) => err.kind(),
            Self::Merge(err) => err.kind(),
            Self::Join(_) => "join",
        }
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Merge(err) => write!(f, "{err}"),
            Self::Join(err) => write!(f, "join stub persistence task: {err}"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(err) => err.source(),
            Self::Store(err) => err.source(),
            Self::Merge(err) => err.source(),
            Self::Join(err) => Some(err),
        }
    }
}

impl From<StubStoreError> for RecordError {
    fn from(value: StubStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<MergeError> for RecordError {
    fn from(value: MergeError) -> Self {
        Self::Merge(value)
    }
}

/// Forwards intercepted requests and folds every observed exchange into a stub file.
///
/// The file is reloaded for every request so edits made between requests are picked up.
/// Cycles against the same file are serialized through [`StoreLocks`].
#[derive(Debug)]
pub struct StubRecorder<U> {
    stubs_path: PathBuf,
    upstream: U,
    options: RecorderOptions,
    locks: StoreLocks,
}

impl<U: Upstream> StubRecorder<U> {
    pub fn new(stubs_path: impl Into<PathBuf>, upstream: U, options: RecorderOptions) -> Self {
        Self {
            stubs_path: stubs_path.into(),
            upstream,
            options,
            locks: StoreLocks::default(),
        }
    }

    /// Shares write locks with other recorders that may target the same files.
    pub fn with_locks(mut self, locks: StoreLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn stubs_path(&self) -> &Path {
        &self.stubs_path
    }

    pub fn options(&self) -> &RecorderOptions {
        &self.options
    }

    /// Forwards `request`, records the exchange and returns the real response unchanged.
    ///
    /// A network failure leaves the stub file untouched.
    pub async fn record(
        &self,
        request: InterceptedRequest,
    ) -> Result<ObservedResponse, RecordError> {
        let span = tracing::info_span!(
            "stubrecorder.record",
            method = %request.method,
            url = %request.url,
        );
        self.record_inner(request).instrument(span).await
    }

    async fn record_inner(
        &self,
        request: InterceptedRequest,
    ) -> Result<ObservedResponse, RecordError> {
        let response = self
            .upstream
            .forward(&request)
            .await
            .map_err(RecordError::Network)?;
        tracing::debug!(status = response.status.as_u16(), "upstream responded");

        let lock = self.locks.lock_for(&self.stubs_path);
        let _guard = lock.lock().await;

        let stubs_path = self.stubs_path.clone();
        let options = self.options.clone();
        let (response, outcome, stubs_total) = tokio::task::spawn_blocking(move || {
            persist_observation(&stubs_path, &request, &response, &options)
                .map(|(outcome, stubs_total)| (response, outcome, stubs_total))
        })
        .await
        .map_err(RecordError::Join)??;

        tracing::info!(
            outcome = outcome.as_str(),
            stubs = stubs_total,
            status = response.status.as_u16(),
            "recorded stub"
        );
        Ok(response)
    }
}

/// Load, merge, canonicalize and write one observed exchange. Returns the merge outcome and the
/// number of stubs written.
pub fn persist_observation(
    stubs_path: &Path,
    request: &InterceptedRequest,
    response: &ObservedResponse,
    options: &RecorderOptions,
) -> Result<(MergeOutcome, usize), RecordError> {
    let mut stubs = load_stubs(stubs_path)?;
    let outcome = merge_observation(&mut stubs, request, response, &options.capture)?;
    let stubs = canonicalize(stubs, options.transform.as_ref());
    write_stubs(stubs_path, &stubs)?;
    Ok((outcome, stubs.len()))
}
