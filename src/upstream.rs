use std::{
    error::Error as StdError,
    future::Future,
    io::{self, Read as _},
};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Uri,
    header::{self, HeaderValue},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{
    recorder::{InterceptedRequest, ObservedResponse},
    stub::Payload,
};

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Performs the real network call for an intercepted request.
pub trait Upstream: Send + Sync {
    fn forward(
        &self,
        request: &InterceptedRequest,
    ) -> impl Future<Output = Result<ObservedResponse, UpstreamError>> + Send;
}

#[derive(Debug)]
pub enum UpstreamError {
    InvalidTarget(String),
    Request(Box<dyn StdError + Send + Sync>),
    Body(Box<dyn StdError + Send + Sync>),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTarget(reason) => write!(f, "invalid upstream target: {reason}"),
            Self::Request(err) => write!(f, "upstream request failed: {err}"),
            Self::Body(err) => write!(f, "read upstream response body: {err}"),
        }
    }
}

impl StdError for UpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidTarget(_) => None,
            Self::Request(err) | Self::Body(err) => Some(err.as_ref()),
        }
    }
}

/// Forwards requests over HTTP(S).
///
/// With a base URI, the request's path and query are sent to the base's scheme and authority.
/// Without one, only absolute `http://`/`https://` request targets can be forwarded.
#[derive(Clone)]
pub struct HttpUpstream {
    client: HttpsClient,
    base: Option<Uri>,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl HttpUpstream {
    pub fn new(base: Option<Uri>) -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { client, base })
    }

    pub fn base(&self) -> Option<&Uri> {
        self.base.as_ref()
    }

    fn target_uri(&self, url: &str) -> Result<Uri, UpstreamError> {
        let original: Uri = url
            .parse()
            .map_err(|err| UpstreamError::InvalidTarget(format!("`{url}`: {err}")))?;
        match self.base.as_ref() {
            Some(base) => rebase_uri(base, &original),
            None => absolute_target(&original)
                .ok_or_else(|| UpstreamError::InvalidTarget(format!("`{url}` is not absolute"))),
        }
    }
}

impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        request: &InterceptedRequest,
    ) -> Result<ObservedResponse, UpstreamError> {
        let uri = self.target_uri(&request.url)?;

        let upstream_req = upstream_request(request, uri);
        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|err| UpstreamError::Request(Box::new(err)))?;
        let (mut parts, body) = response.into_parts();
        let raw_body = body
            .collect()
            .await
            .map_err(|err| UpstreamError::Body(Box::new(err)))?
            .to_bytes();
        let raw_body = decode_content_encoding(&mut parts.headers, raw_body)
            .map_err(|err| UpstreamError::Body(Box::new(err)))?;

        Ok(ObservedResponse {
            status: parts.status,
            body: decode_response_body(&parts.headers, &raw_body),
            headers: parts.headers,
            raw_body,
        })
    }
}

/// The outgoing request mirrors the intercepted one, except that it asks for an uncompressed
/// reply so the recorded body is readable.
fn upstream_request(request: &InterceptedRequest, uri: Uri) -> Request<Full<Bytes>> {
    let mut upstream_req = Request::new(Full::new(Bytes::from(request.body.to_vec())));
    *upstream_req.method_mut() = request.method.clone();
    *upstream_req.headers_mut() = request.headers.clone();
    upstream_req.headers_mut().remove(header::ACCEPT_ENCODING);
    set_host_header(upstream_req.headers_mut(), &uri);
    *upstream_req.uri_mut() = uri;
    upstream_req
}

/// Undoes a gzip or deflate `Content-Encoding` and drops the headers describing the encoded
/// form. Other encodings are passed through untouched.
fn decode_content_encoding(headers: &mut hyper::HeaderMap, body: Bytes) -> io::Result<Bytes> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());
    let mut decoded = Vec::new();
    match encoding.as_deref() {
        Some("gzip" | "x-gzip") => {
            GzDecoder::new(&body[..]).read_to_end(&mut decoded)?;
        }
        Some("deflate") => {
            ZlibDecoder::new(&body[..]).read_to_end(&mut decoded)?;
        }
        _ => return Ok(body),
    }
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    Ok(Bytes::from(decoded))
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn rebase_uri(base: &Uri, original: &Uri) -> Result<Uri, UpstreamError> {
    let mut parts = original.clone().into_parts();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|err| UpstreamError::InvalidTarget(err.to_string()))
}

fn absolute_target(original: &Uri) -> Option<Uri> {
    if !matches!(original.scheme_str(), Some("http" | "https")) {
        return None;
    }
    original.authority()?;
    Some(original.clone())
}

fn set_host_header(headers: &mut hyper::HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

/// JSON responses are parsed the way HTTP clients hand them to callers; other bodies stay text
/// or bytes.
pub(crate) fn decode_response_body(headers: &hyper::HeaderMap, raw: &[u8]) -> Payload {
    let declares_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.to_ascii_lowercase().contains("json"));
    if declares_json {
        if let Ok(value) = serde_json::from_slice(raw) {
            return Payload::Json(value);
        }
    }
    Payload::from_bytes(raw)
}
