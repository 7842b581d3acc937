use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderName},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    config::Config,
    recorder::{InterceptedRequest, ObservedResponse, RecordError, StubRecorder},
    stub::Payload,
    upstream::{HttpUpstream, Upstream},
};

/// A running recording proxy. Dropping the handle stops accepting connections; call
/// [`ProxyHandle::shutdown`] to also wait for the accept loop to exit.
#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Starts the recording proxy described by `config`, forwarding over HTTP(S).
pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    let upstream = HttpUpstream::new(config.proxy.upstream_uri()?)?;
    let recorder = StubRecorder::new(
        config.recorder.stubs_file.clone(),
        upstream,
        config.recorder_options(),
    );
    serve_recorder(config.proxy.listen, recorder).await
}

/// Starts a proxy on `listen` that runs every request through `recorder`.
pub async fn serve_recorder<U>(
    listen: SocketAddr,
    recorder: StubRecorder<U>,
) -> anyhow::Result<ProxyHandle>
where
    U: Upstream + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    tracing::info!(
        listen = %listen_addr,
        stubs_file = %recorder.stubs_path().display(),
        "recording proxy listening"
    );

    let recorder = Arc::new(recorder);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let recorder = Arc::clone(&recorder);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| proxy_handler(req, Arc::clone(&recorder)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
        tracing::debug!(listen = %listen_addr, "recording proxy stopped");
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn proxy_handler<U: Upstream>(
    req: Request<Incoming>,
    recorder: Arc<StubRecorder<U>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read client request body: {err}");
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };
    strip_hop_by_hop_headers(&mut parts.headers);

    let request = InterceptedRequest {
        method: parts.method,
        url: parts.uri.to_string(),
        headers: parts.headers,
        body: if body.is_empty() {
            Payload::Empty
        } else {
            Payload::from_bytes(&body)
        },
    };

    match recorder.record(request).await {
        Ok(observed) => Ok(response_from_observed(observed)),
        Err(err) => {
            tracing::warn!(kind = err.kind(), error = %err, "recording failed");
            Ok(error_response(&err))
        }
    }
}

fn response_from_observed(observed: ObservedResponse) -> Response<Full<Bytes>> {
    let ObservedResponse {
        status,
        mut headers,
        raw_body,
        ..
    } = observed;
    strip_hop_by_hop_headers(&mut headers);
    let mut response = Response::new(Full::new(raw_body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn error_response(err: &RecordError) -> Response<Full<Bytes>> {
    match err {
        RecordError::Network(_) => {
            simple_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
        RecordError::Merge(_) => simple_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to record request: {err}"),
        ),
        RecordError::Store(_) | RecordError::Join(_) => simple_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to update stub file: {err}"),
        ),
    }
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

/// Holds at most one active recording proxy for a client. Activating a new one shuts the
/// previous one down first.
#[derive(Debug, Default)]
pub struct InterceptorSlot {
    active: Option<ProxyHandle>,
}

impl InterceptorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activate(&mut self, config: &Config) -> anyhow::Result<SocketAddr> {
        self.deactivate().await;
        let handle = serve(config).await?;
        Ok(self.install(handle))
    }

    pub async fn activate_recorder<U>(
        &mut self,
        listen: SocketAddr,
        recorder: StubRecorder<U>,
    ) -> anyhow::Result<SocketAddr>
    where
        U: Upstream + 'static,
    {
        self.deactivate().await;
        let handle = serve_recorder(listen, recorder).await?;
        Ok(self.install(handle))
    }

    /// Shuts down the active proxy, if any. Returns whether one was active.
    pub async fn deactivate(&mut self) -> bool {
        match self.active.take() {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn active_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|handle| handle.listen_addr)
    }

    fn install(&mut self, handle: ProxyHandle) -> SocketAddr {
        let listen_addr = handle.listen_addr;
        self.active = Some(handle);
        listen_addr
    }
}
