//! Internal RPC Server
//!
//! Plain-HTTP endpoint the TLS gateway relays to: `POST` an envelope to any
//! path, get an envelope back. Routing is an axum [`Router`]; each accepted
//! connection is driven by hyper under its own tracing span.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::rpc::dispatcher::{RpcDispatcher, USER_ID_HEADER};

/// Fixed headers telling the client how the response body is encoded.
pub const ENVELOPE_RESPONSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "application/json"),
    ("X-Encryption", "on"),
    ("X-Encryption-Compress", "gzip"),
    ("X-Encryption-Mode", "3"),
];

/// RPC server configuration.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Bind address (loopback by default; only the gateway talks to it).
    pub bind_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Deadline for reading a request head, and for the whole request.
    pub read_timeout: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            max_body_bytes: 8 * 1024 * 1024,
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// RPC server errors.
#[derive(Debug, thiserror::Error)]
pub enum RpcServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The internal RPC server.
pub struct RpcServer {
    config: RpcServerConfig,
    listener: TcpListener,
    router: Router,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener.
    pub async fn bind(config: RpcServerConfig, dispatcher: RpcDispatcher) -> Result<Self, RpcServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let router = router(Arc::new(dispatcher), &config);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            router,
            shutdown_tx,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, RpcServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RpcServerError> {
        info!("RPC server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = self.router.clone();
                            let read_timeout = self.config.read_timeout;
                            let span = tracing::info_span!("rpc_conn", id = %Uuid::new_v4(), peer = %addr);
                            tokio::spawn(serve_connection(router, stream, read_timeout).instrument(span));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop the accept loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Routes of the RPC endpoint. Every path accepts `POST`.
pub fn router(dispatcher: Arc<RpcDispatcher>, config: &RpcServerConfig) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/*path", post(handle_rpc))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TimeoutLayer::new(config.read_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Drive HTTP/1.1 on one connected stream until the peer goes away.
pub async fn serve_connection<S>(router: Router, stream: S, read_timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(read_timeout);

    if let Err(e) = builder
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router))
        .await
    {
        debug!("Connection ended with error: {}", e);
    }
}

/// Envelope failures are the only case reported through the HTTP status;
/// everything past the transport is reported inside the response envelope.
async fn handle_rpc(
    State(dispatcher): State<Arc<RpcDispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !headers.contains_key(header::CONTENT_LENGTH) {
        return (StatusCode::LENGTH_REQUIRED, "Content-Length required").into_response();
    }

    let user = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok());
    match dispatcher.handle_envelope(&body, user).await {
        Ok(envelope) => (StatusCode::OK, ENVELOPE_RESPONSE_HEADERS, envelope).into_response(),
        Err(e) => {
            warn!("Rejected envelope: {}", e);
            (StatusCode::BAD_REQUEST, "invalid envelope").into_response()
        }
    }
}
