//! TLS Reverse-Proxy Gateway
//!
//! Terminates the client's HTTPS connection and relays the single request
//! it carries to the internal RPC server.
//!
//! ```text
//! client --TLS--> [collect full request] --HTTP--> backend
//! client <--TLS-- [strip / close]        <-------  [collect full response]
//! ```
//!
//! The backend response is buffered completely before anything is written
//! back, so the client never sees a partial body.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::network::tls::TlsError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request headers that only apply to the client hop.
const HOP_BY_HOP_REQUEST: [&str; 6] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "TE",
    "Upgrade",
];

/// Backend response headers never relayed to the client.
const STRIPPED_RESPONSE: [&str; 5] = ["Server", "Date", "Connection", "Keep-Alive", "Transfer-Encoding"];

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Public HTTPS bind address.
    pub bind_addr: SocketAddr,
    /// Internal RPC server address.
    pub backend_addr: SocketAddr,
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
    /// TLS handshake deadline.
    pub handshake_timeout: Duration,
    /// Backend connect deadline.
    pub connect_timeout: Duration,
    /// Deadline for reading the client's request head and body.
    pub read_timeout: Duration,
    /// Deadline for the whole backend exchange.
    pub backend_timeout: Duration,
    /// Largest body accepted in either direction.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            backend_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            cert_path: PathBuf::from("certs/server.crt"),
            key_path: PathBuf::from("certs/server.key"),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            backend_timeout: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Gateway startup errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Certificate or key could not be loaded.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
}

/// Failure talking to the backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Backend refused or reset the connection.
    #[error("Backend connect failed: {0}")]
    Connect(std::io::Error),

    /// Backend did not accept within the connect deadline.
    #[error("Backend connect timed out")]
    ConnectTimeout,

    /// HTTP exchange failed before a response head arrived.
    #[error("Backend exchange failed: {0}")]
    Http(#[from] hyper::Error),

    /// Response body was cut short or exceeded the size cap.
    #[error("Backend response body: {0}")]
    Body(BoxError),

    /// The whole exchange exceeded its deadline.
    #[error("Backend exchange timed out")]
    Timeout,
}

impl UpstreamError {
    /// Whether the failure was a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::Timeout)
    }

    /// Status reported to the client.
    pub fn status(&self) -> StatusCode {
        if self.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::BAD_GATEWAY
        }
    }
}

/// The TLS gateway.
pub struct TlsGateway {
    config: Arc<GatewayConfig>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shutdown_tx: broadcast::Sender<()>,
}

impl TlsGateway {
    /// Bind with an already-built acceptor.
    pub async fn bind(config: GatewayConfig, acceptor: TlsAcceptor) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            listener,
            acceptor,
            shutdown_tx,
        })
    }

    /// Load the configured PEM files and bind.
    pub async fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let acceptor = crate::network::tls::load_tls_acceptor(&config.cert_path, &config.key_path)?;
        Self::bind(config, acceptor).await
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GatewayError> {
        info!(
            "TLS gateway listening on {} -> {}",
            self.local_addr()?,
            self.config.backend_addr
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("TLS gateway shutting down");
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

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        let config = self.config.clone();
        let span = tracing::info_span!("gateway_conn", id = %Uuid::new_v4(), peer = %addr);

        tokio::spawn(
            async move {
                let tls = match timeout(config.handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        debug!("TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake timed out");
                        return;
                    }
                };
                serve_connection(config, tls).await;
            }
            .instrument(span),
        );
    }
}

/// Serve one client connection: a single request, relayed, then close.
pub async fn serve_connection<S>(config: Arc<GatewayConfig>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(config.read_timeout)
        .keep_alive(false);

    let service = service_fn(move |req: Request<Incoming>| {
        let config = config.clone();
        async move { Ok::<_, Infallible>(relay(&config, req).await) }
    });

    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
        debug!("Client connection ended with error: {}", e);
    }
}

/// Turn one client request into the response the client gets.
pub async fn relay<B>(config: &GatewayConfig, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    if req.method() != Method::POST {
        let mut rsp = text(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
        rsp.headers_mut().insert(header::ALLOW, HeaderValue::from_static("POST"));
        return rsp;
    }
    // Chunked uploads would reach the backend without a length
    if req.headers().contains_key(header::TRANSFER_ENCODING)
        || !req.headers().contains_key(header::CONTENT_LENGTH)
    {
        return text(StatusCode::LENGTH_REQUIRED, "Content-Length required");
    }

    let (parts, body) = req.into_parts();
    let collected = timeout(config.read_timeout, Limited::new(body, config.max_body_bytes).collect()).await;
    let body = match collected {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) if e.is::<LengthLimitError>() => {
            return text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Ok(Err(e)) => {
            debug!("Bad client body: {}", e);
            return text(StatusCode::BAD_REQUEST, "malformed request");
        }
        Err(_) => return text(StatusCode::REQUEST_TIMEOUT, "request body timed out"),
    };

    debug!("{} {} ({} bytes)", parts.method, parts.uri, body.len());
    match forward(config, backend_request(parts, body)).await {
        Ok(rsp) => sanitize_response(rsp),
        Err(e) => {
            warn!("Upstream failure: {}", e);
            text(e.status(), "upstream unavailable")
        }
    }
}

/// Send `req` to the backend and collect its complete response.
pub async fn forward(
    config: &GatewayConfig,
    req: Request<Full<Bytes>>,
) -> Result<Response<Bytes>, UpstreamError> {
    let exchange = async {
        let stream = timeout(config.connect_timeout, TcpStream::connect(config.backend_addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout)?
            .map_err(UpstreamError::Connect)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let rsp = sender.send_request(req).await?;
        let (parts, body) = rsp.into_parts();
        let body = Limited::new(body, config.max_body_bytes)
            .collect()
            .await
            .map_err(UpstreamError::Body)?
            .to_bytes();

        Ok::<_, UpstreamError>(Response::from_parts(parts, body))
    };

    timeout(config.backend_timeout, exchange)
        .await
        .map_err(|_| UpstreamError::Timeout)?
}

/// Rebuild the client request for the backend hop.
fn backend_request(parts: http::request::Parts, body: Bytes) -> Request<Full<Bytes>> {
    let mut headers = parts.headers;
    for name in HOP_BY_HOP_REQUEST {
        headers.remove(name);
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let uri = parts
        .uri
        .path_and_query()
        .and_then(|pq| Uri::try_from(pq.as_str()).ok())
        .unwrap_or_else(|| Uri::from_static("/"));

    let mut req = Request::new(Full::new(body));
    *req.method_mut() = parts.method;
    *req.uri_mut() = uri;
    *req.headers_mut() = headers;
    req
}

/// Strip backend-identifying and hop-by-hop headers and force a close.
fn sanitize_response(rsp: Response<Bytes>) -> Response<Full<Bytes>> {
    let (mut parts, body) = rsp.into_parts();
    for name in STRIPPED_RESPONSE {
        parts.headers.remove(name);
    }
    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    parts.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    Response::from_parts(parts, Full::new(body))
}

fn text(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    rsp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::server::tests::exchange;
    use std::future::Future;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config(backend_addr: SocketAddr) -> GatewayConfig {
        GatewayConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            backend_addr,
            read_timeout: Duration::from_secs(2),
            backend_timeout: Duration::from_secs(3),
            ..GatewayConfig::default()
        }
    }

    /// One-shot backend running `handler` on the first connection.
    async fn backend<F, Fut>(handler: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handler(stream).await;
        });
        addr
    }

    /// Read one raw request (head plus Content-Length body) off a backend socket.
    async fn read_raw_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn client_request(body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/api")
            .header(header::HOST, "game.example")
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::CONNECTION, "keep-alive")
            .header("X-Application-User-Id", "7")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    fn spawn_gateway(config: GatewayConfig) -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_connection(Arc::new(config), server));
        client
    }

    /// Write raw bytes as the client and read until the gateway closes.
    async fn raw_exchange(config: GatewayConfig, raw: &[u8]) -> String {
        let mut client = spawn_gateway(config);
        client.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_response_buffered_until_complete() {
        let addr = backend(|mut stream| async move {
            let req = read_raw_request(&mut stream).await;
            let lower = req.to_lowercase();
            assert!(req.ends_with("envelope"));
            assert!(lower.contains("connection: close"));
            assert!(!lower.contains("keep-alive"));
            assert!(lower.contains("x-application-user-id: 7"));

            let head = "HTTP/1.1 200 OK\r\nServer: backend\r\nDate: now\r\nKeep-Alive: timeout=5\r\nX-Encryption: on\r\nContent-Length: 100\r\n\r\n";
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&[b'a'; 50]).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            stream.write_all(&[b'b'; 50]).await.unwrap();
        })
        .await;

        let client = spawn_gateway(config(addr));
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client))
            .await
            .unwrap();
        tokio::spawn(conn);

        let pending = sender.send_request(client_request(b"envelope"));
        tokio::pin!(pending);

        // Not even the head may reach the client while the body is incomplete
        let early = tokio::time::timeout(Duration::from_millis(150), &mut pending).await;
        assert!(early.is_err());

        let rsp = pending.await.unwrap();
        let (parts, body) = rsp.into_parts();
        let body = body.collect().await.unwrap().to_bytes();

        assert_eq!(parts.status, StatusCode::OK);
        assert_eq!(body.len(), 100);
        assert!(body[..50].iter().all(|b| *b == b'a'));
        assert!(body[50..].iter().all(|b| *b == b'b'));
        assert_eq!(parts.headers["x-encryption"], "on");
        assert_eq!(parts.headers[header::CONTENT_LENGTH], "100");
        assert_eq!(parts.headers[header::CONNECTION], "close");
        assert!(parts.headers.get(header::SERVER).is_none());
        assert!(parts.headers.get("keep-alive").is_none());
        assert_ne!(
            parts.headers.get(header::DATE).map(|v| v.as_bytes()),
            Some(&b"now"[..])
        );
    }

    #[tokio::test]
    async fn test_non_post_rejected() {
        let unused = SocketAddr::from(([127, 0, 0, 1], 9));
        let rsp = raw_exchange(config(unused), b"GET /api HTTP/1.1\r\nHost: game.example\r\n\r\n").await;

        assert!(rsp.starts_with("HTTP/1.1 405"));
        assert!(rsp.to_lowercase().contains("allow: post"));
    }

    #[tokio::test]
    async fn test_chunked_request_rejected() {
        let unused = SocketAddr::from(([127, 0, 0, 1], 9));
        let raw = b"POST /api HTTP/1.1\r\nHost: game.example\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nping\r\n0\r\n\r\n";

        let rsp = raw_exchange(config(unused), raw).await;
        assert!(rsp.starts_with("HTTP/1.1 411"));
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let unused = SocketAddr::from(([127, 0, 0, 1], 9));
        let cfg = GatewayConfig {
            max_body_bytes: 4,
            ..config(unused)
        };

        let rsp = exchange(spawn_gateway(cfg), client_request(b"far too long")).await;
        assert_eq!(rsp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_backend_refused_is_502() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let rsp = exchange(spawn_gateway(config(addr)), client_request(b"x")).await;
        assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_backend_early_eof_is_502() {
        let addr = backend(|mut stream| async move {
            let _ = read_raw_request(&mut stream).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
                .await;
        })
        .await;

        let rsp = exchange(spawn_gateway(config(addr)), client_request(b"x")).await;
        assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let addr = backend(|mut stream| async move {
            let _ = read_raw_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let cfg = GatewayConfig {
            backend_timeout: Duration::from_millis(300),
            ..config(addr)
        };
        let started = Instant::now();
        let rsp = exchange(spawn_gateway(cfg), client_request(b"x")).await;

        assert_eq!(rsp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backend_request_strips_hop_by_hop() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("https://game.example/api/call?x=1")
            .header("Connection", "keep-alive")
            .header("keep-alive", "timeout=5")
            .header("Transfer-Encoding", "chunked")
            .header("X-Application-User-Id", "3")
            .body(())
            .unwrap()
            .into_parts();

        let out = backend_request(parts, Bytes::from_static(b"abc"));
        assert_eq!(out.uri(), "/api/call?x=1");
        assert_eq!(out.headers()[header::CONNECTION], "close");
        assert_eq!(out.headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(out.headers()["x-application-user-id"], "3");
        assert!(out.headers().get("keep-alive").is_none());
        assert!(out.headers().get(header::TRANSFER_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_over_tls() {
        use rustls::pki_types::ServerName;
        use rustls::{ClientConfig, RootCertStore};
        use tokio_rustls::TlsConnector;

        let addr = backend(|mut stream| async move {
            let req = read_raw_request(&mut stream).await;
            assert!(req.ends_with("ping"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                .await
                .unwrap();
        })
        .await;

        let (cert_pem, key_pem) = crate::network::tls::tests::self_signed_pem();
        let acceptor = crate::network::tls::acceptor_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let gateway = Arc::new(TlsGateway::bind(config(addr), acceptor).await.unwrap());
        let gateway_addr = gateway.local_addr().unwrap();
        let runner = gateway.clone();
        let task = tokio::spawn(async move { runner.run().await });

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let client_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(gateway_addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(name, tcp).await.unwrap();

        let rsp = exchange(tls, client_request(b"ping")).await;
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.body().as_ref(), b"pong");

        gateway.shutdown();
        task.await.unwrap().unwrap();
    }
}
