//! DNS Redirector
//!
//! UDP resolver that answers the game's service hosts with a local address
//! and forwards every other query to a real upstream resolver untouched.
//!
//! ```text
//! query ─┬─ first question is an intercepted host ─> local answer (A / AAAA / empty)
//!        └─ anything else ─> upstream (fresh socket) ─> reply bytes as received
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Header, Message, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};

/// Largest UDP payload accepted (EDNS maximum).
const MAX_UDP_PAYLOAD: usize = 65535;

/// Size of the fixed DNS header.
const HEADER_LEN: usize = 12;

/// DNS errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message could not be encoded or decoded.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// Upstream did not answer in time.
    #[error("Upstream timed out")]
    UpstreamTimeout,
}

/// A host answered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOverride {
    /// Host name, without trailing dot.
    pub host: String,
    /// Address returned for `A` queries.
    pub ipv4: Ipv4Addr,
    /// Address returned for `AAAA` queries. `None` answers with no records.
    pub ipv6: Option<Ipv6Addr>,
}

impl HostOverride {
    /// IPv4-only override.
    pub fn new(host: impl Into<String>, ipv4: Ipv4Addr) -> Self {
        Self {
            host: normalize(&host.into()).to_string(),
            ipv4,
            ipv6: None,
        }
    }

    /// Also answer `AAAA` queries.
    pub fn with_ipv6(mut self, ipv6: Ipv6Addr) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }

    fn matches(&self, name: &str) -> bool {
        normalize(name).eq_ignore_ascii_case(&self.host)
    }
}

fn normalize(name: &str) -> &str {
    name.trim_end_matches('.')
}

/// Redirector configuration.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// UDP bind address.
    pub bind_addr: SocketAddr,
    /// Upstream resolver.
    pub upstream: SocketAddr,
    /// Intercepted hosts.
    pub overrides: Vec<HostOverride>,
    /// TTL on local answers.
    pub ttl: Duration,
    /// Deadline for an upstream reply.
    pub upstream_timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 53)),
            upstream: SocketAddr::from(([8, 8, 8, 8], 53)),
            overrides: Vec::new(),
            ttl: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(5),
        }
    }
}

impl DnsConfig {
    /// Override for `name`, if it is intercepted.
    pub fn lookup(&self, name: &str) -> Option<&HostOverride> {
        self.overrides.iter().find(|o| o.matches(name))
    }

    fn ttl_secs(&self) -> u32 {
        u32::try_from(self.ttl.as_secs()).unwrap_or(u32::MAX)
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The DNS redirector.
pub struct DnsRedirector {
    config: Arc<DnsConfig>,
    socket: Arc<UdpSocket>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DnsRedirector {
    /// Bind the UDP socket.
    pub async fn bind(config: DnsConfig) -> Result<Self, DnsError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            socket: Arc::new(socket),
            shutdown_tx,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until shutdown. Each query runs in its own task.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), DnsError> {
        info!(
            "DNS redirector listening on {} ({} intercepted hosts, upstream {})",
            self.local_addr()?,
            self.config.overrides.len(),
            self.config.upstream
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((n, peer)) => {
                            trace!("DNS received {} bytes from {}", n, peer);
                            let packet = buffer[..n].to_vec();
                            let config = self.config.clone();
                            let socket = self.socket.clone();

                            tokio::spawn(async move {
                                let Some(reply) = resolve(&config, &packet).await else {
                                    return;
                                };
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    debug!("DNS send error to {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("DNS recv error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("DNS redirector shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop the receive loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

// =============================================================================
// QUERY HANDLING
// =============================================================================

/// Reply bytes for one query packet, or `None` when it is dropped.
pub async fn resolve(config: &DnsConfig, packet: &[u8]) -> Option<Vec<u8>> {
    let request = match Message::from_vec(packet) {
        Ok(m) => m,
        Err(e) => {
            debug!("Unparseable DNS query: {}", e);
            return format_error(packet);
        }
    };

    let intercepted = request
        .queries()
        .first()
        .and_then(|q| config.lookup(&q.name().to_ascii()));

    let reply = match intercepted {
        Some(host) => {
            debug!("Intercepted {} -> {}", host.host, host.ipv4);
            local_answer(&request, host, config.ttl_secs()).to_vec()
        }
        None => match forward(config.upstream, packet, config.upstream_timeout).await {
            Ok(bytes) => return Some(bytes),
            Err(e) => {
                warn!("Upstream query failed: {}", e);
                server_failure(&request).to_vec()
            }
        },
    };

    match reply {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("DNS response encode error: {}", e);
            server_failure(&request).to_vec().ok()
        }
    }
}

/// Local answer for an intercepted host, echoing the request's questions.
pub fn local_answer(request: &Message, host: &HostOverride, ttl: u32) -> Message {
    let mut header = Header::response_from_request(request.header());
    header.set_recursion_available(true);

    let mut response = Message::new();
    response.set_header(header);
    response.add_queries(request.queries().iter().cloned());

    if let Some(query) = request.queries().first() {
        let rdata = match query.query_type() {
            RecordType::A => Some(RData::A(A(host.ipv4))),
            RecordType::AAAA => host.ipv6.map(|ip| RData::AAAA(AAAA(ip))),
            _ => None,
        };

        if let Some(rdata) = rdata {
            let mut record = Record::from_rdata(query.name().clone(), ttl, rdata);
            record.set_dns_class(query.query_class());
            response.add_answer(record);
        }
    }

    response
}

/// SERVFAIL carrying the request's id and questions.
fn server_failure(request: &Message) -> Message {
    let mut response = Message::error_msg(request.id(), request.op_code(), ResponseCode::ServFail);
    response.set_recursion_desired(request.recursion_desired());
    response.add_queries(request.queries().iter().cloned());
    response
}

/// FORMERR for a packet whose header is readable, otherwise nothing.
fn format_error(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    Message::error_msg(id, OpCode::Query, ResponseCode::FormErr).to_vec().ok()
}

/// Send `packet` to `upstream` from a fresh ephemeral socket and return the
/// first reply as received.
pub async fn forward(upstream: SocketAddr, packet: &[u8], deadline: Duration) -> Result<Vec<u8>, DnsError> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];
    let n = timeout(deadline, socket.recv(&mut buffer))
        .await
        .map_err(|_| DnsError::UpstreamTimeout)??;
    buffer.truncate(n);
    Ok(buffer)
}
