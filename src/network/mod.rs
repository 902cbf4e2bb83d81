//! Network Layer
//!
//! The two listeners that bind an unmodified client to this process:
//! the DNS redirector and the TLS gateway.

pub mod dns;
pub mod gateway;
pub mod tls;

pub use dns::{DnsConfig, DnsError, DnsRedirector, HostOverride};
pub use gateway::{GatewayConfig, GatewayError, TlsGateway, UpstreamError};
pub use tls::{load_tls_acceptor, TlsError};
