//! # Idol Relay
//!
//! Local emulation backend for a mobile rhythm-game client. Lets an
//! unmodified client run against this process instead of the vendor service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        IDOL RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/        - Client-facing listeners                   │
//! │  ├── dns.rs      - Intercepting DNS redirector (UDP)         │
//! │  ├── gateway.rs  - TLS reverse proxy to the RPC server       │
//! │  └── tls.rs      - PEM -> rustls acceptor                    │
//! │                                                              │
//! │  transport/      - Encrypted RPC envelope                    │
//! │  └── envelope.rs - AES-256-CBC + gzip + base64url codec      │
//! │                                                              │
//! │  rpc/            - Internal RPC endpoint                     │
//! │  ├── protocol.rs - Request / response / error codes          │
//! │  ├── dispatcher.rs - Method table and envelope handling      │
//! │  └── server.rs   - axum router on a plain-HTTP listener      │
//! │                                                              │
//! │  session/        - Login-time state engine                   │
//! │  ├── vitality.rs - Lazy vitality recompute                   │
//! │  ├── calendar.rs - Server-timezone day / ISO-week boundaries │
//! │  ├── reset.rs    - Daily / weekly reset procedures           │
//! │  ├── engine.rs   - One transaction per login                 │
//! │  └── store.rs    - Game-state store interface (+ memory.rs)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Path
//!
//! ```text
//! client ─DNS─> redirector (game hosts -> this machine)
//! client ─HTTPS─> gateway ─HTTP─> rpc server ─> dispatcher ─> engine ─> store
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod network;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError};
pub use network::{DnsRedirector, TlsGateway};
pub use rpc::{RpcDispatcher, RpcServer};
pub use session::{MemoryStore, SessionResetEngine, UserId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
