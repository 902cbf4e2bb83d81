//! Encrypted RPC Transport
//!
//! Stateless codec for the client's wire envelope:
//!
//! ```text
//! request:  base64url( AES-256-CBC( [0u8; 16] ++ json ) )
//! response: base64url( AES-256-CBC( [0u8; 16] ++ gzip(json) ) )
//! ```
//!
//! The key and IV are fixed by the client build and are not a security boundary.

pub mod envelope;

pub use envelope::{decode, encode, TransportError, ENVELOPE_IV, ENVELOPE_KEY, HEADER_LEN};
