//! RPC Layer
//!
//! Internal plain-HTTP endpoint behind the TLS gateway. Every request body is
//! an encrypted envelope holding a `{method, params, id}` document.

pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use dispatcher::{RpcContext, RpcDispatcher, RpcHandler, USER_ID_HEADER};
pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use server::{RpcServer, RpcServerConfig, RpcServerError};
