//! RPC Dispatcher
//!
//! Routes decoded requests to registered method handlers and wraps the
//! outcome into a response envelope.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::rpc::protocol::{RpcError, RpcRequest, RpcResponse};
use crate::session::UserId;
use crate::transport::{self, TransportError};

/// Header carrying the caller identity. Trusted as-is (local use only).
pub const USER_ID_HEADER: &str = "X-Application-User-Id";

/// Per-call context handed to every handler.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    /// Parsed caller id, if the header was present and numeric.
    pub user_id: Option<UserId>,
    /// Raw header value as sent by the client.
    pub raw_user_id: Option<String>,
}

impl RpcContext {
    /// Build a context from the raw identity header.
    pub fn from_header(value: Option<&str>) -> Self {
        let raw_user_id = value.map(|v| v.trim().to_string());
        let user_id = raw_user_id.as_deref().and_then(|v| v.parse().ok()).map(UserId);
        Self { user_id, raw_user_id }
    }

    /// Caller id, or an `InvalidParams` error when it is missing.
    pub fn require_user(&self) -> Result<UserId, RpcError> {
        self.user_id.ok_or_else(|| match &self.raw_user_id {
            Some(raw) => RpcError::InvalidParams(format!("malformed {}: {:?}", USER_ID_HEADER, raw)),
            None => RpcError::InvalidParams(format!("missing {}", USER_ID_HEADER)),
        })
    }
}

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// A registered RPC method.
pub trait RpcHandler: Send + Sync + 'static {
    /// Run the method.
    fn call(&self, params: Value, ctx: RpcContext) -> HandlerFuture;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(Value, RpcContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn call(&self, params: Value, ctx: RpcContext) -> HandlerFuture {
        Box::pin(self(params, ctx))
    }
}

/// Method registration table plus envelope handling.
#[derive(Clone, Default)]
pub struct RpcDispatcher {
    methods: BTreeMap<String, Arc<dyn RpcHandler>>,
}

impl RpcDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an exact method name. Replaces any earlier one.
    pub fn register(&mut self, method: impl Into<String>, handler: impl RpcHandler) {
        let method = method.into();
        if self.methods.insert(method.clone(), Arc::new(handler)).is_some() {
            warn!("RPC method {} re-registered", method);
        }
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Route one decoded request document and build the response document.
    pub async fn dispatch(&self, doc: Value, ctx: RpcContext) -> Value {
        let request = match RpcRequest::from_value(doc) {
            Ok(r) => r,
            Err((id, err)) => {
                debug!("Rejected malformed request: {}", err);
                return RpcResponse::failure(id, &err).to_value();
            }
        };

        let Some(handler) = self.methods.get(&request.method) else {
            debug!("Unknown method {}", request.method);
            let err = RpcError::MethodNotFound(request.method);
            return RpcResponse::failure(request.id, &err).to_value();
        };

        debug!("Dispatching {} for user {:?}", request.method, ctx.raw_user_id);

        let RpcRequest { method, params, id } = request;
        let outcome = AssertUnwindSafe(async move { handler.call(params, ctx).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => RpcResponse::success(id, result).to_value(),
            Ok(Err(err)) => {
                warn!("{} failed: {}", method, err);
                RpcResponse::failure(id, &err).to_value()
            }
            Err(_) => {
                error!("{} panicked", method);
                let err = RpcError::Handler("internal error".into());
                RpcResponse::failure(id, &err).to_value()
            }
        }
    }

    /// Decode a request envelope, dispatch it, and encode the response envelope.
    ///
    /// Transport errors are returned before any handler runs.
    pub async fn handle_envelope(
        &self,
        body: &[u8],
        user_header: Option<&str>,
    ) -> Result<String, TransportError> {
        let doc = transport::decode(body, false)?;

        #[cfg(feature = "debug-tracing")]
        tracing::trace!("RPC request document: {}", doc);

        let ctx = RpcContext::from_header(user_header);
        let response = self.dispatch(doc, ctx).await;
        transport::encode(&response, true)
    }
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{HANDLER_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
    use serde_json::json;

    fn echo_dispatcher() -> RpcDispatcher {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher.register("Test.Echo", |params: Value, ctx: RpcContext| async move {
            Ok::<_, RpcError>(json!({ "params": params, "user": ctx.raw_user_id }))
        });
        dispatcher.register("Test.Fail", |_params: Value, _ctx: RpcContext| async move {
            Err::<Value, _>(RpcError::Handler("boom".into()))
        });
        dispatcher.register("Test.Panic", |_params: Value, _ctx: RpcContext| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<Value, RpcError>(Value::Null)
        });
        dispatcher.register("Test.WhoAmI", |_params: Value, ctx: RpcContext| async move {
            let user = ctx.require_user()?;
            Ok::<_, RpcError>(json!(user.0))
        });
        dispatcher
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let dispatcher = echo_dispatcher();
        let ctx = RpcContext::from_header(Some("42"));

        let rsp = dispatcher
            .dispatch(json!({"method": "Test.Echo", "params": [1], "id": 9}), ctx)
            .await;

        assert_eq!(rsp["id"], json!(9));
        assert_eq!(rsp["result"]["params"], json!([1]));
        assert_eq!(rsp["result"]["user"], json!("42"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher
            .dispatch(json!({"method": "Nope.Missing", "id": 1}), RpcContext::default())
            .await;

        assert_eq!(rsp["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(rsp["id"], json!(1));
    }

    #[tokio::test]
    async fn test_method_lookup_is_exact() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher
            .dispatch(json!({"method": "test.echo", "id": 1}), RpcContext::default())
            .await;
        assert_eq!(rsp["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher
            .dispatch(json!({"method": "Test.Fail", "id": "x"}), RpcContext::default())
            .await;

        assert_eq!(rsp["error"]["code"], json!(HANDLER_ERROR));
        assert_eq!(rsp["error"]["message"], json!("boom"));
        assert_eq!(rsp["id"], json!("x"));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_object() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher
            .dispatch(json!({"method": "Test.Panic", "id": 3}), RpcContext::default())
            .await;

        assert_eq!(rsp["error"]["code"], json!(HANDLER_ERROR));
        assert_eq!(rsp["error"]["message"], json!("internal error"));
        assert_eq!(rsp["id"], json!(3));

        // The dispatcher stays usable afterwards
        let rsp = dispatcher
            .dispatch(json!({"method": "Test.Echo", "id": 4}), RpcContext::default())
            .await;
        assert!(rsp.get("result").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_malformed_request() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher.dispatch(json!({"method": 5, "id": 4}), RpcContext::default()).await;
        assert_eq!(rsp["error"]["code"], json!(INVALID_REQUEST));
        assert_eq!(rsp["id"], json!(4));
    }

    #[tokio::test]
    async fn test_missing_user_header() {
        let dispatcher = echo_dispatcher();
        let rsp = dispatcher
            .dispatch(json!({"method": "Test.WhoAmI", "id": 1}), RpcContext::from_header(None))
            .await;
        assert_eq!(rsp["error"]["code"], json!(INVALID_PARAMS));

        let rsp = dispatcher
            .dispatch(json!({"method": "Test.WhoAmI", "id": 1}), RpcContext::from_header(Some("abc")))
            .await;
        assert_eq!(rsp["error"]["code"], json!(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_handle_envelope_roundtrip() {
        let dispatcher = echo_dispatcher();
        let request = transport::encode(&json!({"method": "Test.WhoAmI", "id": 5}), false).unwrap();

        let envelope = dispatcher
            .handle_envelope(request.as_bytes(), Some("1001"))
            .await
            .unwrap();

        let rsp = transport::decode(envelope.as_bytes(), true).unwrap();
        assert_eq!(rsp, json!({"id": 5, "result": 1001}));
    }

    #[tokio::test]
    async fn test_handle_envelope_rejects_bad_transport() {
        let dispatcher = echo_dispatcher();
        let result = dispatcher.handle_envelope(b"%%%", Some("1")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_registration_table() {
        let dispatcher = echo_dispatcher();
        assert!(dispatcher.has_method("Test.Echo"));
        assert!(!dispatcher.has_method("Test.Other"));
        assert_eq!(dispatcher.methods().count(), 4);
    }
}
