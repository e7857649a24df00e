//! Procedure handlers and the registry the RPC server dispatches to.

use super::status::RpcStatus;
use crate::codec::{decode_binary, encode_binary};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to a handler.
///
/// Owned by the task serving the call. The token is cancelled when the
/// deadline passes or the server is forced down.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(method: impl Into<String>, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            method: method.into(),
            deadline,
            cancel,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves once the call has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// A type-erased procedure: protobuf bytes in, protobuf bytes out.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, payload: Vec<u8>) -> Result<Vec<u8>, RpcStatus>;
}

/// Adapts a typed async function into an [`RpcHandler`].
struct UnaryHandler<Req, Resp, F> {
    func: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait::async_trait]
impl<Req, Resp, F, Fut> RpcHandler for UnaryHandler<Req, Resp, F>
where
    Req: prost::Message + Default + 'static,
    Resp: prost::Message + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcStatus>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, payload: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
        let request: Req = decode_binary(&payload).map_err(|e| {
            RpcStatus::invalid_argument(format!("failed to decode {} request: {}", ctx.method(), e))
        })?;
        let response = (self.func)(ctx, request).await?;
        Ok(encode_binary(&response))
    }
}

/// Wrap a typed unary function as a handler.
pub fn unary<Req, Resp, F, Fut>(func: F) -> Arc<dyn RpcHandler>
where
    Req: prost::Message + Default + 'static,
    Resp: prost::Message + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcStatus>> + Send + 'static,
{
    Arc::new(UnaryHandler {
        func,
        _types: PhantomData,
    })
}

/// Procedure name → handler. Built before the server starts, read-only after.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a fully qualified procedure name.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) -> &mut Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&str> = self.methods().collect();
        methods.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("methods", &methods)
            .finish()
    }
}
