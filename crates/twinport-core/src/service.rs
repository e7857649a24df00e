//! Service definitions: the schema side of a service.
//!
//! A [`ServiceDefinition`] lists each procedure's fully qualified name, its
//! HTTP annotations and a [`Transcoder`] that knows the procedure's message
//! types. The gateway derives its route table from it; the RPC server never
//! looks at it.

use crate::codec::{decode_binary, encode_binary, JsonCodec, RpcMessage};
use crate::rpc::RpcStatus;
use crate::{Result, TwinportError};
use axum::http::Method;
use std::marker::PhantomData;
use std::sync::Arc;

/// Where the request message comes from for an annotated route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRule {
    /// The whole JSON body is the request message (`body: "*"`).
    Whole,
    /// No body; the message is built from path and query parameters.
    Empty,
}

/// One HTTP annotation on a procedure.
#[derive(Debug, Clone)]
pub struct HttpRule {
    pub method: Method,
    /// Path template, e.g. `/v1/sayhi/{name}`.
    pub path: String,
    pub body: BodyRule,
}

impl HttpRule {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: BodyRule::Empty,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: BodyRule::Whole,
        }
    }
}

/// Converts between HTTP/JSON and the binary payloads of one procedure.
pub trait Transcoder: Send + Sync + 'static {
    /// Build the binary request payload from a JSON body and URL parameters.
    fn request_from_http(
        &self,
        codec: &JsonCodec,
        body: Option<&[u8]>,
        params: &[(String, String)],
    ) -> Result<Vec<u8>>;

    /// Render a binary response payload as JSON.
    fn response_to_json(&self, codec: &JsonCodec, payload: &[u8]) -> Result<Vec<u8>>;
}

/// [`Transcoder`] for a request/response message pair.
pub struct MessagePair<Req, Resp> {
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> MessagePair<Req, Resp>
where
    Req: RpcMessage,
    Resp: RpcMessage,
{
    pub fn shared() -> Arc<dyn Transcoder> {
        Arc::new(Self {
            _types: PhantomData,
        })
    }
}

impl<Req, Resp> Transcoder for MessagePair<Req, Resp>
where
    Req: RpcMessage,
    Resp: RpcMessage,
{
    fn request_from_http(
        &self,
        codec: &JsonCodec,
        body: Option<&[u8]>,
        params: &[(String, String)],
    ) -> Result<Vec<u8>> {
        let request: Req = codec.decode_with_params(body, params)?;
        Ok(encode_binary(&request))
    }

    fn response_to_json(&self, codec: &JsonCodec, payload: &[u8]) -> Result<Vec<u8>> {
        // A reply the gateway cannot decode is the server's fault, not the client's.
        let response: Resp = decode_binary(payload).map_err(|e| {
            TwinportError::Upstream(RpcStatus::internal(format!(
                "failed to decode response: {}",
                e
            )))
        })?;
        codec.encode(&response)
    }
}

/// One procedure of a service.
#[derive(Clone)]
pub struct ProcedureDescriptor {
    /// Fully qualified name, e.g. `/api.TestServices/SayHello`.
    pub name: String,
    pub http: Vec<HttpRule>,
    pub transcoder: Arc<dyn Transcoder>,
}

impl std::fmt::Debug for ProcedureDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureDescriptor")
            .field("name", &self.name)
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

/// The procedures of one service plus their HTTP annotations.
#[derive(Debug, Clone, Default)]
pub struct ServiceDefinition {
    pub name: String,
    pub procedures: Vec<ProcedureDescriptor>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedures: Vec::new(),
        }
    }

    /// Add a procedure with its message types and HTTP annotations.
    pub fn procedure<Req, Resp>(mut self, method: &str, http: Vec<HttpRule>) -> Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        self.procedures.push(ProcedureDescriptor {
            name: format!("/{}/{}", self.name, method),
            http,
            transcoder: MessagePair::<Req, Resp>::shared(),
        });
        self
    }

    /// Fully qualified name of `method` in this service.
    pub fn full_name(&self, method: &str) -> String {
        format!("/{}/{}", self.name, method)
    }
}
