//! The `api.TestServices` greeter service: messages, HTTP annotations and
//! server registration.
//!
//! Handler bodies live with whoever implements [`TestServices`]; this module
//! only fixes the schema both protocols agree on.

use crate::rpc::{unary, CallContext, HandlerRegistry, RpcStatus};
use crate::service::{HttpRule, ServiceDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SERVICE_NAME: &str = "api.TestServices";
pub const SAY_HELLO: &str = "/api.TestServices/SayHello";
pub const SAY_HI: &str = "/api.TestServices/SayHi";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SayHelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SayHelloResponse {
    #[prost(string, tag = "1")]
    pub msg: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SayHiRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SayHiResponse {
    #[prost(string, tag = "1")]
    pub msg: String,
}

/// Schema and routes of `api.TestServices`.
///
/// | procedure | HTTP |
/// |---|---|
/// | SayHello | `POST /v1/sayhello` (body `*`) |
/// | SayHi | `POST /v1/sayhi` (body `*`), `GET /v1/sayhi/{name}` |
pub fn service_definition() -> ServiceDefinition {
    ServiceDefinition::new(SERVICE_NAME)
        .procedure::<SayHelloRequest, SayHelloResponse>(
            "SayHello",
            vec![HttpRule::post("/v1/sayhello")],
        )
        .procedure::<SayHiRequest, SayHiResponse>(
            "SayHi",
            vec![HttpRule::post("/v1/sayhi"), HttpRule::get("/v1/sayhi/{name}")],
        )
}

/// Server side of `api.TestServices`.
///
/// Every method defaults to `Unimplemented`, so implementors only write the
/// procedures they serve.
#[async_trait::async_trait]
pub trait TestServices: Send + Sync + 'static {
    async fn say_hello(
        &self,
        _ctx: CallContext,
        _request: SayHelloRequest,
    ) -> Result<SayHelloResponse, RpcStatus> {
        Err(RpcStatus::unimplemented("method SayHello not implemented"))
    }

    async fn say_hi(
        &self,
        _ctx: CallContext,
        _request: SayHiRequest,
    ) -> Result<SayHiResponse, RpcStatus> {
        Err(RpcStatus::unimplemented("method SayHi not implemented"))
    }
}

/// Register every `api.TestServices` procedure of `service` in `registry`.
pub fn register_test_services<S: TestServices>(registry: &mut HandlerRegistry, service: Arc<S>) {
    let hello = service.clone();
    registry.register(
        SAY_HELLO,
        unary(move |ctx, request: SayHelloRequest| {
            let service = hello.clone();
            async move { service.say_hello(ctx, request).await }
        }),
    );

    registry.register(
        SAY_HI,
        unary(move |ctx, request: SayHiRequest| {
            let service = service.clone();
            async move { service.say_hi(ctx, request).await }
        }),
    );
}
