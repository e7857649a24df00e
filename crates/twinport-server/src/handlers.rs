//! Handler bodies for `api.TestServices`.

use async_trait::async_trait;
use twinport::api::greeter::{
    SayHelloRequest, SayHelloResponse, SayHiRequest, SayHiResponse, TestServices,
};
use twinport::rpc::CallContext;
use twinport::RpcStatus;
use tracing::info;

/// Greets whoever calls.
#[derive(Debug, Default)]
pub struct GreeterServer;

#[async_trait]
impl TestServices for GreeterServer {
    async fn say_hello(
        &self,
        _ctx: CallContext,
        request: SayHelloRequest,
    ) -> Result<SayHelloResponse, RpcStatus> {
        info!("SayHello request from {:?}", request.name);
        Ok(SayHelloResponse {
            msg: format!("Hello {}!!", request.name),
        })
    }

    async fn say_hi(
        &self,
        _ctx: CallContext,
        request: SayHiRequest,
    ) -> Result<SayHiResponse, RpcStatus> {
        info!("SayHi request from {:?}", request.name);
        Ok(SayHiResponse {
            msg: format!("Hi {}!!", request.name),
        })
    }
}
