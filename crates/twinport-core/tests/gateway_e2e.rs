//! End-to-end tests: HTTP client → gateway → loopback RPC → handler.
//!
//! Each test builds the same lifecycle the server binary builds, with both
//! listeners on ephemeral ports.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twinport::api::greeter::{
    self, SayHelloRequest, SayHelloResponse, SayHiRequest, SayHiResponse, TestServices,
};
use twinport::rpc::{CallContext, HandlerRegistry};
use twinport::{
    GatewayServer, HttpTimeouts, JsonCodec, Lifecycle, RouteTable, RpcServer, RpcStatus, Settings,
};

/// Greeter that counts the calls it serves.
#[derive(Default)]
struct CountingGreeter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl TestServices for CountingGreeter {
    async fn say_hello(
        &self,
        _ctx: CallContext,
        request: SayHelloRequest,
    ) -> Result<SayHelloResponse, RpcStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SayHelloResponse {
            msg: format!("Hello {}!!", request.name),
        })
    }

    async fn say_hi(
        &self,
        _ctx: CallContext,
        request: SayHiRequest,
    ) -> Result<SayHiResponse, RpcStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SayHiResponse {
            msg: format!("Hi {}!!", request.name),
        })
    }
}

struct Stack {
    lifecycle: Lifecycle,
    rpc: Arc<RpcServer>,
    gateway: Arc<GatewayServer>,
    greeter: Arc<CountingGreeter>,
}

impl Stack {
    fn base_url(&self) -> String {
        let addr = self.gateway.local_addr().expect("gateway not running");
        format!("http://{}", addr)
    }

    async fn shutdown(mut self) {
        let report = self.lifecycle.shutdown_all(Duration::from_secs(5)).await;
        assert!(report.is_clean(), "unclean shutdown: {:?}", report.failures);
    }
}

async fn start_stack(timeouts: HttpTimeouts) -> Stack {
    let settings = Settings::for_host("127.0.0.1", 0, 0).unwrap();
    let greeter = Arc::new(CountingGreeter::default());

    let mut registry = HandlerRegistry::new();
    greeter::register_test_services(&mut registry, greeter.clone());
    let rpc = Arc::new(RpcServer::new(settings.rpc_addr, registry));

    let routes = RouteTable::from_service(&greeter::service_definition()).unwrap();
    let gateway = Arc::new(GatewayServer::new(
        settings.http_addr,
        routes,
        JsonCodec::default(),
        timeouts,
    ));

    let mut lifecycle = Lifecycle::new();
    let (rpc_start, rpc_stop) = (rpc.clone(), rpc.clone());
    lifecycle.register(
        "rpc-server",
        move || async move { rpc_start.start().await.map(|_| ()) },
        move |deadline| async move {
            rpc_stop
                .stop(deadline.saturating_duration_since(tokio::time::Instant::now()))
                .await
        },
    );
    let (gw_start, gw_stop, upstream_rpc) = (gateway.clone(), gateway.clone(), rpc.clone());
    lifecycle.register(
        "gateway-server",
        move || async move {
            let upstream = upstream_rpc.local_addr().expect("rpc server started first");
            gw_start.start(Settings::loopback_target(upstream)).await.map(|_| ())
        },
        move |deadline| async move { gw_stop.stop(deadline).await },
    );

    lifecycle.run_all().await.unwrap();
    Stack {
        lifecycle,
        rpc,
        gateway,
        greeter,
    }
}

#[tokio::test]
async fn test_say_hello_over_http() {
    let stack = start_stack(HttpTimeouts::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/sayhello", stack.base_url()))
        .json(&json!({"name": "Ada"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"msg": "Hello Ada!!"}));
    assert_eq!(stack.greeter.calls.load(Ordering::SeqCst), 1);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_is_404_without_rpc_call() {
    let stack = start_stack(HttpTimeouts::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/unknown", stack.base_url()))
        .json(&json!({"name": "Ada"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], 5);
    assert_eq!(stack.greeter.calls.load(Ordering::SeqCst), 0);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_rpc_server_down_is_5xx_within_deadline() {
    let stack = start_stack(HttpTimeouts {
        write: Duration::from_secs(2),
        ..HttpTimeouts::default()
    })
    .await;

    stack.rpc.stop(Duration::from_secs(1)).await.unwrap();

    let started = std::time::Instant::now();
    let response = reqwest::Client::new()
        .post(format!("{}/v1/sayhello", stack.base_url()))
        .json(&json!({"name": "Ada"}))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(response.status().is_server_error(), "got {}", response.status());

    let body: Value = response.json().await.unwrap();
    let message = body["message"].as_str().unwrap_or_default();
    assert!(!message.is_empty());

    stack.shutdown().await;
}

#[tokio::test]
async fn test_gateway_starts_before_rpc_server_is_reachable() {
    // Reserve a port, then free it so nothing listens there.
    let upstream: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = GatewayServer::new(
        "127.0.0.1:0".parse().unwrap(),
        RouteTable::from_service(&greeter::service_definition()).unwrap(),
        JsonCodec::default(),
        HttpTimeouts::default(),
    );
    let addr = gateway.start(upstream).await.unwrap();

    let response = reqwest::get(format!("http://{}/v1/sayhi/Ada", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // Bring the RPC server up on that port; the next request dials it.
    let mut registry = HandlerRegistry::new();
    greeter::register_test_services(&mut registry, Arc::new(CountingGreeter::default()));
    let rpc = RpcServer::new(upstream, registry);
    rpc.start().await.unwrap();

    let body: Value = reqwest::get(format!("http://{}/v1/sayhi/Ada", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"msg": "Hi Ada!!"}));

    gateway
        .stop(tokio::time::Instant::now() + Duration::from_secs(2))
        .await
        .unwrap();
    rpc.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_cors_preflight() {
    let stack = start_stack(HttpTimeouts::default()).await;

    let response = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/v1/sayhello", stack.base_url()),
        )
        .header("Origin", "http://example.com")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "http://example.com"
    );
    assert_eq!(
        headers.get("access-control-allow-headers").unwrap(),
        "Content-Type,Accept"
    );
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET,HEAD,POST,PUT,DELETE"
    );
    assert!(response.text().await.unwrap().is_empty());
    assert_eq!(stack.greeter.calls.load(Ordering::SeqCst), 0);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_native_and_http_clients_get_the_same_answer() {
    let stack = start_stack(HttpTimeouts::default()).await;

    let rpc_addr = Settings::loopback_target(stack.rpc.local_addr().unwrap());
    let client = twinport::RpcClient::connect(rpc_addr).await.unwrap();
    let native: SayHiResponse = client
        .call_typed(
            greeter::SAY_HI,
            &SayHiRequest {
                name: "Linus".into(),
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let http: Value = reqwest::Client::new()
        .post(format!("{}/v1/sayhi", stack.base_url()))
        .json(&json!({"name": "Linus"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(http["msg"], native.msg);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_both_listeners() {
    let stack = start_stack(HttpTimeouts::default()).await;
    let rpc = stack.rpc.clone();
    let gateway = stack.gateway.clone();
    let http_addr = gateway.local_addr().unwrap();

    stack.shutdown().await;

    assert!(!rpc.is_running());
    assert!(!gateway.is_running());
    assert!(tokio::net::TcpStream::connect(http_addr).await.is_err());
}
