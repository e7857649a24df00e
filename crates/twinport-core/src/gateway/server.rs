//! HTTP/JSON gateway.
//!
//! Every request on a bound route is transcoded into a binary RPC call,
//! forwarded over one shared loopback [`RpcClient`], and the reply is written
//! back as JSON.
//!
//! # Connection handling
//!
//! Connections are served by hyper directly so the gateway can drain them:
//! on [`GatewayServer::stop`] each connection finishes its in-flight request
//! and closes, and connections still open at the deadline are dropped.
//! Keep-alive connections with no request activity for the idle timeout are
//! closed the same graceful way.

use super::cors;
use super::routes::RouteTable;
use crate::codec::JsonCodec;
use crate::config::{GatewayConfig, HttpTimeouts, RpcConfig};
use crate::rpc::RpcClient;
use crate::service::BodyRule;
use crate::{Result, TwinportError};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// State shared by every request handler.
#[derive(Clone)]
struct GatewayState {
    routes: Arc<RouteTable>,
    codec: JsonCodec,
    client: Arc<RpcClient>,
    call_timeout: Duration,
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
    tracker: TaskTracker,
    force: CancellationToken,
}

/// HTTP/JSON front end for an [`crate::rpc::RpcServer`].
pub struct GatewayServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteTable>,
    codec: JsonCodec,
    timeouts: HttpTimeouts,
    running: Mutex<Option<Running>>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: RouteTable,
        codec: JsonCodec,
        timeouts: HttpTimeouts,
    ) -> Self {
        Self {
            bind_addr,
            routes: Arc::new(routes),
            codec,
            timeouts,
            running: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.addr)
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Bind the HTTP listener and start forwarding to the RPC server at
    /// `upstream`.
    ///
    /// The loopback connection is dialed here, but an unreachable upstream
    /// does not fail startup: each request then redials under its own
    /// deadline.
    pub async fn start(&self, upstream: SocketAddr) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| TwinportError::Bind {
                protocol: "http",
                addr: self.bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let client = Arc::new(RpcClient::new(upstream));
        match client.ensure_connected().await {
            Ok(()) => debug!("Gateway connected to RPC server at {}", upstream),
            Err(e) => warn!(
                "RPC server at {} is not reachable yet ({}), will dial per request",
                upstream, e.message
            ),
        }

        let state = GatewayState {
            routes: self.routes.clone(),
            codec: self.codec,
            client,
            call_timeout: self.timeouts.write,
        };
        let app = build_router(state, self.timeouts);

        info!(
            "Gateway server listening on {} ({} routes, upstream {})",
            addr,
            self.routes.len(),
            upstream
        );
        for binding in self.routes.bindings() {
            debug!(
                "Route {} {} -> {}",
                binding.method,
                binding.template.as_str(),
                binding.procedure
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = TaskTracker::new();
        let force = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            app,
            self.timeouts.idle,
            shutdown_rx,
            tracker.clone(),
            force.clone(),
        ));

        *self.lock_running() = Some(Running {
            addr,
            shutdown_tx,
            accept_task,
            tracker,
            force,
        });

        Ok(addr)
    }

    /// Stop accepting and let open connections finish until `deadline`, then
    /// force-close the rest.
    ///
    /// Returns `ShutdownTimeout` when connections had to be dropped. Stopping
    /// a gateway that is not running is a no-op.
    pub async fn stop(&self, deadline: Instant) -> Result<()> {
        let Some(running) = self.lock_running().take() else {
            debug!("Gateway stop requested while not running");
            return Ok(());
        };
        let budget = deadline.saturating_duration_since(Instant::now());

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.accept_task.await {
            warn!("Gateway accept loop ended abnormally: {}", e);
        }
        running.tracker.close();

        if tokio::time::timeout_at(deadline, running.tracker.wait())
            .await
            .is_ok()
        {
            info!("Gateway server on {} stopped", running.addr);
            return Ok(());
        }

        warn!(
            "Gateway on {} still had {} connections at the deadline, closing them",
            running.addr,
            running.tracker.len()
        );
        running.force.cancel();
        running.tracker.wait().await;

        Err(TwinportError::ShutdownTimeout {
            component: "gateway server".to_string(),
            timeout: budget,
        })
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_router(state: GatewayState, timeouts: HttpTimeouts) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .fallback(handle_forward)
        .with_state(state)
        .layer(RequestBodyTimeoutLayer::new(timeouts.read))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors::allow_cors))
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_forward(State(state): State<GatewayState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match forward(&state, request).await {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            match &e {
                TwinportError::RouteNotFound { .. } => debug!("{}", e),
                TwinportError::RequestDecode { .. } => debug!("{} {}: {}", method, path, e),
                _ => warn!("{} {} failed: {}", method, path, e),
            }
            error_response(&e)
        }
    }
}

/// Resolve, transcode, call and render one request.
async fn forward(state: &GatewayState, request: Request) -> Result<Vec<u8>> {
    let (parts, body) = request.into_parts();
    let route = state.routes.resolve(&parts.method, parts.uri.path())?;
    let binding = route.binding;

    // Query parameters only feed routes without a body; path captures are
    // applied last so they win over anything else.
    let mut params: Vec<(String, String)> = Vec::new();
    if binding.body == BodyRule::Empty {
        if let Some(query) = parts.uri.query() {
            params.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
        }
    }
    params.extend(route.captures);

    let body = match binding.body {
        BodyRule::Whole => Some(
            axum::body::to_bytes(body, RpcConfig::MAX_FRAME_SIZE)
                .await
                .map_err(|e| TwinportError::decode(format!("failed to read request body: {}", e)))?,
        ),
        BodyRule::Empty => None,
    };

    let payload = binding
        .transcoder
        .request_from_http(&state.codec, body.as_deref(), &params)?;

    debug!("Forwarding to {}", binding.procedure);
    let reply = state
        .client
        .call(&binding.procedure, payload, state.call_timeout)
        .await?;

    binding.transcoder.response_to_json(&state.codec, &reply)
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Error body in the `{"code", "message", "details"}` shape.
fn error_response(err: &TwinportError) -> Response {
    let body = json!({
        "code": err.rpc_code().as_i32(),
        "message": err.client_message(),
        "details": [],
    });
    json_response(err.to_http_status(), body.to_string().into_bytes())
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    tracker: TaskTracker,
    force: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Gateway no longer accepting connections");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let app = app.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        let force = force.clone();
                        tracker.spawn(async move {
                            debug!("HTTP connection from {}", peer_addr);
                            serve_connection(stream, app, idle_timeout, shutdown_rx, force).await;
                        });
                    }
                    Err(e) => {
                        error!("HTTP accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// Request activity on one connection, for idle detection.
struct Activity {
    in_flight: AtomicUsize,
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last: Mutex::new(Instant::now()),
        }
    }

    fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            activity: self.clone(),
        }
    }

    fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.touch();
        self.activity.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection(
    stream: TcpStream,
    app: Router,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    force: CancellationToken,
) {
    let activity = Arc::new(Activity::new());
    let tracked = activity.clone();
    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        let app = app.clone();
        let guard = tracked.begin();
        async move {
            let response = app.oneshot(request).await;
            drop(guard);
            response
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut idle_check = tokio::time::interval(GatewayConfig::IDLE_CHECK_INTERVAL);
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("HTTP connection ended with error: {}", e);
                }
                break;
            }
            _ = shutdown_rx.changed(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = idle_check.tick(), if !closing => {
                if activity.idle_for() >= idle_timeout {
                    debug!("Closing HTTP connection idle for {:?}", idle_timeout);
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
            _ = force.cancelled() => {
                debug!("Force-closing HTTP connection");
                break;
            }
        }
    }
}
