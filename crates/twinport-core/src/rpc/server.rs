//! TCP server for the binary RPC protocol.
//!
//! Accepts connections and serves the procedures of a [`HandlerRegistry`].
//!
//! # Concurrency
//!
//! Each connection is handled in its own task, and every call read from a
//! connection is dispatched in a further task, so a slow call never holds up
//! the calls behind it. Replies funnel back through a per-connection writer
//! task. All connection and call tasks are tracked so that [`RpcServer::stop`]
//! can wait for them to drain.

use super::handler::{CallContext, HandlerRegistry};
use super::protocol::{read_frame, write_message, CallFrame, ReplyFrame};
use super::status::RpcStatus;
use crate::config::RpcConfig;
use crate::{Result, TwinportError};
use prost::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Replies buffered per connection before call tasks wait on the writer.
const REPLY_QUEUE_DEPTH: usize = 64;

struct Running {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
    tracker: TaskTracker,
    /// Tells connections to stop reading new calls.
    drain: CancellationToken,
    /// Cuts off calls still running after the grace period.
    force: CancellationToken,
}

/// Binary RPC server. Start and stop it any number of times; it serves the
/// same registry each time.
pub struct RpcServer {
    bind_addr: SocketAddr,
    registry: Arc<HandlerRegistry>,
    running: Mutex<Option<Running>>,
}

impl RpcServer {
    pub fn new(bind_addr: SocketAddr, registry: HandlerRegistry) -> Self {
        Self {
            bind_addr,
            registry: Arc::new(registry),
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

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns once the socket is bound; requests are served in the
    /// background. Starting an already running server returns its address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| TwinportError::Bind {
                protocol: "rpc",
                addr: self.bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let mut methods: Vec<&str> = self.registry.methods().collect();
        methods.sort_unstable();
        info!("RPC server listening on {} ({} procedures)", addr, methods.len());
        debug!("Registered procedures: {:?}", methods);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let tracker = TaskTracker::new();
        let drain = CancellationToken::new();
        let force = CancellationToken::new();

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            self.registry.clone(),
            shutdown_rx,
            tracker.clone(),
            drain.clone(),
            force.clone(),
        ));

        *self.lock_running() = Some(Running {
            addr,
            shutdown_tx,
            accept_task,
            tracker,
            drain,
            force,
        });

        Ok(addr)
    }

    /// Stop accepting, let outstanding calls finish within `grace`, then
    /// cancel whatever is left.
    ///
    /// Returns `ShutdownTimeout` when calls had to be cut off. Stopping a
    /// server that is not running is a no-op.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let Some(running) = self.lock_running().take() else {
            debug!("RPC server stop requested while not running");
            return Ok(());
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.accept_task.await {
            warn!("RPC accept loop ended abnormally: {}", e);
        }

        running.drain.cancel();
        running.tracker.close();

        if tokio::time::timeout(grace, running.tracker.wait()).await.is_ok() {
            info!("RPC server on {} stopped", running.addr);
            return Ok(());
        }

        warn!(
            "RPC server on {} still had {} tasks after {:?}, cancelling them",
            running.addr,
            running.tracker.len(),
            grace
        );
        running.force.cancel();
        running.tracker.wait().await;

        Err(TwinportError::ShutdownTimeout {
            component: "rpc server".to_string(),
            timeout: grace,
        })
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<HandlerRegistry>,
        mut shutdown_rx: oneshot::Receiver<()>,
        tracker: TaskTracker,
        drain: CancellationToken,
        force: CancellationToken,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting RPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conns = active_connections.clone();
                            let connection = Connection {
                                registry: registry.clone(),
                                tracker: tracker.clone(),
                                drain: drain.clone(),
                                force: force.clone(),
                            };

                            tracker.spawn(async move {
                                debug!("RPC connection from {}", peer_addr);
                                if let Err(e) = connection.serve(stream).await {
                                    debug!("RPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Shared pieces one connection needs to dispatch calls.
struct Connection {
    registry: Arc<HandlerRegistry>,
    tracker: TaskTracker,
    drain: CancellationToken,
    force: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::channel::<ReplyFrame>(REPLY_QUEUE_DEPTH);

        self.tracker
            .spawn(Self::write_replies(writer, reply_rx, self.force.clone()));

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = self.drain.cancelled() => {
                    return Ok(()); // Server shutting down
                }
            };

            let call = match CallFrame::decode(frame.as_slice()) {
                Ok(call) => call,
                Err(e) => {
                    // Without an id there is nobody to answer; drop the connection.
                    return Err(TwinportError::Frame {
                        message: format!("undecodable call frame: {}", e),
                    });
                }
            };

            let registry = self.registry.clone();
            let force = self.force.clone();
            let reply_tx = reply_tx.clone();
            self.tracker.spawn(async move {
                let reply = bound_reply(dispatch(&registry, call, &force).await);
                let _ = reply_tx.send(reply).await;
            });
        }
    }

    async fn write_replies(
        mut writer: OwnedWriteHalf,
        mut replies: mpsc::Receiver<ReplyFrame>,
        force: CancellationToken,
    ) {
        loop {
            let reply = tokio::select! {
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                _ = force.cancelled() => break,
            };
            if let Err(e) = write_message(&mut writer, &reply).await {
                debug!("Failed to write RPC reply {}: {}", reply.id, e);
                break;
            }
        }
    }
}

/// Swap a reply too large to frame for a `ResourceExhausted` failure, so
/// the writer never sees a frame it would have to reject.
fn bound_reply(reply: ReplyFrame) -> ReplyFrame {
    let len = reply.encoded_len();
    if len <= RpcConfig::MAX_FRAME_SIZE {
        return reply;
    }
    warn!("RPC reply {} is {} bytes, over the frame limit", reply.id, len);
    ReplyFrame::failure(
        reply.id,
        RpcStatus::resource_exhausted(format!(
            "response message larger than max ({} vs. {})",
            len,
            RpcConfig::MAX_FRAME_SIZE
        )),
    )
}

/// Run one call under its deadline and turn the outcome into a reply.
async fn dispatch(registry: &HandlerRegistry, call: CallFrame, force: &CancellationToken) -> ReplyFrame {
    let id = call.id;
    let Some(handler) = registry.get(&call.method) else {
        debug!("RPC call to unknown method {}", call.method);
        return ReplyFrame::failure(
            id,
            RpcStatus::unimplemented(format!("unknown method {}", call.method)),
        );
    };

    let timeout = call.timeout().unwrap_or(RpcConfig::DEFAULT_CALL_TIMEOUT);
    let deadline = Instant::now() + timeout;
    let ctx = CallContext::new(call.method.as_str(), deadline, force.child_token());

    debug!("RPC call {} ({}), timeout {:?}", call.method, id, timeout);

    tokio::select! {
        result = tokio::time::timeout_at(deadline, handler.call(ctx.clone(), call.payload)) => {
            match result {
                Ok(Ok(payload)) => ReplyFrame::success(id, payload),
                Ok(Err(status)) => {
                    debug!("RPC call {} failed: {}", call.method, status);
                    ReplyFrame::failure(id, status)
                }
                Err(_) => {
                    ctx.cancel();
                    ReplyFrame::failure(id, RpcStatus::deadline_exceeded("context deadline exceeded"))
                }
            }
        }
        _ = force.cancelled() => {
            ReplyFrame::failure(id, RpcStatus::unavailable("server is shutting down"))
        }
    }
}
