//! Client for the binary RPC protocol.
//!
//! One `RpcClient` owns a single long-lived TCP connection. Calls from any
//! number of tasks are multiplexed over it: each call registers a waiter under
//! a fresh id and queues its frame for the connection's writer task, and a
//! background reader routes replies back by id. Only the writer touches the
//! socket, so a caller that gives up mid-call never leaves half a frame on the
//! wire. A broken connection fails every waiting call with `Unavailable` and
//! is redialed by the next call.
//!
//! The connection is plaintext. It is meant for same-host use, such as the
//! gateway's loopback dial; anything crossing an untrusted network needs a
//! TLS layer this client does not provide.

use super::protocol::{read_frame, write_frame, CallFrame, ReplyFrame};
use super::status::RpcStatus;
use crate::codec::{decode_binary, encode_binary};
use crate::config::RpcConfig;
use prost::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ReplyFrame>>>>;

/// Encoded call frames waiting for the writer task.
const CALL_QUEUE_DEPTH: usize = 64;

/// RPC client bound to one server address.
#[derive(Debug)]
pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

#[derive(Debug)]
struct Connection {
    outgoing: mpsc::Sender<Outgoing>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// One encoded call frame, tagged with the id its waiter is registered under.
#[derive(Debug)]
struct Outgoing {
    id: u64,
    frame: Vec<u8>,
}

/// Removes a waiter when its call finishes or is abandoned.
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

fn lock(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ReplyFrame>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RpcClient {
    /// Create a client that dials on first use.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a client and dial immediately.
    pub async fn connect(addr: SocketAddr) -> Result<Self, RpcStatus> {
        let client = Self::new(addr);
        client.ensure_connected().await?;
        Ok(client)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Dial the server unless a healthy connection already exists.
    pub async fn ensure_connected(&self) -> Result<(), RpcStatus> {
        self.connection().await.map(|_| ())
    }

    /// Invoke a procedure with a raw protobuf payload.
    ///
    /// The whole call, dial included, is bounded by `timeout`; the remaining
    /// budget is also sent to the server so it can give up at the same time.
    pub async fn call(
        &self,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcStatus> {
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.call_inner(method, payload, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(RpcStatus::deadline_exceeded("context deadline exceeded")),
        }
    }

    /// Invoke a procedure with typed messages.
    pub async fn call_typed<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcStatus>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = self.call(method, encode_binary(request), timeout).await?;
        decode_binary(&payload).map_err(|e| {
            RpcStatus::internal(format!("failed to decode {} response: {}", method, e))
        })
    }

    async fn call_inner(
        &self,
        method: &str,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<Vec<u8>, RpcStatus> {
        let connection = self.connection().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&connection.pending).insert(id, reply_tx);
        let _guard = PendingGuard {
            pending: connection.pending.clone(),
            id,
        };
        // Reader and writer mark the connection closed before dropping waiters, so a
        // waiter registered after that point must not wait for a reply.
        if connection.closed.load(Ordering::SeqCst) {
            return Err(RpcStatus::unavailable(format!(
                "connection to {} closed",
                self.addr
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = CallFrame::new(id, method, payload, remaining).encode_to_vec();
        // Rejected here so the shared connection never sees it.
        if frame.len() > RpcConfig::MAX_FRAME_SIZE {
            return Err(RpcStatus::resource_exhausted(format!(
                "trying to send message larger than max ({} vs. {})",
                frame.len(),
                RpcConfig::MAX_FRAME_SIZE
            )));
        }

        connection
            .outgoing
            .send(Outgoing { id, frame })
            .await
            .map_err(|_| RpcStatus::unavailable(format!("connection to {} closed", self.addr)))?;

        let reply = reply_rx.await.map_err(|_| {
            RpcStatus::unavailable(format!("connection to {} closed", self.addr))
        })?;
        reply.into_result()
    }

    /// Current connection, dialing a new one if there is none or it broke.
    async fn connection(&self) -> Result<Arc<Connection>, RpcStatus> {
        let mut slot = self.connection.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.closed.load(Ordering::SeqCst) {
                return Ok(existing.clone());
            }
            debug!("RPC connection to {} is closed, redialing", self.addr);
        }

        let stream = tokio::time::timeout(RpcConfig::CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                RpcStatus::unavailable(format!("connection error: dial tcp {}: timed out", self.addr))
            })?
            .map_err(|e| {
                RpcStatus::unavailable(format!("connection error: dial tcp {}: {}", self.addr, e))
            })?;
        let _ = stream.set_nodelay(true);

        debug!("RPC client connected to {}", self.addr);

        let (reader, writer) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outgoing, queue) = mpsc::channel(CALL_QUEUE_DEPTH);
        let reader_task = tokio::spawn(read_replies(
            reader,
            pending.clone(),
            closed.clone(),
            self.addr,
        ));
        let writer_task = tokio::spawn(write_calls(
            writer,
            queue,
            pending.clone(),
            closed.clone(),
            self.addr,
        ));

        let connection = Arc::new(Connection {
            outgoing,
            pending,
            closed,
            reader_task,
            writer_task,
        });
        *slot = Some(connection.clone());
        Ok(connection)
    }
}

/// Write queued call frames until the connection ends.
///
/// Each frame goes out whole or not at all; a frame whose caller already gave
/// up is skipped before it reaches the socket.
async fn write_calls(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outgoing>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    addr: SocketAddr,
) {
    while let Some(call) = queue.recv().await {
        if !lock(&pending).contains_key(&call.id) {
            debug!("Skipping abandoned RPC call {}", call.id);
            continue;
        }
        if let Err(e) = write_frame(&mut writer, &call.frame).await {
            warn!("RPC write to {} failed: {}", addr, e);
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    lock(&pending).clear();
}

/// Route replies to their waiters until the connection ends.
async fn read_replies(
    mut reader: OwnedReadHalf,
    pending: Pending,
    closed: Arc<AtomicBool>,
    addr: SocketAddr,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("RPC server {} closed the connection", addr);
                break;
            }
            Err(e) => {
                warn!("RPC connection to {} failed: {}", addr, e);
                break;
            }
        };

        let reply = match ReplyFrame::decode(frame.as_slice()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Undecodable reply from {}: {}", addr, e);
                break;
            }
        };

        // A missing waiter means the caller already gave up.
        if let Some(waiter) = lock(&pending).remove(&reply.id) {
            let _ = waiter.send(reply);
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiting call with an error.
    lock(&pending).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::greeter::{SayHelloRequest, SayHelloResponse};
    use crate::rpc::handler::{unary, HandlerRegistry};
    use crate::rpc::server::RpcServer;
    use crate::rpc::protocol::write_message;
    use crate::rpc::Code;

    fn test_server() -> RpcServer {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "/test/Greet",
                unary(|_ctx, req: SayHelloRequest| async move {
                    Ok(SayHelloResponse {
                        msg: format!("Hello {}", req.name),
                    })
                }),
            )
            .register(
                "/test/Sleep",
                unary(|_ctx, req: SayHelloRequest| async move {
                    let millis: u64 = req.name.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(SayHelloResponse { msg: req.name })
                }),
            )
            .register(
                "/test/Big",
                unary(|_ctx, _req: SayHelloRequest| async move {
                    Ok(SayHelloResponse {
                        msg: "x".repeat(5 * 1024 * 1024),
                    })
                }),
            );
        RpcServer::new("127.0.0.1:0".parse().unwrap(), registry)
    }

    fn hello(name: &str) -> SayHelloRequest {
        SayHelloRequest {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let server = test_server();
        let addr = server.start().await.unwrap();

        let client = RpcClient::connect(addr).await.unwrap();
        let response: SayHelloResponse = client
            .call_typed("/test/Greet", &hello("Ada"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.msg, "Hello Ada");

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_connection() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        let client = Arc::new(RpcClient::connect(addr).await.unwrap());

        // Slow call first; the fast ones must not queue behind it.
        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_typed::<_, SayHelloResponse>("/test/Sleep", &hello("600"), Duration::from_secs(2))
                    .await
            })
        };

        let started = Instant::now();
        let mut fast = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            fast.push(tokio::spawn(async move {
                client
                    .call_typed::<_, SayHelloResponse>("/test/Greet", &hello(&i.to_string()), Duration::from_secs(2))
                    .await
            }));
        }
        for (i, task) in fast.into_iter().enumerate() {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.msg, format!("Hello {}", i));
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(slow.await.unwrap().unwrap().msg, "600");
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_deadline() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        let client = RpcClient::connect(addr).await.unwrap();

        let status = client
            .call_typed::<_, SayHelloResponse>("/test/Sleep", &hello("500"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::DeadlineExceeded);

        // The connection is still usable afterwards.
        let response: SayHelloResponse = client
            .call_typed("/test/Greet", &hello("again"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.msg, "Hello again");

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_server_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let client = RpcClient::new(addr);
        let status = client
            .call("/test/Greet", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Unavailable);
        assert!(!status.message.is_empty());
    }

    #[tokio::test]
    async fn test_client_redials_after_server_restart() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        let client = RpcClient::connect(addr).await.unwrap();

        server.stop(Duration::from_secs(1)).await.unwrap();

        let mut saw_failure = false;
        for _ in 0..20 {
            if client
                .call("/test/Greet", Vec::new(), Duration::from_millis(200))
                .await
                .is_err()
            {
                saw_failure = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saw_failure, "client should notice the server went away");

        let restarted = RpcServer::new(addr, {
            let mut registry = HandlerRegistry::new();
            registry.register(
                "/test/Greet",
                unary(|_ctx, req: SayHelloRequest| async move {
                    Ok(SayHelloResponse { msg: req.name })
                }),
            );
            registry
        });
        restarted.start().await.unwrap();

        let response: SayHelloResponse = client
            .call_typed("/test/Greet", &hello("back"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.msg, "back");

        restarted.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_reply_leaves_other_calls_alone() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        let client = Arc::new(RpcClient::connect(addr).await.unwrap());

        let sleeper = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_typed::<_, SayHelloResponse>("/test/Sleep", &hello("300"), Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = client
            .call_typed::<_, SayHelloResponse>("/test/Big", &hello(""), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::ResourceExhausted);

        assert_eq!(sleeper.await.unwrap().unwrap().msg, "300");
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_keeps_connection() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        let client = RpcClient::connect(addr).await.unwrap();

        let status = client
            .call(
                "/test/Greet",
                vec![0u8; RpcConfig::MAX_FRAME_SIZE + 1],
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::ResourceExhausted);

        let response: SayHelloResponse = client
            .call_typed("/test/Greet", &hello("after"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.msg, "Hello after");

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    /// Peer that stalls before reading, so large frames back up in the
    /// socket, then answers `/small` and logs every frame it sees.
    async fn stalling_peer() -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();
            tokio::time::sleep(Duration::from_secs(1)).await;

            let mut seen = Vec::new();
            loop {
                let bytes = match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        seen.push(format!("read error: {}", e));
                        break;
                    }
                };
                let call = match CallFrame::decode(bytes.as_slice()) {
                    Ok(call) => call,
                    Err(e) => {
                        seen.push(format!("decode error: {}", e));
                        break;
                    }
                };
                if call.method == "/small" {
                    let payload = encode_binary(&SayHelloResponse { msg: "ok".into() });
                    write_message(&mut writer, &ReplyFrame::success(call.id, payload))
                        .await
                        .unwrap();
                }
                seen.push(call.method);
            }
            seen
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_abandoned_large_calls_do_not_corrupt_the_stream() {
        let (addr, peer) = stalling_peer().await;
        let client = RpcClient::connect(addr).await.unwrap();

        for _ in 0..6 {
            let status = client
                .call("/big", vec![7u8; 3 * 1024 * 1024], Duration::from_millis(100))
                .await
                .unwrap_err();
            assert_eq!(status.code, Code::DeadlineExceeded);
        }

        let response: SayHelloResponse = client
            .call_typed("/small", &hello("tail"), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(response.msg, "ok");

        drop(client);
        let seen = tokio::time::timeout(Duration::from_secs(5), peer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.last().map(String::as_str), Some("/small"));
        assert!(
            seen.iter().all(|m| m == "/big" || m == "/small"),
            "peer saw {:?}",
            seen
        );
    }
}
