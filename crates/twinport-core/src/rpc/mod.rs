//! Binary RPC protocol: framing, server, client and handler registry.
//!
//! # Architecture
//!
//! - **Protocol**: length-prefixed protobuf frames shared by both ends
//! - **Server**: accepts connections and dispatches calls to registered handlers
//! - **Client**: one multiplexed connection, used by native callers and the gateway
//! - **Status**: the error codes both ends speak

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod status;

pub use client::RpcClient;
pub use handler::{unary, CallContext, HandlerRegistry, RpcHandler};
pub use protocol::{CallFrame, ReplyFrame};
pub use server::RpcServer;
pub use status::{Code, RpcStatus};
