//! twinport: one set of procedures served over two protocols.
//!
//! A binary RPC listener serves registered handlers to native clients, and an
//! HTTP gateway translates JSON requests into calls against that listener over
//! a loopback connection. A [`Lifecycle`] starts the RPC server before the
//! gateway and stops them in the opposite order.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use twinport::api::greeter::{self, TestServices};
//! use twinport::rpc::HandlerRegistry;
//! use twinport::{GatewayServer, JsonCodec, RouteTable, RpcServer, Settings};
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl TestServices for Greeter {}
//!
//! # async fn demo() -> twinport::Result<()> {
//! let settings = Settings::for_host("127.0.0.1", 0, 0)?;
//!
//! let mut registry = HandlerRegistry::new();
//! greeter::register_test_services(&mut registry, Arc::new(Greeter));
//! let rpc = RpcServer::new(settings.rpc_addr, registry);
//! let rpc_addr = rpc.start().await?;
//!
//! let routes = RouteTable::from_service(&greeter::service_definition())?;
//! let gateway = GatewayServer::new(settings.http_addr, routes, JsonCodec::default(), settings.http_timeouts);
//! gateway.start(Settings::loopback_target(rpc_addr)).await?;
//!
//! gateway.stop(tokio::time::Instant::now() + Duration::from_secs(5)).await?;
//! rpc.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod rpc;
pub mod service;

pub use codec::{JsonCodec, RpcMessage};
pub use config::{GatewayConfig, HttpTimeouts, LifecycleConfig, RpcConfig, Settings};
pub use error::{Result, TwinportError};
pub use gateway::{GatewayServer, RouteTable};
pub use lifecycle::{Lifecycle, LifecycleState, ShutdownReport};
pub use rpc::{Code, RpcClient, RpcServer, RpcStatus};
pub use service::{HttpRule, ServiceDefinition};
