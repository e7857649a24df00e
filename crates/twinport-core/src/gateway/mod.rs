//! JSON/HTTP gateway in front of the binary RPC server.
//!
//! - **Routes**: HTTP method + path template → procedure, derived from a service definition
//! - **CORS**: origin-echoing filter wrapping every route
//! - **Server**: listener, transcoding handler and connection draining

pub mod cors;
pub mod routes;
pub mod server;

pub use cors::{allow_cors, evaluate, CorsDecision};
pub use routes::{PathTemplate, RouteBinding, RouteMatch, RouteTable};
pub use server::GatewayServer;
