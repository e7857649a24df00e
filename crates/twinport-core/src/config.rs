//! Centralized configuration for twinport.
//!
//! Constant groups hold the defaults; [`Settings`] is the runtime view built
//! from them and overridden by command-line arguments in the server binary.

use crate::{Result, TwinportError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Binary RPC listener configuration.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_PORT: u16 = 50000;
    pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024; // 4MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    /// Deadline applied to calls that arrive without one.
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
}

/// HTTP gateway configuration.
pub struct GatewayConfig;

impl GatewayConfig {
    pub const DEFAULT_PORT: u16 = 9091;
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
}

/// Startup and shutdown configuration.
pub struct LifecycleConfig;

impl LifecycleConfig {
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
}

/// HTTP timeouts applied by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// Close keep-alive connections with no request activity for this long.
    pub idle: Duration,
    /// Deadline for receiving a request body.
    pub read: Duration,
    /// Deadline for producing a response; also bounds the loopback RPC call.
    pub write: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            idle: GatewayConfig::IDLE_TIMEOUT,
            read: GatewayConfig::READ_TIMEOUT,
            write: GatewayConfig::WRITE_TIMEOUT,
        }
    }
}

/// Runtime settings for one twinport process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub http_timeouts: HttpTimeouts,
    pub shutdown_grace: Duration,
    /// Emit default-valued fields in gateway JSON responses.
    pub emit_unpopulated: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let host = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            rpc_addr: SocketAddr::new(host, RpcConfig::DEFAULT_PORT),
            http_addr: SocketAddr::new(host, GatewayConfig::DEFAULT_PORT),
            http_timeouts: HttpTimeouts::default(),
            shutdown_grace: LifecycleConfig::SHUTDOWN_GRACE,
            emit_unpopulated: true,
        }
    }
}

impl Settings {
    /// Build settings for the given host and ports, keeping default timeouts.
    pub fn for_host(host: &str, rpc_port: u16, http_port: u16) -> Result<Self> {
        let ip: IpAddr = host.parse().map_err(|e| TwinportError::Config {
            message: format!("Invalid host '{}': {}", host, e),
        })?;
        Ok(Self {
            rpc_addr: SocketAddr::new(ip, rpc_port),
            http_addr: SocketAddr::new(ip, http_port),
            ..Self::default()
        })
    }

    /// Address the gateway dials to reach the RPC listener.
    ///
    /// An unspecified bind address (`0.0.0.0` / `::`) is dialed through the
    /// matching loopback address.
    pub fn loopback_target(bound: SocketAddr) -> SocketAddr {
        let ip = match bound.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            other => other,
        };
        SocketAddr::new(ip, bound.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_match_constants() {
        let settings = Settings::default();
        assert_eq!(settings.rpc_addr.port(), 50000);
        assert_eq!(settings.http_addr.port(), 9091);
        assert_eq!(settings.http_timeouts.idle, Duration::from_secs(60));
        assert_eq!(settings.http_timeouts.read, Duration::from_secs(10));
        assert_eq!(settings.http_timeouts.write, Duration::from_secs(10));
        assert!(settings.emit_unpopulated);
    }

    #[test]
    fn test_for_host_rejects_garbage() {
        assert!(Settings::for_host("not-an-ip", 0, 0).is_err());
        let settings = Settings::for_host("127.0.0.1", 1, 2).unwrap();
        assert_eq!(settings.rpc_addr, "127.0.0.1:1".parse().unwrap());
        assert_eq!(settings.http_addr, "127.0.0.1:2".parse().unwrap());
    }

    #[test]
    fn test_loopback_target_rewrites_unspecified() {
        let bound: SocketAddr = "0.0.0.0:50000".parse().unwrap();
        assert_eq!(
            Settings::loopback_target(bound),
            "127.0.0.1:50000".parse().unwrap()
        );
        let bound: SocketAddr = "10.0.0.5:7".parse().unwrap();
        assert_eq!(Settings::loopback_target(bound), bound);
    }
}
