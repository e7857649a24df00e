//! twinport server: the greeter service over binary RPC and JSON/HTTP.
//!
//! Starts the RPC listener, then the gateway that forwards to it, prints the
//! bound ports and runs until Ctrl-C.

mod handlers;

use anyhow::Result;
use clap::Parser;
use handlers::GreeterServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use twinport::api::greeter;
use twinport::config::{GatewayConfig, LifecycleConfig, RpcConfig};
use twinport::rpc::HandlerRegistry;
use twinport::{GatewayServer, JsonCodec, Lifecycle, RouteTable, RpcServer, Settings};

#[derive(Parser, Debug)]
#[command(name = "twinport-server")]
#[command(about = "Serve the greeter service over binary RPC and JSON/HTTP")]
struct Args {
    /// Host to bind both listeners to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Binary RPC port (0 = auto-assign)
    #[arg(long, default_value_t = RpcConfig::DEFAULT_PORT)]
    rpc_port: u16,

    /// HTTP gateway port (0 = auto-assign)
    #[arg(long, default_value_t = GatewayConfig::DEFAULT_PORT)]
    http_port: u16,

    /// Seconds allowed for in-flight requests to finish on shutdown
    #[arg(long, default_value_t = LifecycleConfig::SHUTDOWN_GRACE.as_secs())]
    shutdown_grace_secs: u64,

    /// Deadline for producing an HTTP response, including the RPC call
    #[arg(long, default_value_t = GatewayConfig::WRITE_TIMEOUT.as_secs())]
    request_timeout_secs: u64,

    /// Leave default-valued fields out of JSON responses
    #[arg(long)]
    omit_unpopulated: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn settings(&self) -> twinport::Result<Settings> {
        let mut settings = Settings::for_host(&self.host, self.rpc_port, self.http_port)?;
        settings.shutdown_grace = Duration::from_secs(self.shutdown_grace_secs);
        settings.http_timeouts.write = Duration::from_secs(self.request_timeout_secs);
        settings.emit_unpopulated = !self.omit_unpopulated;
        Ok(settings)
    }
}

fn init_logging(args: &Args) {
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting twinport server");
    let settings = args.settings()?;

    let mut registry = HandlerRegistry::new();
    greeter::register_test_services(&mut registry, Arc::new(GreeterServer));
    let rpc = Arc::new(RpcServer::new(settings.rpc_addr, registry));

    let routes = RouteTable::from_service(&greeter::service_definition())?;
    let codec = JsonCodec::default().with_emit_unpopulated(settings.emit_unpopulated);
    let gateway = Arc::new(GatewayServer::new(
        settings.http_addr,
        routes,
        codec,
        settings.http_timeouts,
    ));

    let mut lifecycle = Lifecycle::new();
    let (rpc_start, rpc_stop) = (rpc.clone(), rpc.clone());
    lifecycle.register(
        "rpc-server",
        move || async move { rpc_start.start().await.map(|_| ()) },
        move |deadline| async move {
            let grace = deadline.saturating_duration_since(tokio::time::Instant::now());
            rpc_stop.stop(grace).await
        },
    );
    let (gateway_start, gateway_stop, upstream) = (gateway.clone(), gateway.clone(), rpc.clone());
    lifecycle.register(
        "gateway-server",
        move || async move {
            let bound = upstream.local_addr().ok_or_else(|| {
                twinport::TwinportError::Other("RPC server is not running".to_string())
            })?;
            gateway_start
                .start(Settings::loopback_target(bound))
                .await
                .map(|_| ())
        },
        move |deadline| async move { gateway_stop.stop(deadline).await },
    );

    if let Err(e) = lifecycle.run_all().await {
        lifecycle.shutdown_all(settings.shutdown_grace).await;
        return Err(e.into());
    }

    // Print ports for the parent process to read (intentional stdout)
    if let Some(addr) = rpc.local_addr() {
        println!("RPC_PORT={}", addr.port());
    }
    if let Some(addr) = gateway.local_addr() {
        println!("HTTP_PORT={}", addr.port());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");

    let report = lifecycle.shutdown_all(settings.shutdown_grace).await;
    if !report.is_clean() {
        for (component, e) in &report.failures {
            warn!("{} shutdown: {}", component, e);
        }
    }
    info!("twinport server exited");

    Ok(())
}
