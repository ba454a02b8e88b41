//! Backhaul Server
//!
//! The public relay: accepts agent tunnels and browser traffic on the same
//! ports, routes requests to agents by the MUX header or SNI name, and
//! drains in-flight work on shutdown.

use anyhow::{Context, Result};
use backhaul::config::ServerOptions;
use backhaul::server::Server;
use clap::Parser;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Backhaul Server - reverse HTTP(S) tunneling relay
#[derive(Parser, Debug)]
#[command(name = "backhaul-server")]
#[command(about = "Backhaul Server - reverse HTTP(S) tunneling relay")]
#[command(version)]
struct Args {
    /// The address to listen on. Supports values like: '80', ':80' or '0.0.0.0:80'
    #[arg(long, default_value = "80")]
    addr: String,

    /// The address for TLS to listen on. Supports values like: '443', ':443'
    #[arg(long = "tlsAddr", default_value = "")]
    tls_addr: String,

    /// The address for raw TLS SNI routing to listen on
    #[arg(long = "sniAddr", default_value = "")]
    sni_addr: String,

    /// The path to the TLS cert file
    #[arg(long = "certFile", default_value = "")]
    cert_file: String,

    /// The path to the TLS key file
    #[arg(long = "keyFile", default_value = "")]
    key_file: String,

    /// The TLS min version: tls1.2 or tls1.3
    #[arg(long = "tlsVersion", default_value = "tls1.2")]
    tls_version: String,

    /// A user id; repeat together with --secret
    #[arg(long = "id")]
    ids: Vec<String>,

    /// The secret for the user id at the same position
    #[arg(long = "secret")]
    secrets: Vec<String>,

    /// The users YAML file to load
    #[arg(long = "users", default_value = "")]
    users: String,

    /// The API to authenticate users with id and secret
    #[arg(long = "authAPI", default_value = "")]
    auth_api: String,

    /// Allow any client to connect to the server
    #[arg(long = "allowAnyClient")]
    allow_any_client: bool,

    /// The HTTP header used to multiplex requests to agents
    #[arg(long = "httpMUXHeader", default_value = "Host")]
    http_mux_header: String,

    /// The timeout of connections. Supports values like '30s', '5m'
    #[arg(long, value_parser = humantime::parse_duration, default_value = "90s")]
    timeout: Duration,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long = "logLevel", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let options = ServerOptions {
        addr: args.addr,
        tls_addr: args.tls_addr,
        sni_addr: args.sni_addr,
        cert_file: args.cert_file,
        key_file: args.key_file,
        tls_min_version: args.tls_version,
        ids: args.ids,
        secrets: args.secrets,
        users_file: args.users,
        auth_api: args.auth_api,
        allow_any_client: args.allow_any_client,
        http_mux_header: args.http_mux_header,
        timeout: args.timeout,
    };

    info!("Backhaul Server v{}", backhaul::VERSION);
    let server = Server::new(options).context("invalid configuration")?;
    server.start().await.context("failed to start server")?;

    wait_for_signal().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}

/// Block until one of the termination signals arrives.
async fn wait_for_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}
