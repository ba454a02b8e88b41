//! Backhaul Client
//!
//! The agent: keeps persistent tunnels to the relay server and forwards
//! multiplexed requests to a private local origin.

use anyhow::{Context, Result};
use backhaul::agent::Agent;
use backhaul::config::ClientOptions;
use clap::Parser;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Backhaul Client - expose a local origin through the relay
#[derive(Parser, Debug)]
#[command(name = "backhaul-client")]
#[command(about = "Backhaul Client - expose a local origin through the relay")]
#[command(version)]
struct Args {
    /// The unique id used to connect to the server; also the domain prefix
    #[arg(long)]
    id: String,

    /// The secret used to verify the id
    #[arg(long)]
    secret: String,

    /// The remote server url: tcp://host:port or tls://host:port
    #[arg(long, default_value = "")]
    remote: String,

    /// The API returning the remote server url
    #[arg(long = "remoteAPI", default_value = "")]
    remote_api: String,

    /// The path to an extra root CA for the tls remote
    #[arg(long = "remoteCert", default_value = "")]
    remote_cert: String,

    /// Accept self-signed certs from the remote
    #[arg(long = "remoteCertInsecure")]
    remote_cert_insecure: bool,

    /// The number of connections to the server (1..=3)
    #[arg(long = "remoteConnections", default_value_t = 1)]
    remote_connections: u32,

    /// The timeout of remote connections. Supports values like '30s', '5m'
    #[arg(long = "remoteTimeout", value_parser = humantime::parse_duration, default_value = "5s")]
    remote_timeout: Duration,

    /// The local origin url: http://host:port or https://host:port
    #[arg(long)]
    local: String,

    /// The timeout of local connections
    #[arg(long = "localTimeout", value_parser = humantime::parse_duration, default_value = "120s")]
    local_timeout: Duration,

    /// Rewrite the Host header of proxied requests to the local origin host
    #[arg(long = "useLocalAsHTTPHost")]
    use_local_as_http_host: bool,

    /// The delay before reconnect. Supports values like '30s', '5m'
    #[arg(long = "reconnectDelay", value_parser = humantime::parse_duration, default_value = "5s")]
    reconnect_delay: Duration,

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

    let options = ClientOptions {
        id: args.id,
        secret: args.secret,
        remote: args.remote,
        remote_api: args.remote_api,
        remote_cert: args.remote_cert,
        remote_cert_insecure: args.remote_cert_insecure,
        remote_connections: args.remote_connections,
        remote_timeout: args.remote_timeout,
        local: args.local,
        local_timeout: args.local_timeout,
        use_local_as_http_host: args.use_local_as_http_host,
        reconnect_delay: args.reconnect_delay,
    };

    info!("Backhaul Client v{}", backhaul::VERSION);
    let agent = Agent::new(options).context("invalid configuration")?;
    agent.start().await.context("failed to start agent")?;

    wait_for_signal().await?;
    info!("shutting down");
    agent.close().await;
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
