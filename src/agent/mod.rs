//! The agent (client) process
//!
//! Keeps 1..=3 persistent tunnel connections to the server, re-dialing after
//! `reconnect_delay` whenever one dies. Each tunnel advertises the agent's
//! id and secret, waits for READY, then serves tasks against the local
//! origin.

mod conn;
mod task;

pub use task::HostRewriter;

use crate::config::ClientOptions;
use crate::tunnel::{encode_handshake, PeekReader, Tunnel};
use crate::Error;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task::TaskMap;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

/// Where and how to dial the server.
struct DialTarget {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteApiResponse {
    server_address: String,
}

/// A network agent client.
pub struct Agent {
    options: ClientOptions,
    /// host:port of the local origin
    local_addr: String,
    /// Host header replacement, validated at setup
    rewrite_host: Option<String>,
    closing: AtomicBool,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    ready_tx: watch::Sender<usize>,
    /// Serializes handshakes across reconnect workers
    init_mtx: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(mut options: ClientOptions) -> crate::Result<Arc<Self>> {
        crate::ensure_crypto_provider();
        options.normalize()?;

        let local = url::Url::parse(&options.local)
            .map_err(|e| Error::Config(format!("local url '{}': {e}", options.local)))?;
        let host = local
            .host_str()
            .ok_or_else(|| Error::Config(format!("local url '{}' has no host", options.local)))?
            .to_string();
        let port = local.port_or_known_default().unwrap_or(80);
        let local_addr = format!("{host}:{port}");

        let rewrite_host = if options.use_local_as_http_host {
            let value = match local.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            // Fails setup when the configured host exceeds the bound.
            HostRewriter::new(&value)?;
            Some(value)
        } else {
            None
        };

        Ok(Arc::new(Self {
            options,
            local_addr,
            rewrite_host,
            closing: AtomicBool::new(false),
            tunnels: Mutex::new(Vec::new()),
            ready_tx: watch::Sender::new(0),
            init_mtx: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub(crate) fn new_rewriter(&self) -> Option<HostRewriter> {
        self.rewrite_host
            .as_ref()
            .and_then(|host| HostRewriter::new(host).ok())
    }

    /// Resolve the server address and spawn the reconnect workers.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        let remote = self.resolve_remote().await;
        let target = Arc::new(build_dial_target(&remote, &self.options)?);
        info!(id = %self.options.id, %remote, "starting agent");
        for _ in 0..self.options.remote_connections {
            tokio::spawn(self.clone().connect_worker(target.clone()));
        }
        Ok(())
    }

    /// The configured remote, or ask the remote API for one until it
    /// answers.
    async fn resolve_remote(&self) -> String {
        if !self.options.remote.is_empty() {
            return self.options.remote.clone();
        }
        let http = reqwest::Client::new();
        let url = format!(
            "{}?network_client_id={}",
            self.options.remote_api, self.options.id
        );
        loop {
            match fetch_remote(&http, &url).await {
                Ok(mut remote) => {
                    if !remote.contains("://") {
                        remote = format!("tcp://{remote}");
                    }
                    return remote.trim_end_matches('/').to_string();
                }
                Err(e) => warn!(error = %e, "remote api not ready"),
            }
            sleep(self.options.reconnect_delay).await;
        }
    }

    async fn connect_worker(self: Arc<Self>, target: Arc<DialTarget>) {
        loop {
            info!("trying to connect to remote");
            match self.init_conn(&target).await {
                Ok((tunnel, mut reader)) => {
                    let tasks = TaskMap::default();
                    let result = conn::read_loop(&self, &tunnel, &mut reader, &tasks).await;
                    self.remove_tunnel(&tunnel);
                    let leftover: Vec<_> =
                        tasks.read().unwrap().values().cloned().collect();
                    for task in leftover {
                        task.close();
                    }
                    tunnel.close().await;
                    match result {
                        Err(e) if !e.is_closed() => warn!(error = %e, "tunnel closed"),
                        _ => info!("tunnel closed"),
                    }
                }
                Err(e) => error!(error = %e, "failed to connect to remote"),
            }
            if self.is_closing() {
                break;
            }
            sleep(self.options.reconnect_delay).await;
        }
    }

    /// Dial the server and advertise identity. Serialized so concurrent
    /// workers handshake one at a time.
    async fn init_conn(&self, target: &DialTarget) -> crate::Result<(Arc<Tunnel>, PeekReader)> {
        let _guard = self.init_mtx.lock().await;

        let tcp = TcpStream::connect(&target.addr)
            .await
            .map_err(|e| Error::DialFailed {
                addr: target.addr.clone(),
                source: e,
            })?;
        let _ = tcp.set_nodelay(true);

        let handshake = encode_handshake(&self.options.id, &self.options.secret)?;
        let (tunnel, reader) = match &target.tls {
            Some((connector, name)) => {
                let stream = connector.connect(name.clone(), tcp).await?;
                let (read_half, write_half) = tokio::io::split(stream);
                (
                    Arc::new(Tunnel::new(write_half, self.options.remote_timeout)),
                    PeekReader::new(read_half),
                )
            }
            None => {
                let (read_half, write_half) = tcp.into_split();
                (
                    Arc::new(Tunnel::new(write_half, self.options.remote_timeout)),
                    PeekReader::new(read_half),
                )
            }
        };
        tunnel.write_frame(&handshake).await?;
        Ok((tunnel, reader))
    }

    /// Register a tunnel that has seen READY and wake `wait_until_ready`.
    pub(crate) fn add_tunnel(&self, tunnel: Arc<Tunnel>) {
        let mut tunnels = self.tunnels.lock().unwrap();
        if !tunnels.iter().any(|t| Arc::ptr_eq(t, &tunnel)) {
            tunnels.push(tunnel);
        }
        self.ready_tx.send_replace(tunnels.len());
    }

    pub(crate) fn remove_tunnel(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.tunnels.lock().unwrap();
        tunnels.retain(|t| !Arc::ptr_eq(t, tunnel));
        self.ready_tx.send_replace(tunnels.len());
    }

    /// Number of tunnels currently registered as ready.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    /// Resolve once at least one tunnel is ready.
    pub async fn wait_until_ready(&self, deadline: Duration) -> crate::Result<()> {
        let mut rx = self.ready_tx.subscribe();
        let result = match timeout(deadline, rx.wait_for(|count| *count > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::IoClosed),
            Err(_) => Err(Error::TimeoutExceeded),
        };
        result
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop all tunnels and reconnecting.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let tunnels: Vec<_> = self.tunnels.lock().unwrap().drain(..).collect();
        self.ready_tx.send_replace(0);
        for tunnel in tunnels {
            tunnel.send_close_signal().await;
            tunnel.close().await;
        }
    }
}

async fn fetch_remote(http: &reqwest::Client, url: &str) -> crate::Result<String> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Config(format!("remote api request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Config(format!(
            "remote api returned {}",
            resp.status()
        )));
    }
    let parsed: RemoteApiResponse = resp
        .json()
        .await
        .map_err(|e| Error::Config(format!("remote api returned invalid body: {e}")))?;
    Ok(parsed.server_address)
}

/// Split the remote url into a dial address and an optional TLS layer.
fn build_dial_target(remote: &str, options: &ClientOptions) -> crate::Result<DialTarget> {
    let url = url::Url::parse(remote)
        .map_err(|e| Error::Config(format!("remote url '{remote}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("remote url '{remote}' has no host")))?
        .to_string();
    match url.scheme() {
        "tcp" => Ok(DialTarget {
            addr: format!("{host}:{}", url.port().unwrap_or(80)),
            tls: None,
        }),
        "tls" => {
            let connector =
                build_tls_connector(&options.remote_cert, options.remote_cert_insecure)?;
            let name = ServerName::try_from(host.clone())
                .map_err(|e| Error::Config(format!("remote host '{host}': {e}")))?;
            Ok(DialTarget {
                addr: format!("{host}:{}", url.port().unwrap_or(443)),
                tls: Some((connector, name)),
            })
        }
        other => Err(Error::Config(format!(
            "remote url scheme '{other}' must be tcp or tls"
        ))),
    }
}

fn build_tls_connector(remote_cert: &str, insecure: bool) -> crate::Result<TlsConnector> {
    crate::ensure_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if !remote_cert.is_empty() {
        let mut reader = std::io::BufReader::new(std::fs::File::open(remote_cert).map_err(
            |e| Error::Config(format!("failed to read remote cert '{remote_cert}': {e}")),
        )?);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|e| Error::Config(format!("invalid remote cert: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("invalid remote cert: {e}")))?;
        }
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(insecure_verifier::NoVerification::new()));
    }
    Ok(TlsConnector::from(Arc::new(config)))
}

mod insecure_verifier {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    /// Skips certificate verification; signatures are still checked.
    #[derive(Debug)]
    pub(super) struct NoVerification(Arc<CryptoProvider>);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> ClientOptions {
        ClientOptions {
            id: "abc".to_string(),
            secret: "s3cret".to_string(),
            remote: "tcp://127.0.0.1:7000".to_string(),
            local: "http://127.0.0.1:3000".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_addr_and_rewrite_host() {
        let mut options = base_options();
        options.use_local_as_http_host = true;
        let agent = Agent::new(options).unwrap();
        assert_eq!(agent.local_addr(), "127.0.0.1:3000");
        assert_eq!(agent.rewrite_host.as_deref(), Some("127.0.0.1:3000"));
        assert!(agent.new_rewriter().is_some());
    }

    #[test]
    fn test_local_default_ports() {
        let mut options = base_options();
        options.local = "http://10.0.0.1".to_string();
        let agent = Agent::new(options).unwrap();
        assert_eq!(agent.local_addr(), "10.0.0.1:80");

        let mut options = base_options();
        options.local = "https://10.0.0.1".to_string();
        let agent = Agent::new(options).unwrap();
        assert_eq!(agent.local_addr(), "10.0.0.1:443");
    }

    #[test]
    fn test_dial_target_default_ports() {
        let options = base_options();
        let target = build_dial_target("tcp://example.com", &options).unwrap();
        assert_eq!(target.addr, "example.com:80");
        assert!(target.tls.is_none());

        let target = build_dial_target("tls://example.com", &options).unwrap();
        assert_eq!(target.addr, "example.com:443");
        assert!(target.tls.is_some());
    }

    #[test]
    fn test_dial_target_rejects_unknown_scheme() {
        let options = base_options();
        assert!(build_dial_target("udp://example.com", &options).is_err());
    }
}
