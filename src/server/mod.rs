//! The public relay server
//!
//! Accepts connections on plain TCP, TLS and SNI listeners. The first two
//! bytes of every stream decide what it is: the handshake magic makes it an
//! agent tunnel, anything else is public traffic routed to an agent by the
//! MUX header (or the SNI name on the SNI listener).

mod agent;
mod ingress;
mod sni;
mod users;

pub use agent::{AgentRecord, AgentRegistry, TaskConn};
pub use users::{AuthMode, Authenticator, Users};

use crate::config::{bind_addr, ServerOptions};
use crate::tunnel::{
    error_frame, ErrorCode, FrameHeader, PeekReader, Tunnel, MAX_DATA_PAYLOAD, OP_CLOSE,
    OP_DATA,
};
use crate::Error;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long the drain loop waits between retries.
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// How a listener interprets non-handshake bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerMode {
    /// Plain TCP or terminated TLS: route by the MUX header
    Http,
    /// Raw TLS passthrough: route by the ClientHello server_name
    Sni,
}

/// A network relay server.
pub struct Server {
    config: ServerOptions,
    registry: AgentRegistry,
    auth: Authenticator,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    accepted: AtomicU64,
    served: AtomicU64,
    failed: AtomicU64,
    tunneling: AtomicU64,
}

impl Server {
    /// Build a server from options: normalize addresses, load users, pick
    /// the auth mode.
    pub fn new(mut config: ServerOptions) -> crate::Result<Arc<Self>> {
        config.normalize()?;

        let users = Users::default();
        let file_users = if config.users_file.is_empty() {
            Default::default()
        } else {
            crate::config::load_users_file(&config.users_file)?
        };
        users.merge(file_users, &config.ids, &config.secrets)?;

        let mode = if !config.auth_api.is_empty() {
            AuthMode::Api(config.auth_api.clone())
        } else if users.is_empty() && config.allow_any_client {
            AuthMode::AllowAny
        } else {
            users.verify()?;
            AuthMode::ConfigUsers
        };

        Ok(Arc::new(Self {
            config,
            registry: AgentRegistry::default(),
            auth: Authenticator::new(mode, users),
            closing: AtomicBool::new(false),
            shutdown_tx: watch::Sender::new(false),
            accepted: AtomicU64::new(0),
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tunneling: AtomicU64::new(0),
        }))
    }

    /// Bind the configured listeners and spawn their accept loops. Returns
    /// the bound addresses (useful with port 0).
    pub async fn start(self: &Arc<Self>) -> crate::Result<Vec<SocketAddr>> {
        let mut bound = Vec::new();

        if !self.config.addr.is_empty() {
            let listener = TcpListener::bind(bind_addr(&self.config.addr))
                .await
                .map_err(|e| {
                    Error::Config(format!("can not listen on '{}': {e}", self.config.addr))
                })?;
            let addr = listener.local_addr()?;
            info!(%addr, "listening");
            bound.push(addr);
            tokio::spawn(self.clone().accept_loop(listener, ListenerMode::Http, None));
        }

        if !self.config.tls_addr.is_empty() {
            let acceptor = build_tls_acceptor(
                &self.config.cert_file,
                &self.config.key_file,
                &self.config.tls_min_version,
            )?;
            let listener = TcpListener::bind(bind_addr(&self.config.tls_addr))
                .await
                .map_err(|e| {
                    Error::Config(format!(
                        "can not listen on '{}': {e}",
                        self.config.tls_addr
                    ))
                })?;
            let addr = listener.local_addr()?;
            info!(%addr, "listening TLS");
            bound.push(addr);
            tokio::spawn(
                self.clone()
                    .accept_loop(listener, ListenerMode::Http, Some(acceptor)),
            );
        }

        if !self.config.sni_addr.is_empty() {
            let listener = TcpListener::bind(bind_addr(&self.config.sni_addr))
                .await
                .map_err(|e| {
                    Error::Config(format!(
                        "can not listen on '{}': {e}",
                        self.config.sni_addr
                    ))
                })?;
            let addr = listener.local_addr()?;
            info!(%addr, "listening SNI");
            bound.push(addr);
            tokio::spawn(self.clone().accept_loop(listener, ListenerMode::Sni, None));
        }

        Ok(bound)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mode: ListenerMode,
        tls: Option<TlsAcceptor>,
    ) {
        info!("accept loop started");
        let mut shut = self.shutdown_tx.subscribe();
        let mut retry_delay = Duration::ZERO;
        loop {
            if self.is_closing() {
                break;
            }
            let accepted = tokio::select! {
                _ = shut.wait_for(|v| *v) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    retry_delay = Duration::ZERO;
                    self.accepted.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.set_nodelay(true);
                    debug!(%peer, "accepted");
                    let server = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => server.handle(stream, mode).await,
                                Err(e) => {
                                    server.failed.fetch_add(1, Ordering::SeqCst);
                                    debug!(%peer, error = %e, "tls accept failed");
                                }
                            },
                            None => server.handle(stream, mode).await,
                        }
                    });
                }
                Err(e) => {
                    if self.is_closing() {
                        break;
                    }
                    // Transient failure: back off 5ms doubling to 1s.
                    retry_delay = if retry_delay.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (retry_delay * 2).min(Duration::from_secs(1))
                    };
                    error!(error = %e, delay = ?retry_delay, "accept error");
                    sleep(retry_delay).await;
                }
            }
        }
        info!("accept loop ended");
    }

    /// Sniff the first two bytes and dispatch the connection.
    async fn handle<S>(self: Arc<Self>, stream: S, mode: ListenerMode)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let deadline = self.config.timeout;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PeekReader::new(read_half);

        let magic = match with_deadline(deadline, reader.peek(2)).await {
            Ok(bytes) => bytes == &crate::HANDSHAKE_MAGIC[..],
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                if !e.is_closed() {
                    warn!(error = %e, "failed to sniff connection");
                }
                return;
            }
        };

        if magic {
            reader.consume(2);
            if let Err(e) = self.handle_tunnel(reader, write_half).await {
                if !e.is_closed() {
                    debug!(error = %e, "tunnel ended");
                }
            }
        } else {
            let result = match mode {
                ListenerMode::Http => self.handle_http(reader, write_half).await,
                ListenerMode::Sni => self.handle_sni(reader, write_half).await,
            };
            self.served.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = result {
                if !e.is_closed() {
                    debug!(error = %e, "public conn ended");
                }
            }
        }
    }

    /// Authenticate the handshake and run the tunnel read-loop.
    async fn handle_tunnel<W>(
        &self,
        mut reader: PeekReader,
        mut writer: W,
    ) -> crate::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let deadline = self.config.timeout;
        let handshake = with_deadline(deadline, async {
            let id_len = reader.read_u8().await? as usize;
            if !(crate::MIN_ID_SIZE..=crate::MAX_ID_SIZE).contains(&id_len) {
                return Ok(Err(Error::ProtocolViolation("invalid id length".into())));
            }
            let id = reader.read_bytes(id_len).await?;
            let secret_len = reader.read_u8().await? as usize;
            if !(crate::MIN_ID_SIZE..=crate::MAX_ID_SIZE).contains(&secret_len) {
                return Ok(Err(Error::ProtocolViolation(
                    "invalid secret length".into(),
                )));
            }
            let secret = reader.read_bytes(secret_len).await?;
            let option = reader.read_u8().await?;
            if option != 0 {
                return Ok(Err(Error::ProtocolViolation(
                    "nonzero reserved option".into(),
                )));
            }
            Ok(Ok((id, secret)))
        })
        .await;

        let (id, secret) = match handshake {
            Ok(Ok(fields)) => fields,
            Ok(Err(e)) | Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        let id = String::from_utf8(id.to_vec())
            .map_err(|_| Error::ProtocolViolation("id is not utf-8".into()));
        let secret = String::from_utf8(secret.to_vec())
            .map_err(|_| Error::ProtocolViolation("secret is not utf-8".into()));
        let (id, secret) = match (id, secret) {
            (Ok(id), Ok(secret)) => (id, secret),
            (Err(e), _) | (_, Err(e)) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        if let Err(e) = self.auth.auth(&id, &secret).await {
            self.failed.fetch_add(1, Ordering::SeqCst);
            let _ = writer
                .write_all(&error_frame(ErrorCode::InvalidIdAndSecret))
                .await;
            let _ = writer.shutdown().await;
            debug!(%id, "rejected handshake");
            return Err(e);
        }

        let tunnel = Arc::new(Tunnel::new(writer, deadline));

        // READY goes out before the tunnel can be picked for tasks.
        if let Err(e) = tunnel.send_ready().await {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(e.into());
        }

        // The record may be tearing down concurrently; retry a bounded
        // number of times against a freshly created one.
        let mut registered = None;
        for _ in 0..5 {
            let (record, _loaded) = self.registry.load_or_create(&id);
            if record.add_tunnel(tunnel.clone()) {
                registered = Some(record);
                break;
            }
        }
        let record = match registered {
            Some(record) => record,
            None => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Config(format!("failed to register agent '{id}'")));
            }
        };

        self.tunneling.fetch_add(1, Ordering::SeqCst);
        info!(%id, "tunnel started");

        let result = self.tunnel_read_loop(&record, &tunnel, &mut reader).await;

        if record.remove_tunnel(&tunnel) {
            self.registry.remove(&record);
            self.auth.users().remove_temp(&id);
        }
        tunnel.close().await;
        info!(%id, "tunnel closed");
        result
    }

    /// Demultiplex frames arriving from the agent.
    async fn tunnel_read_loop(
        &self,
        record: &AgentRecord,
        tunnel: &Tunnel,
        reader: &mut PeekReader,
    ) -> crate::Result<()> {
        let deadline = self.config.timeout;
        loop {
            let word = match with_deadline(deadline, reader.read_u32_be()).await {
                Ok(word) => word,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            };
            match FrameHeader::classify(word).map_err(Error::Tunnel)? {
                FrameHeader::Ping => tunnel.send_ping().await?,
                FrameHeader::Close => return Ok(()),
                FrameHeader::Ready | FrameHeader::Error => {
                    return Err(Error::ProtocolViolation(
                        "unexpected signal from agent".into(),
                    ));
                }
                FrameHeader::Task(id) => {
                    let op = with_deadline(deadline, reader.read_u16_be()).await?;
                    match op {
                        OP_DATA => {
                            let len =
                                with_deadline(deadline, reader.read_u32_be()).await? as usize;
                            let mut task = record.get_task(id);
                            let orphan = task.is_none();
                            let mut remaining = len;
                            while remaining > 0 {
                                let chunk = with_deadline(
                                    deadline,
                                    reader.next_chunk(remaining.min(MAX_DATA_PAYLOAD)),
                                )
                                .await?;
                                remaining -= chunk.len();
                                if let Some(t) = &task {
                                    if let Err(e) = t.write_all(&chunk).await {
                                        debug!(task = id, error = %e, "response writer closed");
                                        t.close();
                                        task = None;
                                    }
                                }
                            }
                            if orphan {
                                debug!(task = id, len, "dropped data for unknown task");
                            }
                        }
                        OP_CLOSE => {
                            if let Some(task) = record.get_task(id) {
                                task.close();
                            }
                        }
                        other => {
                            return Err(Error::ProtocolViolation(format!(
                                "unknown opcode {other:#06x}"
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Route a public HTTP connection by the MUX header.
    async fn handle_http<W>(&self, mut reader: PeekReader, writer: W) -> crate::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let deadline = self.config.timeout;
        let id = with_result_deadline(deadline, async {
            if self.config.http_mux_header == "Host" {
                let host = ingress::peek_host(&mut reader).await?;
                Ok(ingress::parse_id_from_host(&host)?.to_vec())
            } else {
                ingress::peek_header(&mut reader, &self.config.http_mux_header).await
            }
        })
        .await?;
        let id = String::from_utf8(id).map_err(|_| Error::InvalidHttp)?;
        self.serve_public(&id, reader, writer).await
    }

    /// Route a raw TLS connection by the ClientHello server_name.
    async fn handle_sni<W>(&self, mut reader: PeekReader, writer: W) -> crate::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let deadline = self.config.timeout;
        let host = with_result_deadline(deadline, sni::peek_sni_host(&mut reader)).await?;
        let id = ingress::parse_id_from_host(&host)?;
        let id = String::from_utf8(id.to_vec()).map_err(|_| Error::InvalidHttp)?;
        self.serve_public(&id, reader, writer).await
    }

    async fn serve_public<W>(
        &self,
        id: &str,
        reader: PeekReader,
        writer: W,
    ) -> crate::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let record = self.registry.get(id).ok_or(Error::IdNotFound)?;
        let task = Arc::new(TaskConn::new(writer, self.config.timeout));
        record.serve(reader, task, self.config.timeout).await
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn tunneling(&self) -> u64 {
        self.tunneling.load(Ordering::SeqCst)
    }

    /// Immediate stop: listeners stop accepting, every record is closed.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        for record in self.registry.records() {
            record.close().await;
        }
        info!("server stopped");
    }

    /// Graceful stop: listeners close, in-flight work drains, then the
    /// remaining tunnels are closed.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        loop {
            let accepted = self.accepted();
            let settled = self.served() + self.failed() + self.tunneling();
            if accepted == settled {
                break;
            }
            let records = self.registry.records();
            if records.is_empty() {
                break;
            }
            for record in &records {
                record.shutdown();
            }
            info!(
                accepted,
                served = self.served(),
                failed = self.failed(),
                tunneling = self.tunneling(),
                "server shutting down"
            );
            sleep(DRAIN_RETRY_INTERVAL).await;
        }
        for record in self.registry.records() {
            record.close().await;
        }
        info!("server stopped");
    }
}

/// Run `fut` under the configured deadline; zero disables it.
async fn with_deadline<T, F>(deadline: Duration, fut: F) -> crate::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    if deadline > Duration::ZERO {
        match timeout(deadline, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(Error::TimeoutExceeded),
        }
    } else {
        fut.await.map_err(Into::into)
    }
}

/// Like [`with_deadline`] for futures that already yield crate errors.
async fn with_result_deadline<T, F>(deadline: Duration, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    if deadline > Duration::ZERO {
        match timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::TimeoutExceeded),
        }
    } else {
        fut.await
    }
}

/// Build the TLS acceptor from PEM files and the minimum protocol version.
fn build_tls_acceptor(
    cert_file: &str,
    key_file: &str,
    min_version: &str,
) -> crate::Result<TlsAcceptor> {
    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_file).map_err(
        |e| Error::Config(format!("failed to open cert file '{cert_file}': {e}")),
    )?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Config(format!("failed to parse certs: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates in '{cert_file}'")));
    }

    let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_file).map_err(
        |e| Error::Config(format!("failed to open key file '{key_file}': {e}")),
    )?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::Config(format!("failed to parse key: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key in '{key_file}'")))?;

    let versions: &[&rustls::SupportedProtocolVersion] =
        match min_version.to_lowercase().as_str() {
            "tls1.3" => &[&rustls::version::TLS13],
            _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
        };
    let config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid cert and key: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
