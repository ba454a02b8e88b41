//! Agent-side tunnel read-loop and task dispatch
//!
//! One loop per tunnel consumes frames from the server. The first DATA frame
//! for a fresh id dials the local origin and starts the task; payload bytes
//! stream into it, and bytes for dead or unknown tasks are drained so the
//! framing stays intact.

use super::task::{OriginTask, TaskMap};
use super::Agent;
use crate::tunnel::{FrameHeader, PeekReader, Tunnel, MAX_DATA_PAYLOAD, OP_CLOSE, OP_DATA};
use crate::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Synthetic response toward the public client when the origin is down.
const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\nConnection: Closed\r\n\r\n";

/// Demultiplex inbound frames until the tunnel dies. Deadline expiry sends a
/// PING; two outstanding probes without an answer end the loop.
pub(super) async fn read_loop(
    agent: &Agent,
    tunnel: &Arc<Tunnel>,
    reader: &mut PeekReader,
    tasks: &TaskMap,
) -> crate::Result<()> {
    let remote_timeout = agent.options().remote_timeout;
    let mut pings: i32 = 0;

    while pings <= 1 {
        let word = match read_with_deadline(remote_timeout, reader.read_u32_be()).await {
            Ok(word) => word,
            Err(Error::TimeoutExceeded) => {
                tunnel.send_ping().await?;
                pings += 1;
                continue;
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        match FrameHeader::classify(word).map_err(Error::Tunnel)? {
            FrameHeader::Ping => pings -= 1,
            FrameHeader::Close => {
                debug!("read close signal");
                return Ok(());
            }
            FrameHeader::Ready => {
                agent.add_tunnel(tunnel.clone());
                info!("tunnel started");
            }
            FrameHeader::Error => {
                let code = read_with_deadline(remote_timeout, reader.read_u16_be()).await?;
                match crate::tunnel::ErrorCode::from_u16(code) {
                    Some(known) => warn!("read error signal: {known}"),
                    None => warn!(code, "read error signal"),
                }
                return Ok(());
            }
            FrameHeader::Task(id) => {
                let op = read_with_deadline(remote_timeout, reader.read_u16_be()).await?;
                match op {
                    OP_DATA => {
                        let len =
                            read_with_deadline(remote_timeout, reader.read_u32_be()).await?
                                as usize;
                        dispatch_data(agent, tunnel, reader, tasks, id, len, remote_timeout)
                            .await?;
                    }
                    OP_CLOSE => {
                        let task = tasks.read().unwrap().get(&id).cloned();
                        if let Some(task) = task {
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
    debug!(pings, "liveness probes unanswered");
    Ok(())
}

/// Stream one DATA frame's payload into its task, creating the task on
/// first sight of the id. Whatever cannot be delivered is drained.
async fn dispatch_data(
    agent: &Agent,
    tunnel: &Arc<Tunnel>,
    reader: &mut PeekReader,
    tasks: &TaskMap,
    id: u32,
    len: usize,
    remote_timeout: Duration,
) -> crate::Result<()> {
    let mut task = lookup_or_start(agent, tunnel, tasks, id).await;

    let mut remaining = len;
    while remaining > 0 {
        let chunk = read_with_deadline(
            remote_timeout,
            reader.next_chunk(remaining.min(MAX_DATA_PAYLOAD)),
        )
        .await?;
        remaining -= chunk.len();
        if let Some(t) = &task {
            if !t.send(chunk).await {
                debug!(task = id, "task gone, draining");
                task = None;
            }
        }
    }
    Ok(())
}

/// Find the task for `id` or dial the origin and start one. A failed dial
/// answers 403 and fails only the task; the tunnel stays up.
async fn lookup_or_start(
    agent: &Agent,
    tunnel: &Arc<Tunnel>,
    tasks: &TaskMap,
    id: u32,
) -> Option<Arc<OriginTask>> {
    if let Some(task) = tasks.read().unwrap().get(&id).cloned() {
        return Some(task);
    }

    let addr = agent.local_addr();
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            stream
        }
        Err(e) => {
            warn!(task = id, %addr, error = %e, "failed to dial local origin");
            let _ = tunnel.send_data(id, FORBIDDEN_RESPONSE).await;
            let _ = tunnel.send_task_close(id).await;
            return None;
        }
    };
    let (origin_read, origin_write) = stream.into_split();
    let task = OriginTask::start(
        tunnel.clone(),
        tasks.clone(),
        id,
        origin_read,
        origin_write,
        agent.new_rewriter(),
        agent.options().local_timeout,
    );
    info!(task = id, "task started");
    Some(task)
}

async fn read_with_deadline<T, F>(deadline: Duration, fut: F) -> crate::Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::tunnel::{CLOSE_SIGNAL, READY_SIGNAL};
    use std::net::SocketAddr;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A raw echo origin: whatever arrives goes straight back.
    async fn spawn_echo_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_agent(local: SocketAddr) -> Arc<Agent> {
        Agent::new(ClientOptions {
            id: "abc".to_string(),
            secret: "s3cret".to_string(),
            remote: "tcp://127.0.0.1:1".to_string(),
            local: format!("http://{local}"),
            // Long enough that no liveness ping interleaves with the frames
            // the test asserts on.
            remote_timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .unwrap()
    }

    async fn read_exact_n<R: AsyncRead + Unpin>(reader: &mut R, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        reader.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_read_loop_relays_data_to_origin_and_back() {
        let origin = spawn_echo_origin().await;
        let agent = test_agent(origin);

        let (server_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (mut srv_read, mut srv_write) = tokio::io::split(server_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let tunnel = Arc::new(Tunnel::new(agent_write, Duration::ZERO));
        let tasks = TaskMap::default();

        let loop_agent = agent.clone();
        let loop_tunnel = tunnel.clone();
        let loop_tasks = tasks.clone();
        let handle = tokio::spawn(async move {
            let mut reader = PeekReader::new(agent_read);
            read_loop(&loop_agent, &loop_tunnel, &mut reader, &loop_tasks).await
        });

        srv_write
            .write_all(&READY_SIGNAL.to_be_bytes())
            .await
            .unwrap();
        agent
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        let payload = b"hello origin";
        let mut frame = Vec::new();
        frame.extend_from_slice(&7u32.to_be_bytes());
        frame.extend_from_slice(&OP_DATA.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        srv_write.write_all(&frame).await.unwrap();

        // The echo comes back framed as DATA for the same id.
        let head = read_exact_n(&mut srv_read, 10).await;
        assert_eq!(&head[0..4], &7u32.to_be_bytes());
        assert_eq!(&head[4..6], &OP_DATA.to_be_bytes());
        let len = u32::from_be_bytes(head[6..10].try_into().unwrap()) as usize;
        let body = read_exact_n(&mut srv_read, len).await;
        assert_eq!(&body, payload);

        srv_write
            .write_all(&CLOSE_SIGNAL.to_be_bytes())
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_fails_task_only() {
        // Reserve a port, then free it so nothing answers there.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = probe.local_addr().unwrap();
        drop(probe);
        let agent = test_agent(dead);

        let (server_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (mut srv_read, mut srv_write) = tokio::io::split(server_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let tunnel = Arc::new(Tunnel::new(agent_write, Duration::ZERO));
        let tasks = TaskMap::default();

        let loop_agent = agent.clone();
        let loop_tunnel = tunnel.clone();
        let loop_tasks = tasks.clone();
        let handle = tokio::spawn(async move {
            let mut reader = PeekReader::new(agent_read);
            read_loop(&loop_agent, &loop_tunnel, &mut reader, &loop_tasks).await
        });

        let payload = b"GET / HTTP/1.1\r\n\r\n";
        let mut frame = Vec::new();
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(&OP_DATA.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        srv_write.write_all(&frame).await.unwrap();

        // The agent answers 403 for the task and closes it.
        let head = read_exact_n(&mut srv_read, 10).await;
        assert_eq!(&head[0..4], &3u32.to_be_bytes());
        assert_eq!(&head[4..6], &OP_DATA.to_be_bytes());
        let len = u32::from_be_bytes(head[6..10].try_into().unwrap()) as usize;
        let body = read_exact_n(&mut srv_read, len).await;
        assert!(body.starts_with(b"HTTP/1.1 403 Forbidden"));

        let close = read_exact_n(&mut srv_read, 6).await;
        assert_eq!(&close[0..4], &3u32.to_be_bytes());
        assert_eq!(&close[4..6], &OP_CLOSE.to_be_bytes());

        // The tunnel survives the failed task.
        srv_write
            .write_all(&CLOSE_SIGNAL.to_be_bytes())
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }
}
