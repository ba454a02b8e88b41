//! Origin-side tasks and the Host rewrite transducer
//!
//! Each task owns one TCP connection to the local origin. Inbound tunnel
//! bytes flow through an optional [`HostRewriter`] into the origin socket;
//! a pump frames origin output back onto the tunnel as DATA.

use crate::tunnel::{encode_data_header, Tunnel, DATA_HEADER_LEN, MAX_DATA_PAYLOAD};
use crate::Error;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Live tasks on one tunnel, keyed by task id. The read-loop inserts; each
/// pump removes itself on the way out.
pub type TaskMap = Arc<RwLock<HashMap<u32, Arc<OriginTask>>>>;

/// Chunks queued toward the origin before backpressure reaches the tunnel.
const TASK_QUEUE_DEPTH: usize = 64;

const HOST_PREFIX: &[u8] = b"Host:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At a line start, looking for `Host:`
    Scan,
    /// Streaming a non-Host line through to its newline
    Passing,
    /// Discarding the original Host line up to its newline
    Skipping,
    /// Replacement done, everything passes verbatim
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Unsure,
    Replace,
}

/// Rewrites the first `Host:` header line of a byte stream, robust to any
/// chunking. A pure byte-in/byte-out transducer: it owns no socket and no
/// framing, so it composes over chunked requests, pipelining and upgrades.
pub struct HostRewriter {
    replacement: Vec<u8>,
    /// Up to 4 bytes of a still-ambiguous `Host:` prefix at a chunk end
    pending: Vec<u8>,
    state: State,
}

impl HostRewriter {
    pub fn new(host: &str) -> Result<Self, Error> {
        if host.len() > crate::MAX_ID_SIZE {
            return Err(Error::HostTooLong);
        }
        Ok(Self {
            replacement: format!("Host: {host}\r\n").into_bytes(),
            pending: Vec::new(),
            state: State::Scan,
        })
    }

    /// Feed one chunk; rewritten output is appended to `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut rest = input;
        loop {
            match self.state {
                State::Done => {
                    out.extend_from_slice(rest);
                    return;
                }
                State::Skipping => match find_nl(rest) {
                    None => return,
                    Some(i) => {
                        self.state = State::Done;
                        rest = &rest[i + 1..];
                    }
                },
                State::Passing => match find_nl(rest) {
                    None => {
                        out.extend_from_slice(rest);
                        return;
                    }
                    Some(i) => {
                        out.extend_from_slice(&rest[..=i]);
                        rest = &rest[i + 1..];
                        self.state = State::Scan;
                    }
                },
                State::Scan => break,
            }
            if rest.is_empty() {
                return;
            }
        }

        let merged;
        let p: &[u8] = if self.pending.is_empty() {
            rest
        } else {
            if self.pending.len() + rest.len() < HOST_PREFIX.len() {
                self.pending.extend_from_slice(rest);
                return;
            }
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(rest);
            merged = buf;
            &merged
        };

        let mut s = 0;
        while s < p.len() {
            match verdict(&p[s..]) {
                Verdict::Pass => match find_nl(&p[s..]) {
                    None => {
                        self.state = State::Passing;
                        out.extend_from_slice(&p[s..]);
                        return;
                    }
                    Some(i) => {
                        out.extend_from_slice(&p[s..s + i + 1]);
                        s += i + 1;
                    }
                },
                Verdict::Unsure => {
                    self.pending.extend_from_slice(&p[s..]);
                    return;
                }
                Verdict::Replace => {
                    out.extend_from_slice(&self.replacement);
                    match find_nl(&p[s..]) {
                        None => {
                            self.state = State::Skipping;
                            return;
                        }
                        Some(i) => {
                            self.state = State::Done;
                            out.extend_from_slice(&p[s + i + 1..]);
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn find_nl(p: &[u8]) -> Option<usize> {
    p.iter().position(|&b| b == b'\n')
}

/// Compare a line start against `Host:`, over however many bytes exist.
fn verdict(p: &[u8]) -> Verdict {
    let l = p.len().min(HOST_PREFIX.len());
    if p[..l] == HOST_PREFIX[..l] {
        if l < HOST_PREFIX.len() {
            Verdict::Unsure
        } else {
            Verdict::Replace
        }
    } else {
        Verdict::Pass
    }
}

/// Handle to one running origin task.
pub struct OriginTask {
    tx: mpsc::Sender<Bytes>,
    cancel: watch::Sender<bool>,
}

impl OriginTask {
    /// Wire an origin connection into the tunnel: a writer drains queued
    /// chunks through the rewriter into the origin, a pump frames origin
    /// output back as DATA. The task registers itself in `tasks` before the
    /// pump can possibly remove it.
    pub fn start<R, W>(
        tunnel: Arc<Tunnel>,
        tasks: TaskMap,
        id: u32,
        origin_read: R,
        origin_write: W,
        rewriter: Option<HostRewriter>,
        local_timeout: Duration,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(TASK_QUEUE_DEPTH);
        let cancel = watch::Sender::new(false);
        trace!(task = id, "task started");

        let task = Arc::new(Self {
            tx,
            cancel: cancel.clone(),
        });
        tasks.write().unwrap().insert(id, task.clone());

        tokio::spawn(run_writer(rx, rewriter, origin_write, cancel.subscribe()));
        tokio::spawn(run_pump(
            tunnel,
            tasks,
            id,
            origin_read,
            local_timeout,
            cancel,
        ));

        task
    }

    /// Queue a chunk toward the origin. False once the task is dead; the
    /// caller drains the rest of the frame.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    pub fn close(&self) {
        self.cancel.send_replace(true);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

async fn run_writer<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut rewriter: Option<HostRewriter>,
    mut origin_write: W,
    mut cancel: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut rewritten = Vec::with_capacity(MAX_DATA_PAYLOAD + 256);
    loop {
        let chunk = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            chunk = rx.recv() => match chunk {
                None => break,
                Some(chunk) => chunk,
            },
        };
        let data: &[u8] = match rewriter.as_mut() {
            Some(rw) => {
                rewritten.clear();
                rw.push(&chunk, &mut rewritten);
                &rewritten
            }
            None => &chunk,
        };
        if !data.is_empty() && origin_write.write_all(data).await.is_err() {
            break;
        }
    }
    let _ = origin_write.shutdown().await;
}

async fn run_pump<R>(
    tunnel: Arc<Tunnel>,
    tasks: TaskMap,
    id: u32,
    mut origin_read: R,
    local_timeout: Duration,
    cancel: watch::Sender<bool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    tunnel.add_task();
    let mut frame_buf = vec![0u8; DATA_HEADER_LEN + MAX_DATA_PAYLOAD];
    let mut cancel_rx = cancel.subscribe();
    let mut write_err = false;

    loop {
        let read = tokio::select! {
            _ = cancelled(&mut cancel_rx) => break,
            read = read_with_deadline(local_timeout, &mut origin_read, &mut frame_buf[DATA_HEADER_LEN..]) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(task = id, error = %e, "origin read ended");
                break;
            }
        };
        encode_data_header(&mut frame_buf, id, n as u32);
        if tunnel
            .write_frame(&frame_buf[..DATA_HEADER_LEN + n])
            .await
            .is_err()
        {
            write_err = true;
            break;
        }
    }

    if !write_err && tunnel.send_task_close(id).await.is_err() {
        write_err = true;
    }
    tasks.write().unwrap().remove(&id);
    cancel.send_replace(true);
    trace!(task = id, "task ended");
    if write_err {
        tunnel.close().await;
    } else if tunnel.sub_task() == 0 && tunnel.is_closing() {
        tunnel.send_close_signal().await;
        tunnel.close().await;
    }
}

async fn read_with_deadline<R>(
    deadline: Duration,
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize>
where
    R: AsyncRead + Send + Unpin,
{
    if deadline > Duration::ZERO {
        match timeout(deadline, reader.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    } else {
        reader.read(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite_whole(host: &str, input: &[u8]) -> Vec<u8> {
        let mut rw = HostRewriter::new(host).unwrap();
        let mut out = Vec::new();
        rw.push(input, &mut out);
        out
    }

    fn rewrite_chunked(host: &str, input: &[u8], chunk: usize) -> Vec<u8> {
        let mut rw = HostRewriter::new(host).unwrap();
        let mut out = Vec::new();
        for piece in input.chunks(chunk) {
            rw.push(piece, &mut out);
        }
        out
    }

    const REQUEST: &[u8] = b"GET /t?hello=world HTTP/1.1\r\nHost: abc.example.com\r\nAccept: */*\r\n\r\n";
    const REWRITTEN: &[u8] = b"GET /t?hello=world HTTP/1.1\r\nHost: 127.0.0.1:3000\r\nAccept: */*\r\n\r\n";

    #[test]
    fn test_rewrites_host_line() {
        assert_eq!(rewrite_whole("127.0.0.1:3000", REQUEST), REWRITTEN);
    }

    #[test]
    fn test_chunking_never_changes_output() {
        for chunk in 1..REQUEST.len() {
            assert_eq!(
                rewrite_chunked("127.0.0.1:3000", REQUEST, chunk),
                REWRITTEN,
                "chunk size {chunk}"
            );
        }
    }

    #[test]
    fn test_only_first_host_line_is_replaced() {
        let input = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nHost: b.example.com\r\n\r\n";
        let expect = b"GET / HTTP/1.1\r\nHost: local\r\nHost: b.example.com\r\n\r\n";
        assert_eq!(rewrite_whole("local", input), expect.to_vec());
        for chunk in 1..input.len() {
            assert_eq!(rewrite_chunked("local", input, chunk), expect.to_vec());
        }
    }

    #[test]
    fn test_no_host_line_passes_verbatim() {
        let input = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\nbody bytes";
        assert_eq!(rewrite_whole("local", input), input.to_vec());
        for chunk in 1..input.len() {
            assert_eq!(rewrite_chunked("local", input, chunk), input.to_vec());
        }
    }

    #[test]
    fn test_body_after_replacement_passes_verbatim() {
        // A second "Host:"-looking token in the body must survive untouched.
        let input = b"POST / HTTP/1.1\r\nHost: x.example.com\r\n\r\nHost: not-a-header\r\n";
        let expect = b"POST / HTTP/1.1\r\nHost: l\r\n\r\nHost: not-a-header\r\n";
        assert_eq!(rewrite_whole("l", input), expect.to_vec());
        for chunk in 1..input.len() {
            assert_eq!(rewrite_chunked("l", input, chunk), expect.to_vec());
        }
    }

    #[test]
    fn test_ambiguous_prefix_held_across_chunks() {
        let mut rw = HostRewriter::new("local").unwrap();
        let mut out = Vec::new();
        rw.push(b"GET / HTTP/1.1\r\nHos", &mut out);
        // "Hos" could still become "Host:", so it is withheld.
        assert_eq!(out, b"GET / HTTP/1.1\r\n".to_vec());
        rw.push(b"t: abc.example.com\r\n\r\n", &mut out);
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: local\r\n\r\n".to_vec());
    }

    #[test]
    fn test_ambiguous_prefix_that_is_not_host() {
        let mut rw = HostRewriter::new("local").unwrap();
        let mut out = Vec::new();
        rw.push(b"GET / HTTP/1.1\r\nHos", &mut out);
        rw.push(b"tile: yes\r\n\r\n", &mut out);
        assert_eq!(out, b"GET / HTTP/1.1\r\nHostile: yes\r\n\r\n".to_vec());
    }

    #[test]
    fn test_host_too_long() {
        let long = "h".repeat(201);
        assert!(matches!(
            HostRewriter::new(&long),
            Err(Error::HostTooLong)
        ));
        assert!(HostRewriter::new(&"h".repeat(200)).is_ok());
    }
}
