//! Connection wrapper shared by both tunnel endpoints
//!
//! A [`Tunnel`] owns the write half of the control connection. Every
//! outbound frame (PING, CLOSE, READY, ERROR, DATA, task CLOSE) goes through
//! one mutex so frames never interleave; the read half lives with the
//! read-loop and takes no lock.

use super::frame::{self, ErrorCode};
use super::{TunnelError, DATA_HEADER_LEN, MAX_DATA_PAYLOAD};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One tunnel connection: the serialized write path plus the counters and
/// flags the task lifecycle depends on.
pub struct Tunnel {
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    tasks_count: AtomicU32,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl Tunnel {
    pub fn new<W>(writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            write_timeout,
            tasks_count: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Write a whole frame under the write mutex and the write deadline.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        if self.write_timeout > Duration::ZERO {
            timeout(self.write_timeout, write)
                .await
                .map_err(|_| TunnelError::WriteTimeout)??;
        } else {
            write.await?;
        }
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<(), TunnelError> {
        self.write_frame(&frame::PING_SIGNAL.to_be_bytes()).await
    }

    pub async fn send_ready(&self) -> Result<(), TunnelError> {
        self.write_frame(&frame::READY_SIGNAL.to_be_bytes()).await
    }

    /// Best effort: a close signal races the peer tearing the stream down.
    pub async fn send_close_signal(&self) {
        let _ = self.write_frame(&frame::CLOSE_SIGNAL.to_be_bytes()).await;
    }

    pub async fn send_error(&self, code: ErrorCode) -> Result<(), TunnelError> {
        self.write_frame(&frame::error_frame(code)).await
    }

    pub async fn send_task_close(&self, id: u32) -> Result<(), TunnelError> {
        self.write_frame(&frame::task_close_frame(id)).await
    }

    /// Frame `payload` as one or more DATA frames for `id`, splitting at the
    /// per-frame payload bound.
    pub async fn send_data(&self, id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        let mut frame_buf = vec![0u8; DATA_HEADER_LEN + MAX_DATA_PAYLOAD];
        for chunk in payload.chunks(MAX_DATA_PAYLOAD) {
            frame::encode_data_header(&mut frame_buf, id, chunk.len() as u32);
            frame_buf[DATA_HEADER_LEN..DATA_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
            self.write_frame(&frame_buf[..DATA_HEADER_LEN + chunk.len()])
                .await?;
        }
        Ok(())
    }

    pub fn add_task(&self) -> u32 {
        self.tasks_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn sub_task(&self) -> u32 {
        self.tasks_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn tasks_count(&self) -> u32 {
        self.tasks_count.load(Ordering::SeqCst)
    }

    /// Enter the draining state: existing tasks run to completion, the last
    /// one to finish sends the close signal and closes the stream.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Shut the write half down. Idempotent; the peer observes EOF and the
    /// local read-loop unwinds on its own error path.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
