//! Per-tenant agent records and the global registry
//!
//! An agent record indexes the tunnels an agent keeps open and the in-flight
//! tasks routed to it. Task IDs come from a wrapping 32-bit seed; tunnel
//! selection picks the least-loaded connection. When the last tunnel leaves,
//! the record tears itself out of the registry.

use crate::tunnel::{encode_data_header, PeekReader, Tunnel, DATA_HEADER_LEN, MAX_DATA_PAYLOAD, PRESERVED_SIGNAL};
use crate::Error;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The server half of one public-client connection: the write side lives
/// here for the tunnel read-loop to deliver response bytes, while the read
/// side stays with the task pump.
pub struct TaskConn {
    writer: tokio::sync::Mutex<BoxedWriter>,
    write_timeout: Duration,
    cancel: watch::Sender<bool>,
}

impl TaskConn {
    pub fn new<W>(writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            write_timeout,
            cancel: watch::Sender::new(false),
        }
    }

    /// Deliver response bytes toward the public client.
    pub async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(buf).await?;
            writer.flush().await
        };
        if self.write_timeout > Duration::ZERO {
            timeout(self.write_timeout, write)
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
        } else {
            write.await
        }
    }

    /// Ask the pump to stop. Idempotent.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Per-tenant object keyed by agent id.
pub struct AgentRecord {
    id: String,
    /// None once the record has been torn down; late add_tunnel calls fail.
    tunnels: Mutex<Option<Vec<Arc<Tunnel>>>>,
    tasks: RwLock<HashMap<u32, Arc<TaskConn>>>,
    task_id_seed: AtomicU32,
    closed: AtomicBool,
}

impl AgentRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tunnels: Mutex::new(Some(Vec::new())),
            tasks: RwLock::new(HashMap::new()),
            task_id_seed: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// False when the record is being torn down concurrently; the handshake
    /// retries against a fresh record.
    pub fn add_tunnel(&self, tunnel: Arc<Tunnel>) -> bool {
        let mut guard = self.tunnels.lock().unwrap();
        match guard.as_mut() {
            Some(tunnels) => {
                tunnels.push(tunnel);
                true
            }
            None => false,
        }
    }

    /// Remove a tunnel; returns true when this was the last one and the
    /// record should leave the registry.
    pub fn remove_tunnel(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut guard = self.tunnels.lock().unwrap();
        if let Some(tunnels) = guard.as_mut() {
            tunnels.retain(|t| !Arc::ptr_eq(t, tunnel));
            if tunnels.is_empty() {
                *guard = None;
                return true;
            }
        }
        false
    }

    /// Pick the tunnel with the smallest task count; zero wins immediately.
    pub fn pick_tunnel(&self) -> Option<Arc<Tunnel>> {
        let guard = self.tunnels.lock().unwrap();
        let tunnels = guard.as_ref()?;
        let mut best: Option<(&Arc<Tunnel>, u32)> = None;
        for t in tunnels {
            let count = t.tasks_count();
            if count == 0 {
                return Some(t.clone());
            }
            match best {
                Some((_, min)) if count >= min => {}
                _ => best = Some((t, count)),
            }
        }
        best.map(|(t, _)| t.clone())
    }

    /// Allocate the next task id, wrapping back to 1 before the reserved
    /// signal range.
    fn next_task_id(&self) -> u32 {
        let id = self.task_id_seed.fetch_add(1, Ordering::SeqCst) + 1;
        if id >= PRESERVED_SIGNAL {
            self.task_id_seed.store(1, Ordering::SeqCst);
            return 1;
        }
        id
    }

    fn add_task(&self, id: u32, task: Arc<TaskConn>) {
        self.tasks.write().unwrap().insert(id, task);
    }

    fn remove_task(&self, id: u32) {
        self.tasks.write().unwrap().remove(&id);
    }

    pub fn get_task(&self, id: u32) -> Option<Arc<TaskConn>> {
        self.tasks.read().unwrap().get(&id).cloned()
    }

    /// Route one public connection through this agent: allocate a task,
    /// pump request bytes into the tunnel, and tear the task down when
    /// either side finishes.
    pub async fn serve(
        &self,
        mut reader: PeekReader,
        task: Arc<TaskConn>,
        deadline: Duration,
    ) -> Result<(), Error> {
        let tunnel = self.pick_tunnel().ok_or(Error::IdNotFound)?;
        let id = self.next_task_id();
        self.add_task(id, task.clone());
        trace!(agent = %self.id, task = id, "task started");

        let res = pump_public_conn(&tunnel, id, &task, &mut reader, deadline).await;

        self.remove_task(id);
        task.close();
        task.shutdown_writer().await;
        trace!(agent = %self.id, task = id, "task ended");
        res
    }

    /// Graceful: tunnels enter Draining and close themselves once their
    /// last task completes.
    pub fn shutdown(&self) {
        let guard = self.tunnels.lock().unwrap();
        if let Some(tunnels) = guard.as_ref() {
            for t in tunnels {
                t.shutdown();
            }
        }
    }

    /// Immediate: cancel every task, signal and close every tunnel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<Arc<TaskConn>> =
            self.tasks.read().unwrap().values().cloned().collect();
        for task in tasks {
            task.close();
        }
        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .lock()
            .unwrap()
            .as_ref()
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for t in tunnels {
            t.send_close_signal().await;
            t.close().await;
        }
    }
}

/// Read request bytes from the public client and frame them into the tunnel.
/// Sends the task CLOSE on the way out; the last task on a draining tunnel
/// also closes the tunnel itself.
async fn pump_public_conn(
    tunnel: &Tunnel,
    id: u32,
    task: &TaskConn,
    reader: &mut PeekReader,
    deadline: Duration,
) -> Result<(), Error> {
    tunnel.add_task();
    let mut write_err = false;
    let mut result = Ok(());

    // The sniffed request head goes first.
    let head = reader.take_buffered();
    if !head.is_empty() {
        if let Err(e) = tunnel.send_data(id, &head).await {
            write_err = true;
            result = Err(e.into());
        }
    }

    let mut frame_buf = vec![0u8; DATA_HEADER_LEN + MAX_DATA_PAYLOAD];
    while !write_err {
        let read = tokio::select! {
            _ = task.cancelled() => break,
            read = read_chunk(reader, deadline) => read,
        };
        let chunk = match read {
            Ok(chunk) => chunk,
            Err(e) => {
                if !matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::TimedOut
                ) {
                    debug!(task = id, error = %e, "public conn read ended");
                }
                break;
            }
        };
        encode_data_header(&mut frame_buf, id, chunk.len() as u32);
        frame_buf[DATA_HEADER_LEN..DATA_HEADER_LEN + chunk.len()].copy_from_slice(&chunk);
        if let Err(e) = tunnel
            .write_frame(&frame_buf[..DATA_HEADER_LEN + chunk.len()])
            .await
        {
            write_err = true;
            result = Err(e.into());
        }
    }

    if !write_err {
        if let Err(e) = tunnel.send_task_close(id).await {
            write_err = true;
            result = Err(e.into());
        }
    }
    if write_err {
        tunnel.close().await;
    } else if tunnel.sub_task() == 0 && tunnel.is_closing() {
        tunnel.send_close_signal().await;
        tunnel.close().await;
    }
    result
}

/// Read the next chunk from the public client under the configured
/// deadline; zero disables it.
async fn read_chunk(
    reader: &mut PeekReader,
    deadline: Duration,
) -> std::io::Result<bytes::Bytes> {
    if deadline > Duration::ZERO {
        match timeout(deadline, reader.next_chunk(MAX_DATA_PAYLOAD)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    } else {
        reader.next_chunk(MAX_DATA_PAYLOAD).await
    }
}

/// Global id -> agent-record map.
///
/// A sharded concurrent map: the entry API gives LoadOrCreate semantics with
/// the creator run exactly once per absent key.
#[derive(Default)]
pub struct AgentRegistry {
    map: DashMap<String, Arc<AgentRecord>>,
}

impl AgentRegistry {
    pub fn get(&self, id: &str) -> Option<Arc<AgentRecord>> {
        self.map.get(id).map(|r| r.value().clone())
    }

    /// Load the record for `id`, creating it when absent. The bool reports
    /// whether an existing record was loaded.
    pub fn load_or_create(&self, id: &str) -> (Arc<AgentRecord>, bool) {
        use dashmap::mapref::entry::Entry;
        match self.map.entry(id.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), true),
            Entry::Vacant(e) => {
                let record = Arc::new(AgentRecord::new(id));
                e.insert(record.clone());
                (record, false)
            }
        }
    }

    /// Remove `record` from the registry, but never a newer record that
    /// reclaimed the same id.
    pub fn remove(&self, record: &Arc<AgentRecord>) {
        self.map
            .remove_if(record.id(), |_, current| Arc::ptr_eq(current, record));
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn records(&self) -> Vec<Arc<AgentRecord>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }
}
