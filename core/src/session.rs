//! Session: one named PTY plus its scrollback and attached clients.
//! A single pump task per session copies PTY output into the scrollback and
//! into every attached client's bounded queue; a client that cannot drain
//! its queue is dropped instead of stalling the reader.

use crate::error::{CoreError, Result};
use crate::protocol::ServerMsg;
use crate::pty::{ExitReport, PtyBridge, ResizeSender};
use crate::registry::Registry;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Unique client-connection identifier (UUID v4), assigned on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Send side of one client's outbound queue. The connection's writer task
/// drains the other end into the WebSocket.
pub type OutboundSender = mpsc::Sender<ServerMsg>;

/// Per-client outbound queue capacity. A client whose queue fills is dropped.
pub const CLIENT_QUEUE_CAP: usize = 256;

/// Bounded FIFO of output chunks as emitted by the PTY. When the byte total
/// goes over the cap, oldest chunks are dropped whole; the total never
/// exceeds the cap by more than one chunk.
pub struct Scrollback {
    chunks: VecDeque<Bytes>,
    total: usize,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            cap,
        }
    }

    /// Append a chunk, then drop oldest chunks until the buffer fits again.
    pub fn push(&mut self, chunk: Bytes) {
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.cap && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.total -= old.len();
            }
        }
    }

    /// Concatenate the current contents, oldest first (the attach replay).
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Lifecycle of a session. Transitions are one-way; attach is rejected in
/// Exiting and Gone, write and resize are silently dropped there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exiting,
    Gone,
}

/// Everything guarded by the session's own lock: scrollback, client set,
/// state, name, and last known window size.
struct Inner {
    name: String,
    scrollback: Scrollback,
    clients: HashMap<ClientId, OutboundSender>,
    state: SessionState,
    size: (u16, u16),
    /// Set on explicit kill so the pump suppresses the exit broadcast.
    killed: bool,
}

/// One live session: PTY bridge, resize sender, creation time, and the
/// locked Inner. Owned by the registry behind an Arc.
pub struct Session {
    pub created_at: u64,
    bridge: PtyBridge,
    resize_tx: ResizeSender,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(
        name: String,
        bridge: PtyBridge,
        resize_tx: ResizeSender,
        scrollback_cap: usize,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            created_at: unix_now_secs(),
            bridge,
            resize_tx,
            inner: Mutex::new(Inner {
                name,
                scrollback: Scrollback::new(scrollback_cap),
                clients: HashMap::new(),
                state: SessionState::Starting,
                size: (cols, rows),
                killed: false,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().expect("session mutex").name.clone()
    }

    /// Registry rename re-keys the map and updates the session's own name.
    pub(crate) fn set_name(&self, name: String) {
        self.inner.lock().expect("session mutex").name = name;
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().expect("session mutex").clients.len()
    }

    pub fn size(&self) -> (u16, u16) {
        self.inner.lock().expect("session mutex").size
    }

    /// Attach a client atomically with the fan-out: the scrollback replay and
    /// every later chunk go through the same queue under the same lock, so
    /// there is no gap and no duplicate between replay and live stream. An
    /// empty scrollback sends no replay frame.
    pub fn attach(&self, id: ClientId, tx: &OutboundSender) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex");
        match inner.state {
            SessionState::Starting | SessionState::Running => {}
            SessionState::Exiting | SessionState::Gone => {
                return Err(CoreError::SessionNotFound(inner.name.clone()));
            }
        }
        let replay = inner.scrollback.dump();
        if !replay.is_empty() {
            let msg = ServerMsg::Output {
                data: String::from_utf8_lossy(&replay).into_owned(),
            };
            tx.try_send(msg).map_err(|_| CoreError::ClientUnavailable)?;
        }
        inner.clients.insert(id, tx.clone());
        Ok(())
    }

    /// Remove a client from the attached set. Pending sends die with the
    /// queue when the connection goes away.
    pub fn detach(&self, id: ClientId) {
        self.inner
            .lock()
            .expect("session mutex")
            .clients
            .remove(&id);
    }

    /// Forward keystrokes to the PTY. Input from different clients is not
    /// serialized; the kernel accepts whole writes below PIPE_BUF. Silently
    /// dropped once the session is shutting down.
    pub fn write(&self, bytes: &[u8]) {
        {
            let inner = self.inner.lock().expect("session mutex");
            if !matches!(inner.state, SessionState::Starting | SessionState::Running) {
                return;
            }
        }
        if let Err(e) = self.bridge.write(bytes) {
            // The read side will observe EOF and end the session.
            debug!(error = %e, "PTY write failed");
        }
    }

    /// Update the window size; the last resize wins. Silently dropped once
    /// the session is shutting down.
    pub fn resize(&self, cols: u16, rows: u16) {
        {
            let mut inner = self.inner.lock().expect("session mutex");
            if !matches!(inner.state, SessionState::Starting | SessionState::Running) {
                return;
            }
            inner.size = (cols, rows);
        }
        let _ = self.resize_tx.send((cols, rows));
    }

    /// Explicit kill: broadcast `killed` to the attached set, mark the
    /// session so the pump suppresses the later exit broadcast, then hang up
    /// the child. The registry removes the entry before calling this.
    pub fn kill(&self) {
        let (name, targets) = {
            let mut inner = self.inner.lock().expect("session mutex");
            if matches!(inner.state, SessionState::Exiting | SessionState::Gone) {
                return;
            }
            inner.state = SessionState::Exiting;
            inner.killed = true;
            (
                inner.name.clone(),
                inner.clients.values().cloned().collect::<Vec<_>>(),
            )
        };
        let msg = ServerMsg::Killed { name };
        for tx in targets {
            let _ = tx.try_send(msg.clone());
        }
        self.bridge.hangup();
    }

    /// Fan-out pump, one task per session. For each PTY chunk: append to
    /// scrollback and snapshot the client set under the lock, then enqueue
    /// the chunk to every snapshotted client outside it. On EOF the exit
    /// report goes to the final attached set, after the registry entry is
    /// removed.
    pub(crate) async fn pump(
        self: Arc<Self>,
        registry: Arc<Registry>,
        mut pty_rx: mpsc::Receiver<Bytes>,
        mut exit_rx: mpsc::Receiver<ExitReport>,
    ) {
        {
            let mut inner = self.inner.lock().expect("session mutex");
            if inner.state == SessionState::Starting {
                inner.state = SessionState::Running;
            }
        }

        while let Some(chunk) = pty_rx.recv().await {
            let targets: Vec<(ClientId, OutboundSender)> = {
                let mut inner = self.inner.lock().expect("session mutex");
                inner.scrollback.push(chunk.clone());
                inner
                    .clients
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect()
            };
            if targets.is_empty() {
                continue;
            }
            let msg = ServerMsg::Output {
                data: String::from_utf8_lossy(&chunk).into_owned(),
            };
            let mut slow = Vec::new();
            for (id, tx) in targets {
                match tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => slow.push(id),
                    Err(mpsc::error::TrySendError::Closed(_)) => self.detach(id),
                }
            }
            for id in slow {
                warn!(session = %self.name(), client = %id, "client cannot keep up, dropping it");
                registry.drop_client(id);
            }
        }

        // EOF: the child is gone (or was hung up). Reject attaches while we
        // wait for the exit report.
        {
            let mut inner = self.inner.lock().expect("session mutex");
            if inner.state != SessionState::Gone {
                inner.state = SessionState::Exiting;
            }
        }
        let report = exit_rx.recv().await.unwrap_or(ExitReport {
            exit_code: 1,
            signal: None,
        });

        let (was_killed, name, targets) = {
            let mut inner = self.inner.lock().expect("session mutex");
            inner.state = SessionState::Gone;
            let targets = inner.clients.drain().map(|(_, tx)| tx).collect::<Vec<_>>();
            (inner.killed, inner.name.clone(), targets)
        };
        if was_killed {
            // kill() already broadcast `killed` and the registry already
            // removed the entry and announced the new list.
            info!(session = %name, "killed session ended");
            return;
        }

        // Removal precedes the exit notification to the final audience.
        registry.remove_exited(&name);
        let msg = ServerMsg::Exited {
            name: name.clone(),
            exit_code: report.exit_code,
            signal: report.signal.clone(),
        };
        for tx in &targets {
            let _ = tx.try_send(msg.clone());
        }
        registry.broadcast_sessions();
        info!(session = %name, exit_code = report.exit_code, "session ended");
    }
}

/// Unix timestamp for "now" (seconds).
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrollback_keeps_chunks_in_order() {
        let mut sb = Scrollback::new(1024);
        sb.push(Bytes::from_static(b"one "));
        sb.push(Bytes::from_static(b"two "));
        sb.push(Bytes::from_static(b"three"));
        assert_eq!(sb.dump(), b"one two three");
    }

    #[test]
    fn scrollback_drops_oldest_chunks_whole() {
        let mut sb = Scrollback::new(10);
        sb.push(Bytes::from_static(b"aaaa"));
        sb.push(Bytes::from_static(b"bbbb"));
        sb.push(Bytes::from_static(b"cccc"));
        // "aaaa" must be gone entirely, never partially.
        assert_eq!(sb.dump(), b"bbbbcccc");
        assert_eq!(sb.total_bytes(), 8);
    }

    #[test]
    fn scrollback_never_exceeds_cap_by_more_than_one_chunk() {
        let cap = 1024;
        let mut sb = Scrollback::new(cap);
        let chunk_len = 100;
        for _ in 0..200 {
            sb.push(Bytes::from(vec![b'x'; chunk_len]));
            assert!(sb.total_bytes() <= cap + chunk_len);
        }
    }

    #[test]
    fn scrollback_retains_an_oversized_chunk() {
        let mut sb = Scrollback::new(4);
        sb.push(Bytes::from_static(b"0123456789"));
        // A single chunk larger than the cap is kept; it is the newest data.
        assert_eq!(sb.dump(), b"0123456789");
        sb.push(Bytes::from_static(b"ab"));
        assert_eq!(sb.dump(), b"ab");
    }

    #[test]
    fn empty_scrollback_dumps_nothing() {
        let sb = Scrollback::new(16);
        assert!(sb.is_empty());
        assert!(sb.dump().is_empty());
    }
}
