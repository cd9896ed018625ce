//! Registry: the process-wide name → session map plus the set of connected
//! clients. Enforces name uniqueness, brokers create/attach/kill/rename, and
//! broadcasts session-list changes to every connected client. Lock order is
//! registry → session, and no lock is ever held across a network send.

use crate::error::{CoreError, Result};
use crate::protocol::{ServerMsg, SessionEntry};
use crate::pty;
use crate::session::{ClientId, OutboundSender, Session};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Longest accepted session name; names are printable with no control
/// characters.
pub const MAX_NAME_LEN: usize = 64;

/// Initial window size until the first attaching client resizes.
const DEFAULT_SIZE: (u16, u16) = (80, 24);

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && !name.chars().any(|c| c.is_control())
}

/// Snapshot row for the session list.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub name: String,
    pub client_count: usize,
    pub created_at: u64,
}

/// Name map and attachment map, guarded by one mutex so rename re-keys
/// atomically with respect to attach and kill.
struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    attachments: HashMap<ClientId, String>,
}

/// The single piece of process-wide shared state. Initialized at startup,
/// drained on shutdown.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    clients: DashMap<ClientId, OutboundSender>,
    scrollback_cap: usize,
}

impl Registry {
    pub fn new(scrollback_cap: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                attachments: HashMap::new(),
            }),
            clients: DashMap::new(),
            scrollback_cap,
        }
    }

    /// A connection was accepted; its outbound queue lives here until the
    /// connection dies.
    pub fn register_client(&self, id: ClientId, tx: OutboundSender) {
        debug!(client = %id, "client connected");
        self.clients.insert(id, tx);
    }

    /// A connection died: detach it from any session and forget it. Client
    /// count changes ride the next natural list broadcast.
    pub fn client_gone(&self, id: ClientId) {
        self.detach(id);
        self.clients.remove(&id);
        debug!(client = %id, "client gone");
    }

    /// Drop a slow client: removing its senders closes its queue, which ends
    /// the connection's writer task and closes the socket.
    pub fn drop_client(&self, id: ClientId) {
        self.client_gone(id);
    }

    /// Snapshot of the current sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().expect("registry mutex");
        let mut rows: Vec<SessionInfo> = inner
            .sessions
            .iter()
            .map(|(name, s)| SessionInfo {
                name: name.clone(),
                client_count: s.client_count(),
                created_at: s.created_at,
            })
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        rows
    }

    /// Broadcast the session list to every connected client; also the reply
    /// to an explicit `list` request.
    pub fn broadcast_sessions(&self) {
        let list: Vec<SessionEntry> = self
            .list()
            .into_iter()
            .map(|r| SessionEntry {
                name: r.name,
                client_count: r.client_count,
            })
            .collect();
        self.broadcast_all(ServerMsg::Sessions { list });
    }

    /// Enqueue one frame to every connected client. A client whose queue is
    /// full or closed is dropped.
    fn broadcast_all(&self, msg: ServerMsg) {
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().try_send(msg.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.drop_client(id);
        }
    }

    /// Enqueue one frame to one client; a full or closed queue drops it.
    pub fn send_to_client(&self, id: ClientId, msg: ServerMsg) {
        let Some(tx) = self.clients.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        if tx.try_send(msg).is_err() {
            self.drop_client(id);
        }
    }

    /// Create a named session. The creator gets `created{name}` before the
    /// list broadcast; it is not auto-attached. A spawn failure leaves the
    /// registry untouched and is reported to the creator only.
    pub fn create(self: &Arc<Self>, name: &str, creator: ClientId) -> Result<()> {
        if !valid_name(name) {
            return Err(CoreError::InvalidName);
        }
        {
            let inner = self.inner.lock().expect("registry mutex");
            if inner.sessions.contains_key(name) {
                return Err(CoreError::NameTaken(name.to_string()));
            }
        }

        // Spawn outside the lock; shells are not free.
        let (cols, rows) = DEFAULT_SIZE;
        let (bridge, pty_rx, resize_tx, exit_rx) =
            pty::spawn_pty(cols, rows).map_err(|e| CoreError::PtySpawn(e.to_string()))?;
        let session = Arc::new(Session::new(
            name.to_string(),
            bridge,
            resize_tx,
            self.scrollback_cap,
            cols,
            rows,
        ));

        {
            let mut inner = self.inner.lock().expect("registry mutex");
            if inner.sessions.contains_key(name) {
                // Lost a race for the name; shut the fresh shell down again.
                session.kill();
                return Err(CoreError::NameTaken(name.to_string()));
            }
            inner.sessions.insert(name.to_string(), Arc::clone(&session));
        }
        tokio::spawn(Arc::clone(&session).pump(Arc::clone(self), pty_rx, exit_rx));

        info!(session = name, "session created");
        self.send_to_client(
            creator,
            ServerMsg::Created {
                name: name.to_string(),
            },
        );
        self.broadcast_sessions();
        Ok(())
    }

    /// Attach a client. At most one attachment per client: an existing one
    /// is silently left first. Fails with "not found" when the name is
    /// absent or the session is shutting down.
    pub fn attach(&self, name: &str, client: ClientId) -> Result<()> {
        let Some(tx) = self.clients.get(&client).map(|e| e.value().clone()) else {
            return Err(CoreError::ClientUnavailable);
        };
        let mut inner = self.inner.lock().expect("registry mutex");
        let session = inner
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound(name.to_string()))?;
        if let Some(old) = inner.attachments.remove(&client) {
            if let Some(old_session) = inner.sessions.get(&old) {
                old_session.detach(client);
            }
        }
        session.attach(client, &tx)?;
        inner.attachments.insert(client, name.to_string());
        debug!(session = name, client = %client, "client attached");
        Ok(())
    }

    /// Detach a client from whatever session it is attached to, if any.
    pub fn detach(&self, client: ClientId) {
        let mut inner = self.inner.lock().expect("registry mutex");
        if let Some(name) = inner.attachments.remove(&client) {
            if let Some(session) = inner.sessions.get(&name) {
                session.detach(client);
            }
        }
    }

    /// Kill a session: remove the entry, let the session broadcast `killed`
    /// to its attached set and hang up its shell, then announce the new
    /// list. The later exit broadcast is suppressed for killed sessions.
    pub fn kill(&self, name: &str) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock().expect("registry mutex");
            let session = inner
                .sessions
                .remove(name)
                .ok_or_else(|| CoreError::SessionNotFound(name.to_string()))?;
            inner.attachments.retain(|_, n| n != name);
            session
        };
        session.kill();
        self.broadcast_sessions();
        info!(session = name, "session killed");
        Ok(())
    }

    /// Rename a session atomically. Attached clients keep their attachment;
    /// everyone gets `renamed` plus the new list.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if !valid_name(new) {
            return Err(CoreError::InvalidName);
        }
        {
            let mut inner = self.inner.lock().expect("registry mutex");
            if inner.sessions.contains_key(new) {
                return Err(CoreError::NameTaken(new.to_string()));
            }
            let session = inner
                .sessions
                .remove(old)
                .ok_or_else(|| CoreError::SessionNotFound(old.to_string()))?;
            session.set_name(new.to_string());
            inner.sessions.insert(new.to_string(), session);
            for n in inner.attachments.values_mut() {
                if n == old {
                    *n = new.to_string();
                }
            }
        }
        info!(from = old, to = new, "session renamed");
        self.broadcast_all(ServerMsg::Renamed {
            old_name: old.to_string(),
            new_name: new.to_string(),
        });
        self.broadcast_sessions();
        Ok(())
    }

    /// Write keystrokes to the client's attached session. Input from an
    /// unattached connection is silently dropped.
    pub async fn input(&self, client: ClientId, data: String) {
        if let Some(session) = self.attached_session(client) {
            // PTY writes can block when the kernel buffer is full.
            let _ = tokio::task::spawn_blocking(move || session.write(data.as_bytes())).await;
        }
    }

    /// Resize the client's attached session; the last resize wins. Dropped
    /// when the client is not attached.
    pub fn resize(&self, client: ClientId, cols: u16, rows: u16) {
        if let Some(session) = self.attached_session(client) {
            session.resize(cols, rows);
        }
    }

    fn attached_session(&self, client: ClientId) -> Option<Arc<Session>> {
        let inner = self.inner.lock().expect("registry mutex");
        let name = inner.attachments.get(&client)?;
        inner.sessions.get(name).cloned()
    }

    /// Remove a session whose child exited. The pump calls this before it
    /// dispatches the exit notification to the final audience.
    pub(crate) fn remove_exited(&self, name: &str) {
        let mut inner = self.inner.lock().expect("registry mutex");
        inner.sessions.remove(name);
        inner.attachments.retain(|_, n| n != name);
    }

    /// Drain on shutdown: kill every session with best-effort broadcasts.
    /// The caller closes the listener afterwards.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().expect("registry mutex");
            inner.attachments.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.kill();
        }
        self.broadcast_sessions();
    }
}
