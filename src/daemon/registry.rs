//! Connection registry.
//!
//! Tracks long-lived connections (diagnostic subscribers and file
//! notifiers) plus the watcher pid. The registry is plain data: the server
//! keeps it behind its single state mutex, so every mutation here happens
//! under that lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use super::protocol::Response;

pub type ClientId = Uuid;

/// Sending side of a connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: UnboundedSender<Response>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(sender: UnboundedSender<Response>) -> Self {
        Self {
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Queue a message; fails once the connection's writer has gone away.
    pub fn send(&self, response: Response) -> bool {
        self.sender.send(response).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    socket: Option<PathBuf>,
    persistent: HashMap<ClientId, ConnectionHandle>,
    file_notifiers: HashMap<ClientId, ConnectionHandle>,
    watcher_pid: Option<u32>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for a server listening on `socket`.
    pub fn listening_on(socket: PathBuf) -> Self {
        Self {
            socket: Some(socket),
            ..Self::default()
        }
    }

    /// Path of the bound socket, while listening.
    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    pub fn register_persistent(&mut self, handle: ConnectionHandle) -> ClientId {
        let id = Uuid::new_v4();
        self.persistent.insert(id, handle);
        debug!(client_id = %id, "persistent client registered");
        id
    }

    pub fn register_file_notifier(&mut self, handle: ConnectionHandle) -> ClientId {
        let id = Uuid::new_v4();
        self.file_notifiers.insert(id, handle);
        debug!(client_id = %id, "file notifier registered");
        id
    }

    /// Forget a client, whatever it registered as.
    pub fn unregister(&mut self, id: ClientId) -> bool {
        let persistent = self.persistent.remove(&id).is_some();
        let notifier = self.file_notifiers.remove(&id).is_some();
        persistent || notifier
    }

    /// Send `response` to every persistent client. Clients that cannot be
    /// reached are dropped; the rest still receive it. Returns the number of
    /// deliveries.
    pub fn broadcast(&mut self, response: &Response) -> usize {
        let mut dead = Vec::new();
        for (id, handle) in &self.persistent {
            if !handle.send(response.clone()) {
                dead.push(*id);
            }
        }
        for id in &dead {
            self.persistent.remove(id);
            debug!(client_id = %id, "dropping unreachable client");
        }
        self.persistent.len()
    }

    pub fn list_file_notifiers(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.file_notifiers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn set_watcher_pid(&mut self, pid: Option<u32>) {
        self.watcher_pid = pid;
    }

    pub fn watcher_pid(&self) -> Option<u32> {
        self.watcher_pid
    }

    pub fn persistent_count(&self) -> usize {
        self.persistent.len()
    }

    /// Drop every registration. Closing the handles lets writer tasks finish.
    pub fn clear(&mut self) {
        self.socket = None;
        self.persistent.clear();
        self.file_notifiers.clear();
        self.watcher_pid = None;
    }
}
