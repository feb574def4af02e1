//! Connection registry.
//!
//! Owned by the gateway event loop; nothing here is shared across tasks.
//! Each connection carries an unbounded outbound channel drained by the
//! socket writer task.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::batch::{BatchPolicy, Batcher};
use crate::types::ConnectionId;

/// Close code sent on protocol violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Message handed to a socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Role of a connection. Leaves `Unauthenticated` at most once.
#[derive(Debug)]
pub enum Role {
    Unauthenticated,
    Tenant { tenant_id: String },
    Worker(WorkerState),
}

impl Role {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Role::Unauthenticated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Unauthenticated => "unauthenticated",
            Role::Tenant { .. } => "tenant",
            Role::Worker(_) => "worker",
        }
    }
}

/// Per-worker subscription and pending batch.
#[derive(Debug)]
pub struct WorkerState {
    pub categories: Vec<String>,
    pub batch: Batcher<Value>,
}

impl WorkerState {
    pub fn new(categories: Vec<String>, policy: BatchPolicy) -> Self {
        Self {
            categories,
            batch: Batcher::new(policy),
        }
    }

    pub fn accepts(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

/// An open connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    tx: mpsc::UnboundedSender<Outbound>,
    closing: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            role: Role::Unauthenticated,
            tx,
            closing: false,
        }
    }

    /// True while the connection is not closing and its writer is alive.
    pub fn is_open(&self) -> bool {
        !self.closing && !self.tx.is_closed()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match &self.role {
            Role::Tenant { tenant_id } => Some(tenant_id),
            _ => None,
        }
    }

    pub fn worker(&self) -> Option<&WorkerState> {
        match &self.role {
            Role::Worker(state) => Some(state),
            _ => None,
        }
    }

    pub fn worker_mut(&mut self) -> Option<&mut WorkerState> {
        match &mut self.role {
            Role::Worker(state) => Some(state),
            _ => None,
        }
    }
}

/// Every open connection, keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    /// Worker ids in the order they completed the handshake.
    workers: Vec<ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Registered workers, open or closing.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn insert(&mut self, id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(id.clone(), Connection::new(id, tx));
    }

    /// Remove a connection. Its worker state, gathered jobs and armed
    /// timer go with it.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        if conn.worker().is_some() {
            self.workers.retain(|w| w != id);
        }
        Some(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.connections.get(id).is_some_and(Connection::is_open)
    }

    /// Bind a tenant role. Returns false if the connection is gone or
    /// already has a role.
    pub fn authenticate_tenant(&mut self, id: &ConnectionId, tenant_id: String) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) if !conn.role.is_authenticated() => {
                conn.role = Role::Tenant { tenant_id };
                true
            }
            _ => false,
        }
    }

    /// Bind a worker role. Returns false if the connection is gone or
    /// already has a role.
    pub fn register_worker(&mut self, id: &ConnectionId, state: WorkerState) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) if !conn.role.is_authenticated() => {
                conn.role = Role::Worker(state);
                self.workers.push(id.clone());
                true
            }
            _ => false,
        }
    }

    /// Queue a text message. Messages to closing or vanished connections
    /// are dropped.
    pub fn send(&self, id: &ConnectionId, text: String) -> bool {
        let Some(conn) = self.connections.get(id) else {
            trace!(connection = %id, "send to unknown connection dropped");
            return false;
        };
        if conn.closing {
            return false;
        }
        if conn.tx.send(Outbound::Text(text)).is_err() {
            debug!(connection = %id, "writer gone, message dropped");
            return false;
        }
        true
    }

    /// Ask the writer to close the socket and mark the connection closing.
    /// The entry stays until the socket reports the close.
    pub fn close(&mut self, id: &ConnectionId, code: u16, reason: &str) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.closing {
            return;
        }
        conn.closing = true;
        if let Some(worker) = conn.worker_mut() {
            worker.batch.take();
        }
        let _ = conn.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Open workers subscribed to `category`, in registration order.
    pub fn workers_for(&self, category: &str) -> Vec<ConnectionId> {
        self.workers
            .iter()
            .filter(|id| {
                self.connections.get(*id).is_some_and(|conn| {
                    conn.is_open() && conn.worker().is_some_and(|w| w.accepts(category))
                })
            })
            .cloned()
            .collect()
    }

    /// Best effort fan-out to every authenticated tenant. Returns the
    /// number of tenants the message was queued for.
    pub fn broadcast_to_tenants(&self, text: &str) -> usize {
        let mut sent = 0;
        for conn in self.connections.values() {
            if conn.tenant_id().is_some() && self.send(&conn.id, text.to_string()) {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> BatchPolicy {
        BatchPolicy::new(4, Duration::from_millis(100))
    }

    fn open(reg: &mut Registry, name: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(name);
        reg.insert(id.clone(), tx);
        (id, rx)
    }

    #[test]
    fn test_workers_for_keeps_registration_order() {
        let mut reg = Registry::new();
        let (b, _rb) = open(&mut reg, "b");
        let (a, _ra) = open(&mut reg, "a");
        let (c, _rc) = open(&mut reg, "c");

        assert!(reg.register_worker(&b, WorkerState::new(vec!["embedding".into()], policy())));
        assert!(reg.register_worker(&a, WorkerState::new(vec!["embedding".into()], policy())));
        assert!(reg.register_worker(&c, WorkerState::new(vec!["qa_vlm".into()], policy())));

        assert_eq!(reg.workers_for("embedding"), vec![b.clone(), a.clone()]);
        assert_eq!(reg.workers_for("qa_vlm"), vec![c]);
        assert!(reg.workers_for("summary").is_empty());

        reg.remove(&b);
        assert_eq!(reg.workers_for("embedding"), vec![a]);
    }

    #[test]
    fn test_role_is_assigned_once() {
        let mut reg = Registry::new();
        let (id, _rx) = open(&mut reg, "x");

        assert!(reg.authenticate_tenant(&id, "t1".into()));
        assert!(!reg.authenticate_tenant(&id, "t2".into()));
        assert!(!reg.register_worker(&id, WorkerState::new(vec!["e".into()], policy())));
        assert_eq!(reg.get(&id).unwrap().tenant_id(), Some("t1"));
    }

    #[test]
    fn test_close_marks_closing_and_silences_sends() {
        let mut reg = Registry::new();
        let (id, mut rx) = open(&mut reg, "x");
        reg.register_worker(&id, WorkerState::new(vec!["e".into()], policy()));

        reg.close(&id, CLOSE_POLICY_VIOLATION, "bye");
        assert!(!reg.is_open(&id));
        assert!(!reg.send(&id, "late".into()));
        assert!(reg.workers_for("e").is_empty());

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "bye".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_writer_is_not_open() {
        let mut reg = Registry::new();
        let (id, rx) = open(&mut reg, "x");
        drop(rx);
        assert!(!reg.is_open(&id));
        assert!(!reg.send(&id, "x".into()));
    }

    #[test]
    fn test_broadcast_reaches_tenants_only() {
        let mut reg = Registry::new();
        let (t, mut rt) = open(&mut reg, "t");
        let (w, mut rw) = open(&mut reg, "w");
        let (_u, mut ru) = open(&mut reg, "u");
        reg.authenticate_tenant(&t, "tenant".into());
        reg.register_worker(&w, WorkerState::new(vec!["e".into()], policy()));

        assert_eq!(reg.broadcast_to_tenants("hello"), 1);
        assert_eq!(rt.try_recv().unwrap(), Outbound::Text("hello".into()));
        assert!(rw.try_recv().is_err());
        assert!(ru.try_recv().is_err());
    }
}
