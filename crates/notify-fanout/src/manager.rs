//! Connection Manager
//!
//! One event-loop task owns every index over the live connections. Register,
//! unregister and broadcast are commands processed in arrival order, so they
//! never race with each other; counters are read without touching the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Payload};
use crate::metrics::{ConnectionMetrics, MetricsSnapshot};

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Capacity of the command queue feeding the event loop
    pub command_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    User(String),
    Role(String),
    All,
}

enum Command {
    Register(Connection),
    Unregister(String),
    Broadcast {
        target: Target,
        payload: Payload,
        reply: oneshot::Sender<usize>,
    },
    Count {
        target: Target,
        reply: oneshot::Sender<usize>,
    },
    Stop(oneshot::Sender<()>),
}

/// Registry of live connections indexed by user and role
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    metrics: Arc<ConnectionMetrics>,
    event_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
    instance_id: Arc<str>,
}

impl ConnectionManager {
    /// Start a manager and its event loop. Must be called inside a Tokio runtime.
    pub fn spawn(instance_id: impl Into<String>) -> Self {
        Self::with_config(instance_id, ManagerConfig::default())
    }

    pub fn with_config(instance_id: impl Into<String>, config: ManagerConfig) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));
        let metrics = Arc::new(ConnectionMetrics::new());
        let index = ConnectionIndex::new(metrics.clone());
        let event_loop = tokio::spawn(run(receiver, index));
        let instance_id: String = instance_id.into();

        Self {
            commands,
            metrics,
            event_loop: Arc::new(Mutex::new(Some(event_loop))),
            instance_id: Arc::from(instance_id),
        }
    }

    /// Register a connection. Returns `false` once the manager has stopped,
    /// in which case the connection is dropped and its buffer closed.
    pub async fn register(&self, connection: Connection) -> bool {
        let connection_id = connection.id.clone();
        match self.commands.send(Command::Register(connection)).await {
            Ok(()) => true,
            Err(_) => {
                debug!(connection_id, "Register after shutdown ignored");
                false
            }
        }
    }

    /// Remove a connection and close its buffer. Unknown ids are ignored.
    pub async fn unregister(&self, connection_id: &str) {
        let _ = self
            .commands
            .send(Command::Unregister(connection_id.to_string()))
            .await;
    }

    /// Enqueue `payload` on every connection of `user_id`
    pub async fn broadcast_to_user(&self, user_id: &str, payload: impl Into<Payload>) -> usize {
        self.broadcast(Target::User(user_id.to_string()), payload.into())
            .await
    }

    /// Enqueue `payload` on every connection holding `role`
    pub async fn broadcast_to_role(&self, role: &str, payload: impl Into<Payload>) -> usize {
        self.broadcast(Target::Role(role.to_uppercase()), payload.into())
            .await
    }

    /// Enqueue `payload` on every live connection
    pub async fn broadcast_to_all(&self, payload: impl Into<Payload>) -> usize {
        self.broadcast(Target::All, payload.into()).await
    }

    async fn broadcast(&self, target: Target, payload: Payload) -> usize {
        let (reply, delivered) = oneshot::channel();
        let command = Command::Broadcast {
            target,
            payload,
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return 0;
        }
        delivered.await.unwrap_or(0)
    }

    /// Number of live connections for a user
    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.count(Target::User(user_id.to_string())).await
    }

    /// Number of live connections for a role
    pub async fn role_connection_count(&self, role: &str) -> usize {
        self.count(Target::Role(role.to_uppercase())).await
    }

    async fn count(&self, target: Target) -> usize {
        let (reply, count) = oneshot::channel();
        if self.commands.send(Command::Count { target, reply }).await.is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Get total connection count
    pub fn connection_count(&self) -> usize {
        usize::try_from(self.metrics.connections_active.get()).unwrap_or(0)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Counters in the Prometheus text format
    pub fn render_metrics(&self) -> prometheus::Result<String> {
        self.metrics.render()
    }

    /// Content type of the rendered exposition format
    pub fn metrics_content_type(&self) -> String {
        self.metrics.content_type()
    }

    /// Count a data frame received from a client
    pub fn record_received(&self) {
        self.metrics.messages_received_total.inc();
    }

    /// Count a connection-level error
    pub fn record_error(&self) {
        self.metrics.errors_total.inc();
    }

    /// Get the instance ID
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Drain queued commands, close every connection and wait for the event
    /// loop to exit. Later calls return immediately.
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Stop(done)).await.is_ok() {
            let _ = stopped.await;
        }
        if let Some(event_loop) = self.event_loop.lock().await.take() {
            if let Err(e) = event_loop.await {
                warn!(error = %e, "Connection manager loop failed");
            }
        }
    }
}

async fn run(mut commands: mpsc::Receiver<Command>, mut index: ConnectionIndex) {
    let mut waiters = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register(connection) => index.register(connection),
            Command::Unregister(connection_id) => {
                index.unregister(&connection_id);
            }
            Command::Broadcast {
                target,
                payload,
                reply,
            } => {
                let delivered = index.broadcast(&target, payload);
                let _ = reply.send(delivered);
            }
            Command::Count { target, reply } => {
                let _ = reply.send(index.count(&target));
            }
            Command::Stop(done) => {
                if waiters.is_empty() {
                    info!(connections = index.len(), "Connection manager stopping");
                }
                waiters.push(done);
                // Remaining queued commands are still delivered by recv().
                commands.close();
            }
        }
    }

    index.close_all();
    for done in waiters {
        let _ = done.send(());
    }
    info!("Connection manager stopped");
}

/// The three views over the connection set, owned by the event loop
struct ConnectionIndex {
    connections: HashMap<String, Connection>,
    by_user: HashMap<String, HashSet<String>>,
    by_role: HashMap<String, HashSet<String>>,
    metrics: Arc<ConnectionMetrics>,
}

impl ConnectionIndex {
    fn new(metrics: Arc<ConnectionMetrics>) -> Self {
        Self {
            connections: HashMap::new(),
            by_user: HashMap::new(),
            by_role: HashMap::new(),
            metrics,
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn register(&mut self, connection: Connection) {
        let id = connection.id.clone();
        self.by_user
            .entry(connection.user_id.clone())
            .or_default()
            .insert(id.clone());
        if !connection.role.is_empty() {
            self.by_role
                .entry(connection.role.clone())
                .or_default()
                .insert(id.clone());
        }
        debug!(connection_id = %id, user_id = %connection.user_id, role = %connection.role, "Connection registered");
        if self.connections.insert(id, connection).is_none() {
            self.metrics.connections_total.inc();
            self.metrics.connections_active.inc();
        }
    }

    fn unregister(&mut self, connection_id: &str) -> bool {
        let Some(connection) = self.connections.remove(connection_id) else {
            return false;
        };
        remove_from(&mut self.by_user, &connection.user_id, connection_id);
        remove_from(&mut self.by_role, &connection.role, connection_id);
        self.metrics.connections_active.dec();
        debug!(connection_id, user_id = %connection.user_id, "Connection unregistered");
        // Dropping the connection drops the buffer's only sender.
        drop(connection);
        true
    }

    fn target_ids(&self, target: &Target) -> Vec<String> {
        let ids = match target {
            Target::User(user_id) => self.by_user.get(user_id),
            Target::Role(role) => self.by_role.get(role),
            Target::All => return self.connections.keys().cloned().collect(),
        };
        ids.map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
    }

    fn count(&self, target: &Target) -> usize {
        match target {
            Target::User(user_id) => self.by_user.get(user_id).map_or(0, HashSet::len),
            Target::Role(role) => self.by_role.get(role).map_or(0, HashSet::len),
            Target::All => self.connections.len(),
        }
    }

    fn broadcast(&mut self, target: &Target, payload: Payload) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for id in self.target_ids(target) {
            let Some(connection) = self.connections.get(&id) else {
                continue;
            };
            match connection.try_send(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.messages_sent_total.inc();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection_id = %id, user_id = %connection.user_id, "Outbound buffer full, dropping slow connection");
                    self.metrics.errors_total.inc();
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        for id in dropped {
            self.unregister(&id);
        }
        delivered
    }

    fn close_all(&mut self) {
        let count = self.connections.len();
        self.connections.clear();
        self.by_user.clear();
        self.by_role.clear();
        self.metrics.connections_active.set(0);
        if count > 0 {
            info!(closed = count, "Closed remaining connections");
        }
    }
}

fn remove_from(index: &mut HashMap<String, HashSet<String>>, key: &str, connection_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(connection_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}
