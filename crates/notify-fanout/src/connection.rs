//! Client connection types

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Payload queued for a client; shared across every connection it fans out to
pub type Payload = Arc<str>;

/// Metadata about a connection
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// When the connection was established
    pub connected_at: DateTime<Utc>,
    /// Client IP address (if available)
    pub client_ip: Option<String>,
    /// User agent (if available)
    pub user_agent: Option<String>,
}

/// A live client connection
///
/// Holds the only sender of the connection's outbound buffer, so whoever owns
/// the `Connection` decides when the buffer closes. Once registered, that is
/// the `ConnectionManager`.
#[derive(Debug)]
pub struct Connection {
    /// Unique connection ID
    pub id: String,
    pub user_id: String,
    /// Upper-cased role
    pub role: String,
    sender: mpsc::Sender<Payload>,
    last_activity: Arc<AtomicI64>,
    /// Connection metadata
    pub metadata: ConnectionMetadata,
}

impl Connection {
    /// Create a connection with an outbound buffer of `capacity` payloads
    pub fn new(
        user_id: impl Into<String>,
        role: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Payload>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let now = Utc::now();
        let connection = Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            role: role.into().to_uppercase(),
            sender,
            last_activity: Arc::new(AtomicI64::new(now.timestamp_millis())),
            metadata: ConnectionMetadata {
                connected_at: now,
                client_ip: None,
                user_agent: None,
            },
        };
        (connection, receiver)
    }

    /// Attach client details
    pub fn with_metadata(mut self, client_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.metadata.client_ip = client_ip;
        self.metadata.user_agent = user_agent;
        self
    }

    /// Lightweight handle for the connection's pumps
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            last_activity: self.last_activity.clone(),
        }
    }

    /// Check if the receiving side is still open
    pub fn is_active(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        millis_to_datetime(self.last_activity.load(Ordering::Relaxed))
    }

    /// Enqueue without waiting
    pub(crate) fn try_send(
        &self,
        payload: Payload,
    ) -> Result<(), mpsc::error::TrySendError<Payload>> {
        self.sender.try_send(payload)
    }
}

/// Identity and activity clock of a connection, held by its pumps
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub user_id: String,
    pub role: String,
    last_activity: Arc<AtomicI64>,
}

impl ConnectionHandle {
    /// Record inbound or outbound activity
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        millis_to_datetime(self.last_activity.load(Ordering::Relaxed))
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
