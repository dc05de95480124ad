//! Persistence path for relayed chat messages.
//!
//! The gateway broadcasts first and hands each message to a writer task
//! afterwards, so a slow or failing store never delays live delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_common::{MessageId, RoomKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Durable copy of a chat message as handed to the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub room: RoomKey,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_image: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached.
    Unavailable(String),
    /// The store answered but refused the record.
    Rejected(u16),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "message store unavailable: {reason}"),
            Self::Rejected(status) => write!(f, "message store rejected record (HTTP {status})"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Append-only sink for chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, record: &MessageRecord) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (for development / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMessageStore {
    records: Mutex<Vec<MessageRecord>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages stored for `room`, oldest first.
    pub fn history(&self, room: &RoomKey) -> Vec<MessageRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| &r.room == room)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation: POSTs each record to the request-handling layer
// ---------------------------------------------------------------------------

/// Request timeout for a single append.
const HTTP_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpMessageStore {
    client: reqwest::Client,
    url: String,
}

impl HttpMessageStore {
    pub fn new(url: impl Into<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_APPEND_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn append(&self, record: &MessageRecord) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StoreError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Capacity of the queue between the hub and the writer task.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Spawn the task that drains queued records into `store`, one at a time
/// and in the order they were broadcast.
///
/// The task ends once every sender has been dropped.
pub fn spawn_writer(
    store: Arc<dyn MessageStore>,
) -> (mpsc::Sender<MessageRecord>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<MessageRecord>(WRITE_QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(err) = store.append(&record).await {
                // Already delivered live; the copy is lost for history only.
                tracing::warn!(
                    message_id = %record.id,
                    room = %record.room,
                    error = %err,
                    "failed to persist chat message"
                );
            }
        }
        tracing::debug!("message writer stopped");
    });

    (tx, handle)
}
