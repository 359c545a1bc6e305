//! Directory Service clients: remote durable store of messages keyed by receiver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hop_core::Message;
use tokio::sync::{mpsc, watch, Mutex};

/// Directory Service call failed.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("unknown message {0}")]
    UnknownMessage(String),
}

#[async_trait]
pub trait DirectoryService: Send + Sync + 'static {
    async fn upload(&self, message: &Message) -> Result<(), DirectoryError>;

    /// Batches of undelivered messages for `username`, ascending by timestamp.
    /// The stream ends when the receiver is dropped.
    async fn subscribe_pending(&self, username: &str) -> Result<mpsc::Receiver<Vec<Message>>, DirectoryError>;

    async fn mark_delivered(&self, message_id: &str) -> Result<(), DirectoryError>;
}

/// Pending messages for `username`, oldest first.
fn pending_for(messages: &[Message], username: &str) -> Vec<Message> {
    let mut batch: Vec<Message> = messages
        .iter()
        .filter(|m| m.receiver == username && !m.delivered)
        .cloned()
        .collect();
    batch.sort_by_key(|m| m.timestamp_ms);
    batch
}

fn ids(batch: &[Message]) -> Vec<String> {
    batch.iter().map(|m| m.id.clone()).collect()
}

/// REST directory: `PUT {base}/messages/{id}`, `GET {base}/messages?receiver=..&delivered=false`,
/// `PATCH {base}/messages/{id}` with `{"delivered":true}`.
#[derive(Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base: String,
    poll_interval: Duration,
}

impl HttpDirectory {
    pub fn new(base: impl Into<String>, poll_interval: Duration) -> Self {
        let base: String = base.into();
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    fn message_url(&self, id: &str) -> String {
        format!("{}/messages/{}", self.base, id)
    }

    /// One poll of the pending query.
    pub async fn fetch_pending(&self, username: &str) -> Result<Vec<Message>, DirectoryError> {
        let messages: Vec<Message> = self
            .client
            .get(format!("{}/messages", self.base))
            .query(&[("receiver", username), ("delivered", "false")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(pending_for(&messages, username))
    }
}

#[async_trait]
impl DirectoryService for HttpDirectory {
    async fn upload(&self, message: &Message) -> Result<(), DirectoryError> {
        self.client
            .put(self.message_url(&message.id))
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn subscribe_pending(&self, username: &str) -> Result<mpsc::Receiver<Vec<Message>>, DirectoryError> {
        let (tx, rx) = mpsc::channel(8);
        let this = self.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last: Vec<String> = Vec::new();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                match this.fetch_pending(&username).await {
                    Ok(batch) => {
                        let current = ids(&batch);
                        if current != last && !batch.is_empty() && tx.send(batch).await.is_err() {
                            break;
                        }
                        last = current;
                    }
                    Err(e) => tracing::warn!("directory poll failed: {e}"),
                }
            }
        });
        Ok(rx)
    }

    async fn mark_delivered(&self, message_id: &str) -> Result<(), DirectoryError> {
        self.client
            .patch(self.message_url(message_id))
            .json(&serde_json::json!({ "delivered": true }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<Message>,
    uploads: Vec<String>,
    marked: Vec<String>,
    failing: bool,
}

/// In-process directory. Subscriptions re-emit whenever the pending set changes.
#[derive(Clone)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            changed: Arc::new(changed),
        }
    }

    /// Store a message as if another gateway uploaded it.
    pub async fn insert(&self, message: Message) {
        {
            let mut s = self.state.lock().await;
            match s.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message,
                None => s.messages.push(message),
            }
        }
        self.changed.send_modify(|v| *v += 1);
    }

    /// Make every call fail until cleared.
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    /// Ids passed to successful `upload` calls, in call order.
    pub async fn uploaded_ids(&self) -> Vec<String> {
        self.state.lock().await.uploads.clone()
    }

    /// Ids passed to successful `mark_delivered` calls, in call order.
    pub async fn marked_ids(&self) -> Vec<String> {
        self.state.lock().await.marked.clone()
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn upload(&self, message: &Message) -> Result<(), DirectoryError> {
        {
            let mut s = self.state.lock().await;
            if s.failing {
                return Err(DirectoryError::Unavailable("upload rejected".into()));
            }
            s.uploads.push(message.id.clone());
            if !s.messages.iter().any(|m| m.id == message.id) {
                s.messages.push(message.clone());
            }
        }
        self.changed.send_modify(|v| *v += 1);
        Ok(())
    }

    async fn subscribe_pending(&self, username: &str) -> Result<mpsc::Receiver<Vec<Message>>, DirectoryError> {
        if self.state.lock().await.failing {
            return Err(DirectoryError::Unavailable("subscribe rejected".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        let state = self.state.clone();
        let mut changed = self.changed.subscribe();
        let username = username.to_string();
        tokio::spawn(async move {
            let mut last: Vec<String> = Vec::new();
            loop {
                let batch = pending_for(&state.lock().await.messages, &username);
                let current = ids(&batch);
                if current != last && !batch.is_empty() && tx.send(batch).await.is_err() {
                    return;
                }
                last = current;
                tokio::select! {
                    r = changed.changed() => if r.is_err() { return },
                    _ = tx.closed() => return,
                }
            }
        });
        Ok(rx)
    }

    async fn mark_delivered(&self, message_id: &str) -> Result<(), DirectoryError> {
        {
            let mut s = self.state.lock().await;
            if s.failing {
                return Err(DirectoryError::Unavailable("mark rejected".into()));
            }
            let m = s
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| DirectoryError::UnknownMessage(message_id.to_string()))?;
            m.delivered = true;
            s.marked.push(message_id.to_string());
        }
        self.changed.send_modify(|v| *v += 1);
        Ok(())
    }
}
