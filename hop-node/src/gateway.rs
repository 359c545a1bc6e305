//! Gateway sync: while the internet is reachable, push cached messages to the directory
//! and pull messages addressed to the local user.

use std::sync::Arc;

use hop_core::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::directory::DirectoryService;

/// Results fed back to the coordinator.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A batch from the pending subscription, oldest first.
    Pending(Vec<Message>),
    /// The directory confirmed `mark_delivered` for this id.
    Delivered(String),
}

pub struct GatewaySync {
    directory: Arc<dyn DirectoryService>,
    username: String,
    events: mpsc::Sender<GatewayEvent>,
    reachable: bool,
    push: Option<JoinHandle<()>>,
    pull: Option<JoinHandle<()>>,
    marks: Vec<JoinHandle<()>>,
}

impl GatewaySync {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        username: impl Into<String>,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            directory,
            username: username.into(),
            events,
            reachable: false,
            push: None,
            pull: None,
            marks: Vec::new(),
        }
    }

    /// Apply a connectivity signal. On the transition to reachable, `cached` is uploaded and the
    /// pending subscription opens; on the transition to unreachable both stop. Returns true on change.
    pub fn set_reachable(&mut self, reachable: bool, cached: Vec<Message>) -> bool {
        if reachable == self.reachable {
            return false;
        }
        self.reachable = reachable;
        if !reachable {
            tracing::info!("gateway: internet unreachable, sync stopped");
            self.stop();
            return true;
        }
        tracing::info!("gateway: internet reachable, pushing {} cached message(s)", cached.len());
        self.push = Some(tokio::spawn(push(self.directory.clone(), cached)));
        self.pull = Some(tokio::spawn(pull(
            self.directory.clone(),
            self.username.clone(),
            self.events.clone(),
        )));
        true
    }

    /// Confirm local delivery of a pulled message. Best-effort.
    pub fn mark_delivered(&mut self, id: String) {
        if !self.reachable {
            return;
        }
        self.marks.retain(|h| !h.is_finished());
        let directory = self.directory.clone();
        let events = self.events.clone();
        self.marks.push(tokio::spawn(async move {
            match directory.mark_delivered(&id).await {
                Ok(()) => {
                    let _ = events.send(GatewayEvent::Delivered(id)).await;
                }
                Err(e) => tracing::warn!("gateway: mark delivered {id} failed: {e}"),
            }
        }));
    }

    fn stop(&mut self) {
        for h in self.push.take().into_iter().chain(self.pull.take()) {
            h.abort();
        }
        for h in self.marks.drain(..) {
            h.abort();
        }
    }

    /// Cancel every gateway task and wait for them to finish.
    pub async fn shutdown(&mut self) {
        self.reachable = false;
        let handles: Vec<JoinHandle<()>> = self
            .push
            .take()
            .into_iter()
            .chain(self.pull.take())
            .chain(self.marks.drain(..))
            .collect();
        for h in handles {
            h.abort();
            let _ = h.await;
        }
    }
}

async fn push(directory: Arc<dyn DirectoryService>, cached: Vec<Message>) {
    for message in cached {
        if let Err(e) = directory.upload(&message).await {
            tracing::warn!("gateway: upload {} failed: {e}", message.id);
        }
    }
}

async fn pull(directory: Arc<dyn DirectoryService>, username: String, events: mpsc::Sender<GatewayEvent>) {
    let mut rx = match directory.subscribe_pending(&username).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!("gateway: subscribe failed: {e}");
            return;
        }
    };
    while let Some(batch) = rx.recv().await {
        if events.send(GatewayEvent::Pending(batch)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use std::time::Duration;

    fn msg(id: &str, receiver: &str) -> Message {
        let mut m = Message::new("x", receiver, id, 1);
        m.id = id.to_string();
        m
    }

    #[tokio::test]
    async fn reachable_pushes_and_pulls() {
        let dir = MemoryDirectory::new();
        dir.insert(msg("in1", "alice")).await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut gw = GatewaySync::new(Arc::new(dir.clone()), "alice", tx);

        assert!(gw.set_reachable(true, vec![msg("out1", "bob")]));
        assert!(!gw.set_reachable(true, Vec::new()));

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(GatewayEvent::Pending(batch)) => assert_eq!(batch[0].id, "in1"),
            other => panic!("expected pending batch, got {other:?}"),
        }
        gw.mark_delivered("in1".into());
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(GatewayEvent::Delivered(id)) => {
                    assert_eq!(id, "in1");
                    break;
                }
                Some(GatewayEvent::Pending(_)) => continue,
                None => panic!("channel closed"),
            }
        }
        assert_eq!(dir.uploaded_ids().await, vec!["out1".to_string()]);
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_stops_pull() {
        let dir = MemoryDirectory::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut gw = GatewaySync::new(Arc::new(dir.clone()), "alice", tx);
        gw.set_reachable(true, Vec::new());
        assert!(gw.set_reachable(false, Vec::new()));
        tokio::task::yield_now().await;
        dir.insert(msg("late", "alice")).await;
        let r = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(r.is_err());
        gw.mark_delivered("late".into());
        assert!(dir.marked_ids().await.is_empty());
    }
}
