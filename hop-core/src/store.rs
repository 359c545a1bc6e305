//! Message store: append-only, dedup-by-id log of delivered messages in arrival order.

use std::collections::HashMap;

use crate::protocol::Message;

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    /// Message id -> index into `messages`.
    index: HashMap<String, usize>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless the id is already present. Returns true if appended.
    pub fn append(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    /// Set the delivered flag once the directory confirmed delivery. Returns false if unknown.
    pub fn mark_delivered(&mut self, id: &str) -> bool {
        match self.index.get(id) {
            Some(&i) => {
                self.messages[i].delivered = true;
                true
            }
            None => false,
        }
    }

    /// All messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
