use std::collections::HashSet;

use crate::lifecycle::ChatMessage;

/// The chat list a view renders: ordered by `created_at`, unique by id.
///
/// Both the local optimistic insert and the server push of the same row land
/// here; whichever arrives second is ignored.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a message with this id is already shown
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(position, message);
        true
    }

    /// Replace the whole list after a resync, keeping id uniqueness
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.clear();
        self.ids.clear();
        for message in messages {
            self.insert(message);
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
