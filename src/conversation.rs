//! Per-channel conversation state: document binding, model history, inbox.

use crate::llm::ChatMessage;
use crate::ChannelId;
use std::collections::HashMap;

/// Conversation state for one incident channel.
///
/// `history` is the full context sent to the model on every completion call.
/// It is append-only and never truncated — a long-lived incident channel grows
/// its context without bound, which is an accepted limitation.
#[derive(Debug)]
pub struct Conversation {
    /// Backing document, set once at bootstrap and immutable thereafter.
    pub document_id: String,
    /// Role-tagged message history (user, assistant, tool). The system
    /// instruction is not stored here; it is added at call time.
    pub history: Vec<ChatMessage>,
    /// Raw text events awaiting model processing.
    inbox: Vec<String>,
}

/// Process-wide map of active incident conversations.
///
/// Owned by the scheduler; there are no ambient globals and no external
/// persistence. A process restart loses all conversations.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ChannelId, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.conversations.contains_key(channel)
    }

    /// Register a new conversation bound to a freshly provisioned document.
    pub fn create(&mut self, channel: ChannelId, document_id: String) {
        self.conversations.insert(
            channel,
            Conversation {
                document_id,
                history: Vec::new(),
                inbox: Vec::new(),
            },
        );
    }

    /// Append a raw text event to the channel's inbox.
    pub fn enqueue(&mut self, channel: &ChannelId, text: impl Into<String>) {
        if let Some(conversation) = self.conversations.get_mut(channel) {
            conversation.inbox.push(text.into());
        } else {
            tracing::warn!(channel_id = %channel, "enqueue for unknown channel dropped");
        }
    }

    /// Remove one pending inbox item.
    ///
    /// Drains from the tail (most-recently-enqueued first), matching the
    /// shipped behavior: processing order is the reverse of arrival order.
    pub fn pop(&mut self, channel: &ChannelId) -> Option<String> {
        self.conversations.get_mut(channel)?.inbox.pop()
    }

    pub fn document_id(&self, channel: &ChannelId) -> Option<&str> {
        self.conversations
            .get(channel)
            .map(|c| c.document_id.as_str())
    }

    pub fn append_history(&mut self, channel: &ChannelId, message: ChatMessage) {
        if let Some(conversation) = self.conversations.get_mut(channel) {
            conversation.history.push(message);
        }
    }

    pub fn history(&self, channel: &ChannelId) -> Option<&[ChatMessage]> {
        self.conversations
            .get(channel)
            .map(|c| c.history.as_slice())
    }

    /// Snapshot of all known channel ids, for sweeping.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.conversations.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str) -> ChannelId {
        ChannelId::from(id)
    }

    #[test]
    fn pop_drains_most_recent_first() {
        let mut store = ConversationStore::new();
        let chan = channel("C1");
        store.create(chan.clone(), "doc-1".into());

        store.enqueue(&chan, "Alice: service is down");
        store.enqueue(&chan, "Bob: we see 500s");

        assert_eq!(store.pop(&chan).as_deref(), Some("Bob: we see 500s"));
        assert_eq!(store.pop(&chan).as_deref(), Some("Alice: service is down"));
        assert_eq!(store.pop(&chan), None);
    }

    #[test]
    fn each_item_is_removed_exactly_once() {
        let mut store = ConversationStore::new();
        let chan = channel("C1");
        store.create(chan.clone(), "doc-1".into());

        for i in 0..5 {
            store.enqueue(&chan, format!("msg {i}"));
        }

        let mut drained = Vec::new();
        while let Some(item) = store.pop(&chan) {
            drained.push(item);
        }

        assert_eq!(drained.len(), 5);
        drained.sort();
        drained.dedup();
        assert_eq!(drained.len(), 5);
    }

    #[test]
    fn history_appends_in_order() {
        let mut store = ConversationStore::new();
        let chan = channel("C1");
        store.create(chan.clone(), "doc-1".into());

        store.append_history(&chan, ChatMessage::user("first"));
        store.append_history(&chan, ChatMessage::user("second"));

        let history = store.history(&chan).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content.as_deref(), Some("first"));
        assert_eq!(history[1].content.as_deref(), Some("second"));
    }

    #[test]
    fn unknown_channel_is_absent() {
        let mut store = ConversationStore::new();
        let chan = channel("C404");
        assert!(!store.contains(&chan));
        assert_eq!(store.pop(&chan), None);
        assert_eq!(store.document_id(&chan), None);
    }
}
