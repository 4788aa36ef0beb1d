//! Ordered conversation history
//!
//! The timeline is the only owner of the message sequence. Entries are keyed
//! by id and never duplicated; the optimistic user echo can be confirmed or
//! rolled back through the handle returned when it was placed.

use chrono::{DateTime, Utc};
use ragchat_core::session::{ChatMessage, Role, StreamState};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Handle to an optimistically placed message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollbackHandle {
    local_id: String,
}

impl RollbackHandle {
    /// Locally generated id the message was placed under
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[derive(Debug, Clone)]
struct Optimistic {
    /// Id the message currently lives under (server id once confirmed)
    current_id: String,
    confirmed: bool,
}

/// Change to an assistant message's content
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPatch {
    Append(String),
    Replace(String),
}

/// Partial update of an assistant message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<ContentPatch>,
    pub state: Option<StreamState>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentPatch::Append(text.into())),
            ..Default::default()
        }
    }

    pub fn state(state: StreamState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(ContentPatch::Replace(text.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Outcome of [`Timeline::upsert_assistant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Ignored,
}

/// Ordered, id-unique message sequence
#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<ChatMessage>,
    optimistic: HashMap<String, Optimistic>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a locally created message at the end
    pub fn append_optimistic(&mut self, message: ChatMessage) -> RollbackHandle {
        let handle = RollbackHandle {
            local_id: message.id.clone(),
        };
        self.optimistic.insert(
            message.id.clone(),
            Optimistic {
                current_id: message.id.clone(),
                confirmed: false,
            },
        );
        if self.position(&message.id).is_none() {
            self.messages.push(message);
        }
        handle
    }

    /// Remove an optimistic message that was never confirmed.
    /// Returns whether anything was removed.
    pub fn rollback(&mut self, handle: &RollbackHandle) -> bool {
        let entry = match self.optimistic.get(&handle.local_id) {
            Some(entry) if !entry.confirmed => entry.clone(),
            _ => return false,
        };
        self.optimistic.remove(&handle.local_id);
        match self.position(&entry.current_id) {
            Some(index) => {
                self.messages.remove(index);
                debug!(id = %entry.current_id, "optimistic message rolled back");
                true
            }
            None => false,
        }
    }

    /// Mark an optimistic message as accepted by the backend, adopting the
    /// server id and timestamp when given. A server id that already names
    /// another entry is not adopted.
    pub fn confirm(
        &mut self,
        handle: &RollbackHandle,
        server_id: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let current_id = match self.optimistic.get(&handle.local_id) {
            Some(entry) if !entry.confirmed => entry.current_id.clone(),
            _ => return false,
        };
        let Some(index) = self.position(&current_id) else {
            return false;
        };

        let mut new_id = current_id;
        if let Some(server_id) = server_id {
            if self.position(server_id).is_none() {
                new_id = server_id.to_string();
            }
        }

        let message = &mut self.messages[index];
        message.id = new_id.clone();
        message.stream_state = StreamState::None;
        if let Some(timestamp) = timestamp {
            message.timestamp = timestamp;
        }

        if let Some(entry) = self.optimistic.get_mut(&handle.local_id) {
            entry.current_id = new_id;
            entry.confirmed = true;
        }
        true
    }

    /// Mark a confirmed user message as failed so the turn keeps its error
    /// state after the reply never arrived. Unconfirmed messages are left for
    /// `rollback`.
    pub fn mark_failed(&mut self, handle: &RollbackHandle) -> bool {
        let current_id = match self.optimistic.get(&handle.local_id) {
            Some(entry) if entry.confirmed => entry.current_id.clone(),
            _ => return false,
        };
        match self.position(&current_id) {
            Some(index) => {
                self.messages[index].stream_state = StreamState::Failed;
                true
            }
            None => false,
        }
    }

    /// Whether the optimistic message behind `handle` has been confirmed
    pub fn is_confirmed(&self, handle: &RollbackHandle) -> bool {
        self.optimistic
            .get(&handle.local_id)
            .map(|entry| entry.confirmed)
            .unwrap_or(false)
    }

    /// Insert an assistant message or merge a patch into it.
    ///
    /// Once a message is `complete` or `failed` it no longer changes.
    pub fn upsert_assistant(&mut self, id: &str, session_id: &str, patch: MessagePatch) -> Upsert {
        match self.position(id) {
            Some(index) => {
                let message = &mut self.messages[index];
                if message.role != Role::Assistant || message.stream_state.is_final() {
                    return Upsert::Ignored;
                }
                match patch.content {
                    Some(ContentPatch::Append(text)) => message.content.push_str(&text),
                    Some(ContentPatch::Replace(text)) => message.content = text,
                    None => {}
                }
                if let Some(state) = patch.state {
                    message.stream_state = state;
                }
                if let Some(timestamp) = patch.timestamp {
                    message.timestamp = timestamp;
                }
                Upsert::Updated
            }
            None => {
                let content = match patch.content {
                    Some(ContentPatch::Append(text)) | Some(ContentPatch::Replace(text)) => text,
                    None => String::new(),
                };
                let mut message = ChatMessage::assistant(id, session_id, content);
                if let Some(state) = patch.state {
                    message = message.with_state(state);
                }
                if let Some(timestamp) = patch.timestamp {
                    message.timestamp = timestamp;
                }
                self.messages.push(message);
                Upsert::Inserted
            }
        }
    }

    /// Supersede the whole sequence. Later duplicates of an id are dropped.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        let mut seen = HashSet::new();
        self.messages = messages
            .into_iter()
            .filter(|message| seen.insert(message.id.clone()))
            .collect();
        self.optimistic.clear();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.optimistic.clear();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }
}
