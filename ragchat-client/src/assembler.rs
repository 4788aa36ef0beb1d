//! Turns push events into timeline mutations
//!
//! The assembler tracks at most one turn: the user message that was just sent
//! and, once the backend starts answering, the assistant message being
//! streamed. It knows nothing about sockets; the engine feeds it decoded
//! [`ServerEvent`]s together with the timeline and the active session id.

use chrono::Utc;
use ragchat_core::events::{ServerEvent, StreamChunk, StreamComplete, StreamFailure, StreamStart};
use ragchat_core::session::{SourceResult, StreamState};
use ragchat_core::{Error, ErrorInfo};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::timeline::{MessagePatch, RollbackHandle, Timeline, Upsert};

/// Something the engine must act on after an event was applied
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Timeline or sources changed
    Changed,
    /// The backend assigned a session id to the turn
    AdoptSession(String),
    /// An error to show the user once
    Surface(ErrorInfo),
    /// The turn is over; the engine is no longer busy
    TurnEnded,
}

/// Identifier of one send, used to match late async results to their turn
pub type TurnId = u64;

#[derive(Debug)]
struct Turn {
    id: TurnId,
    session_id: String,
    user: RollbackHandle,
    assistant_id: Option<String>,
}

/// Chunk bookkeeping for one streaming assistant message
#[derive(Debug, Default)]
struct Progress {
    next_seq: u64,
    buffered: BTreeMap<u64, String>,
}

impl Progress {
    /// Accept a chunk and return the text that can be appended now, in order
    fn accept(&mut self, chunk: StreamChunk) -> Option<String> {
        let Some(seq) = chunk.seq else {
            return Some(chunk.content);
        };
        if seq < self.next_seq || self.buffered.contains_key(&seq) {
            debug!(message_id = %chunk.message_id, seq, "duplicate chunk ignored");
            return None;
        }
        self.buffered.insert(seq, chunk.content);

        let mut ready = String::new();
        while let Some(text) = self.buffered.remove(&self.next_seq) {
            ready.push_str(&text);
            self.next_seq += 1;
        }
        (!ready.is_empty()).then_some(ready)
    }

    /// Whatever is still buffered, in index order, skipping gaps
    fn drain(&mut self) -> String {
        std::mem::take(&mut self.buffered).into_values().collect()
    }
}

/// Per-turn stream state machine
#[derive(Debug, Default)]
pub struct StreamAssembler {
    turn: Option<Turn>,
    progress: HashMap<String, Progress>,
    sources: Vec<SourceResult>,
    next_turn: TurnId,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A turn is pending or streaming
    pub fn is_busy(&self) -> bool {
        self.turn.is_some()
    }

    /// Sources of the most recent exchange
    pub fn sources(&self) -> &[SourceResult] {
        &self.sources
    }

    /// Id of the assistant message currently streaming, if any
    pub fn streaming_id(&self) -> Option<&str> {
        self.turn.as_ref().and_then(|turn| turn.assistant_id.as_deref())
    }

    /// Start a turn for an optimistic user message. Clears sources.
    /// Returns `None` when a turn is already in flight.
    pub fn begin(&mut self, session_id: &str, user: RollbackHandle) -> Option<TurnId> {
        if self.turn.is_some() {
            return None;
        }
        self.next_turn += 1;
        self.sources.clear();
        self.turn = Some(Turn {
            id: self.next_turn,
            session_id: session_id.to_string(),
            user,
            assistant_id: None,
        });
        Some(self.next_turn)
    }

    /// Forget the turn, all progress and sources
    pub fn reset(&mut self) {
        self.turn = None;
        self.progress.clear();
        self.sources.clear();
    }

    /// Finish a turn with a complete answer obtained without streaming
    pub fn complete_direct(
        &mut self,
        turn_id: TurnId,
        timeline: &mut Timeline,
        message_id: &str,
        content: &str,
        sources: Vec<SourceResult>,
    ) -> Vec<Effect> {
        let Some(turn) = self.take_turn(turn_id) else {
            return Vec::new();
        };
        timeline.confirm(&turn.user, None, None);
        timeline.upsert_assistant(
            message_id,
            &turn.session_id,
            MessagePatch::state(StreamState::Complete)
                .with_content(content)
                .with_timestamp(Utc::now()),
        );
        self.sources = sources.into_iter().map(SourceResult::normalized).collect();
        vec![Effect::Changed, Effect::TurnEnded]
    }

    /// Abandon a turn whose send failed before the backend saw it
    pub fn abort(&mut self, turn_id: TurnId, timeline: &mut Timeline, error: ErrorInfo) -> Vec<Effect> {
        let Some(turn) = self.take_turn(turn_id) else {
            return Vec::new();
        };
        timeline.rollback(&turn.user);
        vec![Effect::Changed, Effect::Surface(error), Effect::TurnEnded]
    }

    /// Apply one push event
    pub fn apply(
        &mut self,
        event: ServerEvent,
        timeline: &mut Timeline,
        active_session: Option<&str>,
    ) -> Vec<Effect> {
        if !matches!(event, ServerEvent::Session(_)) {
            if let (Some(declared), Some(active)) = (event.declared_session(), active_session) {
                if declared != active {
                    debug!(event = event.name(), declared, active, "event for another session dropped");
                    return Vec::new();
                }
            }
        }

        match event {
            ServerEvent::Session(assigned) => match self.turn.as_mut() {
                Some(turn) => {
                    turn.session_id = assigned.session_id.clone();
                    vec![Effect::AdoptSession(assigned.session_id)]
                }
                None => {
                    debug!(session_id = %assigned.session_id, "session assignment outside a turn dropped");
                    Vec::new()
                }
            },
            ServerEvent::UserMessage(ack) => match self.turn.as_ref() {
                Some(turn) if timeline.confirm(&turn.user, Some(&ack.message_id), ack.timestamp) => {
                    vec![Effect::Changed]
                }
                _ => Vec::new(),
            },
            ServerEvent::Sources(update) => {
                let declared_match = update.session_id.is_some();
                if self.turn.is_none() && !declared_match {
                    debug!("sources outside a turn dropped");
                    return Vec::new();
                }
                self.sources = update.sources.into_iter().map(SourceResult::normalized).collect();
                vec![Effect::Changed]
            }
            ServerEvent::Start(start) => self.on_start(start, timeline, active_session),
            ServerEvent::Chunk(chunk) => self.on_chunk(chunk, timeline),
            ServerEvent::Complete(complete) => self.on_complete(complete, timeline),
            ServerEvent::Error(failure) => self.on_error(failure, timeline),
        }
    }

    fn on_start(
        &mut self,
        start: StreamStart,
        timeline: &mut Timeline,
        active_session: Option<&str>,
    ) -> Vec<Effect> {
        if timeline.contains(&start.message_id) {
            debug!(message_id = %start.message_id, "redelivered stream-start ignored");
            return Vec::new();
        }
        let Some(turn) = self.turn.as_mut() else {
            debug!(message_id = %start.message_id, "stream-start without a pending turn dropped");
            return Vec::new();
        };
        if turn.assistant_id.is_some() || Some(turn.session_id.as_str()) != active_session {
            debug!(message_id = %start.message_id, "stream-start does not match the pending turn");
            return Vec::new();
        }

        let inserted = timeline.upsert_assistant(
            &start.message_id,
            &turn.session_id,
            MessagePatch::state(StreamState::Streaming),
        );
        if inserted != Upsert::Inserted {
            return Vec::new();
        }
        turn.assistant_id = Some(start.message_id.clone());
        self.progress.insert(start.message_id, Progress::default());
        vec![Effect::Changed]
    }

    fn on_chunk(&mut self, chunk: StreamChunk, timeline: &mut Timeline) -> Vec<Effect> {
        let message_id = chunk.message_id.clone();
        let Some(progress) = self.progress.get_mut(&message_id) else {
            debug!(message_id = %message_id, "chunk for unknown message dropped");
            return Vec::new();
        };
        let Some(text) = progress.accept(chunk) else {
            return Vec::new();
        };
        match timeline.upsert_assistant(&message_id, "", MessagePatch::append(text)) {
            Upsert::Updated => vec![Effect::Changed],
            _ => Vec::new(),
        }
    }

    fn on_complete(&mut self, complete: StreamComplete, timeline: &mut Timeline) -> Vec<Effect> {
        let Some(mut progress) = self.progress.remove(&complete.message_id) else {
            debug!(message_id = %complete.message_id, "completion for unknown message dropped");
            return Vec::new();
        };
        let rest = progress.drain();
        let mut patch = MessagePatch::state(StreamState::Complete)
            .with_timestamp(complete.timestamp.unwrap_or_else(Utc::now));
        if !rest.is_empty() {
            warn!(message_id = %complete.message_id, "stream completed with missing chunks");
            patch.content = Some(crate::timeline::ContentPatch::Append(rest));
        }

        let mut effects = Vec::new();
        if timeline.upsert_assistant(&complete.message_id, "", patch) == Upsert::Updated {
            effects.push(Effect::Changed);
        }
        if self.streaming_id() == Some(complete.message_id.as_str()) {
            self.turn = None;
            effects.push(Effect::TurnEnded);
        }
        effects
    }

    fn on_error(&mut self, failure: StreamFailure, timeline: &mut Timeline) -> Vec<Effect> {
        let Some(turn) = self.turn.take() else {
            debug!(error = %failure.error, "stream error outside a turn dropped");
            return Vec::new();
        };

        let err = Error::Stream {
            message: failure.error.clone(),
            detail: failure.detail_text(),
        };
        let info = err.to_info();
        warn!(error = %failure.error, detail = ?info.detail, "stream failed");

        match turn.assistant_id {
            Some(id) => {
                self.progress.remove(&id);
                timeline.upsert_assistant(&id, "", MessagePatch::state(StreamState::Failed));
            }
            None => {
                if !timeline.rollback(&turn.user) {
                    timeline.mark_failed(&turn.user);
                }
            }
        }
        vec![Effect::Changed, Effect::Surface(info), Effect::TurnEnded]
    }

    fn take_turn(&mut self, turn_id: TurnId) -> Option<Turn> {
        match &self.turn {
            Some(turn) if turn.id == turn_id => self.turn.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragchat_core::session::ChatMessage;
    use serde_json::json;

    const SESSION: &str = "s1";

    fn event(name: &str, data: serde_json::Value) -> ServerEvent {
        ServerEvent::parse(name, &data).unwrap().unwrap()
    }

    fn start(id: &str) -> ServerEvent {
        event("stream-start", json!({ "messageId": id }))
    }

    fn chunk(id: &str, content: &str) -> ServerEvent {
        event("stream-chunk", json!({ "messageId": id, "content": content }))
    }

    fn seq_chunk(id: &str, content: &str, seq: u64) -> ServerEvent {
        event("stream-chunk", json!({ "messageId": id, "content": content, "seq": seq }))
    }

    fn complete(id: &str) -> ServerEvent {
        event(
            "stream-complete",
            json!({ "messageId": id, "timestamp": "2024-05-01T12:00:00Z" }),
        )
    }

    fn begin(assembler: &mut StreamAssembler, timeline: &mut Timeline, text: &str) -> TurnId {
        let handle = timeline.append_optimistic(ChatMessage::user(SESSION, text));
        assembler.begin(SESSION, handle).unwrap()
    }

    #[test]
    fn test_ping_pong_stream() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");

        assert_eq!(assembler.apply(start("m1"), &mut timeline, Some(SESSION)), vec![Effect::Changed]);
        assert_eq!(timeline.get("m1").unwrap().content, "");
        assembler.apply(chunk("m1", "pon"), &mut timeline, Some(SESSION));
        assembler.apply(chunk("m1", "g"), &mut timeline, Some(SESSION));
        assert!(assembler.is_busy());

        let effects = assembler.apply(complete("m1"), &mut timeline, Some(SESSION));
        assert_eq!(effects, vec![Effect::Changed, Effect::TurnEnded]);
        assert!(!assembler.is_busy());

        let reply = timeline.get("m1").unwrap();
        assert_eq!(reply.content, "pong");
        assert_eq!(reply.stream_state, StreamState::Complete);
        assert_eq!(reply.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(timeline.messages()[0].content, "ping");
    }

    #[test]
    fn test_chunks_concatenate_in_arrival_order() {
        let parts = ["The ", "quick ", "", "brown ", "fox", " ✓"];
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "q");
        assembler.apply(start("m1"), &mut timeline, Some(SESSION));
        for part in parts {
            assembler.apply(chunk("m1", part), &mut timeline, Some(SESSION));
        }
        assembler.apply(complete("m1"), &mut timeline, Some(SESSION));
        assert_eq!(timeline.get("m1").unwrap().content, parts.concat());
    }

    #[test]
    fn test_sequenced_chunks_reordered() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "q");
        assembler.apply(start("m1"), &mut timeline, Some(SESSION));

        assembler.apply(seq_chunk("m1", "c", 2), &mut timeline, Some(SESSION));
        assert_eq!(timeline.get("m1").unwrap().content, "");
        assembler.apply(seq_chunk("m1", "a", 0), &mut timeline, Some(SESSION));
        assert_eq!(timeline.get("m1").unwrap().content, "a");
        assembler.apply(seq_chunk("m1", "a", 0), &mut timeline, Some(SESSION));
        assembler.apply(seq_chunk("m1", "b", 1), &mut timeline, Some(SESSION));
        assert_eq!(timeline.get("m1").unwrap().content, "abc");

        assembler.apply(seq_chunk("m1", "e", 4), &mut timeline, Some(SESSION));
        assembler.apply(complete("m1"), &mut timeline, Some(SESSION));
        assert_eq!(timeline.get("m1").unwrap().content, "abce");
    }

    #[test]
    fn test_error_before_start_rolls_back_user_message() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");

        let effects = assembler.apply(
            event("stream-error", json!({ "error": "LLM unavailable", "details": "timeout" })),
            &mut timeline,
            Some(SESSION),
        );
        assert!(timeline.is_empty());
        assert_eq!(
            effects,
            vec![
                Effect::Changed,
                Effect::Surface(ErrorInfo::new("LLM unavailable").with_detail("timeout")),
                Effect::TurnEnded,
            ]
        );
        assert!(!assembler.is_busy());
    }

    #[test]
    fn test_error_after_confirmation_marks_user_message_failed() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");
        assembler.apply(
            event(
                "stream-user-message",
                json!({ "messageId": "u1", "content": "ping", "timestamp": "2024-05-01T12:00:00Z" }),
            ),
            &mut timeline,
            Some(SESSION),
        );
        assembler.apply(event("stream-error", json!({})), &mut timeline, Some(SESSION));

        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.messages()[0].id, "u1");
        assert_eq!(timeline.messages()[0].stream_state, StreamState::Failed);
        assert!(!assembler.is_busy());
    }

    #[test]
    fn test_error_mid_stream_keeps_partial_content() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");
        assembler.apply(start("m1"), &mut timeline, Some(SESSION));
        assembler.apply(chunk("m1", "po"), &mut timeline, Some(SESSION));

        let effects = assembler.apply(event("stream-error", json!({})), &mut timeline, Some(SESSION));
        assert!(effects.contains(&Effect::Surface(ErrorInfo::new("Streaming failed"))));

        let reply = timeline.get("m1").unwrap();
        assert_eq!(reply.content, "po");
        assert_eq!(reply.stream_state, StreamState::Failed);
        assert!(assembler.apply(chunk("m1", "ng"), &mut timeline, Some(SESSION)).is_empty());
        assert_eq!(timeline.get("m1").unwrap().content, "po");
    }

    #[test]
    fn test_redelivered_start_is_noop() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");
        assembler.apply(start("m1"), &mut timeline, Some(SESSION));
        assembler.apply(chunk("m1", "pon"), &mut timeline, Some(SESSION));

        assert!(assembler.apply(start("m1"), &mut timeline, Some(SESSION)).is_empty());
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.get("m1").unwrap().content, "pon");
    }

    #[test]
    fn test_stray_events_without_turn_are_dropped() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();

        assert!(assembler.apply(start("old"), &mut timeline, Some(SESSION)).is_empty());
        assert!(assembler.apply(chunk("old", "x"), &mut timeline, Some(SESSION)).is_empty());
        assert!(assembler.apply(complete("old"), &mut timeline, Some(SESSION)).is_empty());
        assert!(assembler
            .apply(event("stream-error", json!({})), &mut timeline, Some(SESSION))
            .is_empty());
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_events_for_other_session_are_dropped() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");

        let foreign = event("stream-start", json!({ "messageId": "m1", "sessionId": "old" }));
        assert!(assembler.apply(foreign, &mut timeline, Some(SESSION)).is_empty());
        assert!(!timeline.contains("m1"));
    }

    #[test]
    fn test_session_assignment_follows_turn() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "ping");

        let effects = assembler.apply(
            event("stream-session", json!({ "sessionId": "s2" })),
            &mut timeline,
            Some(SESSION),
        );
        assert_eq!(effects, vec![Effect::AdoptSession("s2".to_string())]);

        assembler.apply(start("m1"), &mut timeline, Some("s2"));
        assert_eq!(timeline.get("m1").unwrap().session_id, "s2");
    }

    #[test]
    fn test_sources_replaced_and_cleared_on_begin() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "q");

        assembler.apply(
            event(
                "stream-sources",
                json!({ "sources": [{ "articleId": "a1", "content": "text", "score": 1.4, "metadata": {} }] }),
            ),
            &mut timeline,
            Some(SESSION),
        );
        assert_eq!(assembler.sources().len(), 1);
        assert_eq!(assembler.sources()[0].score, 1.0);

        assembler.apply(start("m1"), &mut timeline, Some(SESSION));
        assembler.apply(complete("m1"), &mut timeline, Some(SESSION));
        assert_eq!(assembler.sources().len(), 1);

        begin(&mut assembler, &mut timeline, "next");
        assert!(assembler.sources().is_empty());
    }

    #[test]
    fn test_begin_refused_while_busy() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        begin(&mut assembler, &mut timeline, "one");
        let handle = timeline.append_optimistic(ChatMessage::user(SESSION, "two"));
        assert!(assembler.begin(SESSION, handle).is_none());
    }

    #[test]
    fn test_complete_direct_and_abort_match_turn() {
        let mut assembler = StreamAssembler::new();
        let mut timeline = Timeline::new();
        let turn = begin(&mut assembler, &mut timeline, "ping");

        assert!(assembler
            .complete_direct(turn + 1, &mut timeline, "m1", "pong", Vec::new())
            .is_empty());
        let effects = assembler.complete_direct(turn, &mut timeline, "m1", "pong", Vec::new());
        assert!(effects.contains(&Effect::TurnEnded));
        assert_eq!(timeline.get("m1").unwrap().stream_state, StreamState::Complete);

        let turn = begin(&mut assembler, &mut timeline, "again");
        assembler.abort(turn, &mut timeline, ErrorInfo::new("offline"));
        assert_eq!(timeline.len(), 2);
        assert!(!assembler.is_busy());
    }
}
