//! Chat engine
//!
//! [`ChatEngine`] is the context object a UI drives. It owns the session
//! manager, the timeline and the stream assembler, wires the push-event
//! handlers and turns user actions into backend calls. State lives behind one
//! lock that is never held across an await; async operations re-check the
//! active session after every await and drop results for a superseded one.

use parking_lot::Mutex;
use ragchat_core::config::ChatConfig;
use ragchat_core::events::{ClientCommand, ServerEvent, SERVER_EVENTS};
use ragchat_core::session::{ChatMessage, Session, SessionStore, SourceResult};
use ragchat_core::utils::short_id;
use ragchat_core::{Error, ErrorInfo, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::assembler::{Effect, StreamAssembler, TurnId};
use crate::session::SessionManager;
use crate::timeline::Timeline;
use crate::transport::{Backend, ConnectionState, EventChannel};

/// Notice shown while the event connection is down
pub const NOTICE_RECONNECTING: &str = "Connection lost. Trying to reconnect...";
/// Notice shown when the event connection cannot be established
pub const NOTICE_CONNECT_FAILED: &str = "Failed to connect to server";

/// Change notification for observers
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// Messages or sources changed
    Timeline,
    /// The active session changed
    Session(Option<String>),
    /// The in-flight turn finished; sends are accepted again
    TurnEnded,
    Connection(ConnectionState),
    Error(ErrorInfo),
}

/// Point-in-time copy of everything a UI renders
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub sources: Vec<SourceResult>,
    pub session: Option<Session>,
    pub busy: bool,
    pub connection: ConnectionState,
    pub notice: Option<String>,
    pub error: Option<ErrorInfo>,
}

struct ChatState {
    timeline: Timeline,
    assembler: StreamAssembler,
    connection: ConnectionState,
    notice: Option<String>,
    error: Option<ErrorInfo>,
}

struct Inner {
    sessions: SessionManager,
    backend: Arc<dyn Backend>,
    events: Arc<dyn EventChannel>,
    config: ChatConfig,
    state: Mutex<ChatState>,
    updates: broadcast::Sender<ChatUpdate>,
    wired: AtomicBool,
}

/// Session and streaming synchronization engine
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<Inner>,
}

impl ChatEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        events: Arc<dyn EventChannel>,
        store: Arc<dyn SessionStore>,
        config: ChatConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        let connection = events.state();
        Self {
            inner: Arc::new(Inner {
                sessions: SessionManager::new(Arc::clone(&backend), store),
                backend,
                events,
                config,
                state: Mutex::new(ChatState {
                    timeline: Timeline::new(),
                    assembler: StreamAssembler::new(),
                    connection,
                    notice: None,
                    error: None,
                }),
                updates,
                wired: AtomicBool::new(false),
            }),
        }
    }

    /// Wire handlers, connect, resume or create the session, join its room
    /// and load its history.
    ///
    /// A session failure is surfaced and returned; the engine stays usable and
    /// [`reset_session`](Self::reset_session) can retry.
    pub async fn start(&self) -> Result<Session> {
        self.wire();
        self.inner.events.connect();

        let session = match self.inner.sessions.resume().await {
            Ok(session) => session,
            Err(e) => {
                self.inner.surface(e.to_info());
                self.inner.notify(ChatUpdate::Session(None));
                return Err(e);
            }
        };

        self.inner.join(&session.id);
        self.inner.notify(ChatUpdate::Session(Some(session.id.clone())));
        self.load_history().await;
        Ok(session)
    }

    /// Register push-event and connection handlers. Runs once per engine.
    fn wire(&self) {
        if self.inner.wired.swap(true, Ordering::SeqCst) {
            return;
        }

        for name in SERVER_EVENTS {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            self.inner.events.on(
                name,
                Arc::new(move |data: &Value| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_event(name, data);
                    }
                }),
            );
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.events.on_state(Arc::new(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_connection(state);
            }
        }));
        debug!("chat engine handlers registered");
    }

    /// Send a user message.
    ///
    /// Refused with [`Error::Rejected`] when the text is blank, no session is
    /// active, or a reply is still in flight.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Rejected("Message is empty".to_string()));
        }
        let Some(session_id) = self.inner.sessions.active_id() else {
            return Err(Error::Rejected("No active session".to_string()));
        };

        let turn = {
            let mut state = self.inner.state.lock();
            if state.assembler.is_busy() {
                return Err(Error::Rejected("A reply is still in progress".to_string()));
            }
            state.error = None;
            let ChatState {
                timeline,
                assembler,
                ..
            } = &mut *state;
            let handle = timeline.append_optimistic(ChatMessage::user(&session_id, text));
            match assembler.begin(&session_id, handle.clone()) {
                Some(turn) => turn,
                None => {
                    timeline.rollback(&handle);
                    return Err(Error::Rejected("A reply is still in progress".to_string()));
                }
            }
        };
        self.inner.notify(ChatUpdate::Timeline);
        self.inner.sessions.touch();

        let command = ClientCommand::SendMessageStream {
            message: text.to_string(),
            session_id: Some(session_id.clone()),
        };
        match self.inner.events.emit(command.name(), command.payload()) {
            Ok(()) => {
                debug!(session = %short_id(&session_id), "message sent for streaming");
                Ok(())
            }
            Err(e) if self.inner.config.http_fallback => {
                info!("Event connection unavailable ({}), sending over HTTP", e);
                self.send_direct(turn, text, &session_id).await
            }
            Err(e) => {
                warn!("Failed to send message: {}", e);
                let effects = self.inner.with_parts(|timeline, assembler| {
                    assembler.abort(turn, timeline, e.to_info())
                });
                self.inner.apply_effects(effects);
                Err(e)
            }
        }
    }

    async fn send_direct(&self, turn: TurnId, text: &str, session_id: &str) -> Result<()> {
        match self.inner.backend.send_message(text, Some(session_id)).await {
            Ok(reply) => {
                if self.inner.sessions.active_id().as_deref() != Some(session_id) {
                    debug!("reply for a superseded session dropped");
                    return Ok(());
                }
                if !reply.session_id.is_empty() && reply.session_id != session_id {
                    self.inner
                        .apply_effects(vec![Effect::AdoptSession(reply.session_id.clone())]);
                }
                let sources = reply.sources.unwrap_or_default();
                let effects = self.inner.with_parts(|timeline, assembler| {
                    assembler.complete_direct(
                        turn,
                        timeline,
                        &reply.message_id,
                        &reply.response,
                        sources,
                    )
                });
                self.inner.apply_effects(effects);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send message: {}", e);
                let effects = self.inner.with_parts(|timeline, assembler| {
                    assembler.abort(turn, timeline, e.to_info())
                });
                self.inner.apply_effects(effects);
                Err(e)
            }
        }
    }

    /// Remove the server-side history of the active session and empty the
    /// local view
    pub async fn clear_chat(&self) -> Result<()> {
        let Some(session_id) = self.inner.sessions.active_id() else {
            return Err(Error::Rejected("No active session".to_string()));
        };

        if let Err(e) = self.inner.backend.clear_session(&session_id).await {
            warn!("Failed to clear chat: {}", e);
            self.inner.surface(e.to_info());
            return Err(e);
        }
        if self.inner.sessions.active_id().as_deref() != Some(session_id.as_str()) {
            debug!("clear finished after the session changed");
            return Ok(());
        }

        self.inner.discard_local();
        info!("Cleared chat for session {}", short_id(&session_id));
        Ok(())
    }

    /// Abandon the active session locally and start a fresh one
    pub async fn reset_session(&self) -> Result<Session> {
        self.inner.discard_local();

        let session = match self.inner.sessions.reset(self.inner.events.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                self.inner.surface(e.to_info());
                self.inner.notify(ChatUpdate::Session(None));
                return Err(e);
            }
        };

        self.inner.discard_local();
        self.inner.join(&session.id);
        self.inner.notify(ChatUpdate::Session(Some(session.id.clone())));
        self.load_history().await;
        Ok(session)
    }

    /// Replace the timeline with the backend's history. Failures are logged
    /// only.
    pub async fn load_history(&self) {
        let Some(session_id) = self.inner.sessions.active_id() else {
            return;
        };
        if self.is_busy() {
            debug!("history load skipped while a reply is in flight");
            return;
        }

        let history = match self
            .inner
            .backend
            .get_history(&session_id, self.inner.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load chat history: {}", e);
                return;
            }
        };

        if self.inner.sessions.active_id().as_deref() != Some(session_id.as_str()) {
            debug!("history for a superseded session dropped");
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.assembler.is_busy() {
                debug!("history dropped, a reply started meanwhile");
                return;
            }
            let messages = history.messages.into_iter().map(ChatMessage::settled).collect();
            state.timeline.replace_all(messages);
            debug!(count = state.timeline.len(), "history loaded");
        }
        self.inner.notify(ChatUpdate::Timeline);
    }

    /// Leave the session room and close the event connection
    pub fn shutdown(&self) {
        if let Some(id) = self.inner.sessions.active_id() {
            if self.inner.events.state() == ConnectionState::Open {
                if let Err(e) = self.inner.events.leave_room(&id) {
                    debug!("Could not leave room: {}", e);
                }
            }
        }
        self.inner.events.disconnect();
        info!("Chat engine stopped");
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let session = self.inner.sessions.active();
        let state = self.inner.state.lock();
        ChatSnapshot {
            messages: state.timeline.messages().to_vec(),
            sources: state.assembler.sources().to_vec(),
            session,
            busy: state.assembler.is_busy(),
            connection: state.connection,
            notice: state.notice.clone(),
            error: state.error.clone(),
        }
    }

    /// Take the pending error, if any. Each error is returned once.
    pub fn take_error(&self) -> Option<ErrorInfo> {
        self.inner.state.lock().error.take()
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChatUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().assembler.is_busy()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.sessions.active()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.sessions.active_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }
}

impl Inner {
    fn handle_event(&self, name: &str, data: &Value) {
        let event = match ServerEvent::parse(name, data) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(event = name, "Malformed push payload dropped: {}", e);
                return;
            }
        };

        let active = self.sessions.active_id();
        let effects = self.with_parts(|timeline, assembler| {
            assembler.apply(event, timeline, active.as_deref())
        });
        self.apply_effects(effects);
    }

    fn handle_connection(&self, connection: ConnectionState) {
        let notice = match connection {
            ConnectionState::Open => {
                if let Some(id) = self.sessions.active_id() {
                    self.join(&id);
                }
                None
            }
            ConnectionState::Closed => Some(NOTICE_RECONNECTING.to_string()),
            ConnectionState::Errored => Some(NOTICE_CONNECT_FAILED.to_string()),
            ConnectionState::Connecting => self.state.lock().notice.clone(),
        };
        {
            let mut state = self.state.lock();
            state.connection = connection;
            state.notice = notice;
        }
        self.notify(ChatUpdate::Connection(connection));
    }

    fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Changed => self.notify(ChatUpdate::Timeline),
                Effect::AdoptSession(id) => {
                    let previous = self.sessions.active_id();
                    if self.sessions.adopt_pushed(&id) {
                        if let Some(previous) = previous {
                            if let Err(e) = self.events.leave_room(&previous) {
                                debug!("Could not leave room {}: {}", short_id(&previous), e);
                            }
                        }
                        self.join(&id);
                        self.notify(ChatUpdate::Session(Some(id)));
                    }
                }
                Effect::Surface(info) => self.surface(info),
                Effect::TurnEnded => self.notify(ChatUpdate::TurnEnded),
            }
        }
    }

    fn with_parts<T>(&self, f: impl FnOnce(&mut Timeline, &mut StreamAssembler) -> T) -> T {
        let mut state = self.state.lock();
        let ChatState {
            timeline,
            assembler,
            ..
        } = &mut *state;
        f(timeline, assembler)
    }

    /// Join a session room if the connection is up; otherwise the next
    /// `Open` transition does it.
    fn join(&self, session_id: &str) {
        if self.events.state() != ConnectionState::Open {
            return;
        }
        match self.events.join_room(session_id) {
            Ok(()) => debug!(session = %short_id(session_id), "joined session room"),
            Err(e) => warn!("Failed to join session room: {}", e),
        }
    }

    fn discard_local(&self) {
        {
            let mut state = self.state.lock();
            state.timeline.clear();
            state.assembler.reset();
            state.error = None;
        }
        self.notify(ChatUpdate::Timeline);
    }

    fn surface(&self, info: ErrorInfo) {
        self.state.lock().error = Some(info.clone());
        self.notify(ChatUpdate::Error(info));
    }

    fn notify(&self, update: ChatUpdate) {
        let _ = self.updates.send(update);
    }
}
