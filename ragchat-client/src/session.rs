//! Active session lifecycle

use parking_lot::RwLock;
use ragchat_core::session::{Session, SessionStore};
use ragchat_core::utils::short_id;
use ragchat_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::transport::{Backend, EventChannel};

/// Owns the single active session id and its durable copy
pub struct SessionManager {
    backend: Arc<dyn Backend>,
    store: Arc<dyn SessionStore>,
    active: RwLock<Option<Session>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            backend,
            store,
            active: RwLock::new(None),
        }
    }

    /// Reuse the stored session if the backend still knows it, otherwise
    /// create a new one.
    pub async fn resume(&self) -> Result<Session> {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read stored session: {}", e);
                None
            }
        };

        if let Some(id) = stored {
            let valid = match self.backend.validate_session(&id).await {
                Ok(valid) => valid,
                Err(e) => {
                    warn!("Session validation failed, treating as invalid: {}", e);
                    false
                }
            };

            if valid {
                let session = match self.backend.session_info(&id).await {
                    Ok(info) if info.id == id => Session::from(info),
                    Ok(_) => Session::new(id.clone()),
                    Err(e) => {
                        debug!("Session info unavailable: {}", e);
                        Session::new(id.clone())
                    }
                };
                info!("Resumed session {}", short_id(&session.id));
                *self.active.write() = Some(session.clone());
                return Ok(session);
            }

            info!("Stored session {} is no longer valid", short_id(&id));
            if let Err(e) = self.store.remove() {
                warn!("Failed to discard stored session: {}", e);
            }
        }

        self.create().await
    }

    /// Ask the backend for a new session and make it active
    pub async fn create(&self) -> Result<Session> {
        match self.backend.create_session().await {
            Ok(id) => {
                let session = Session::new(id);
                if let Err(e) = self.store.save(&session.id) {
                    warn!("Failed to persist session: {}", e);
                }
                info!("Created session {}", short_id(&session.id));
                *self.active.write() = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                warn!("Failed to create session: {}", e);
                *self.active.write() = None;
                Err(Error::Session("Failed to initialize chat session".to_string()))
            }
        }
    }

    /// Leave the current room, forget the session locally and obtain a new
    /// one. The old session is not deleted on the backend.
    pub async fn reset(&self, events: &dyn EventChannel) -> Result<Session> {
        let old = self.active.write().take();
        if let Some(old) = old {
            if let Err(e) = events.leave_room(&old.id) {
                debug!("Could not leave room {}: {}", short_id(&old.id), e);
            }
            info!("Discarding session {}", short_id(&old.id));
        }
        if let Err(e) = self.store.remove() {
            warn!("Failed to discard stored session: {}", e);
        }
        self.resume().await
    }

    /// Adopt a session id pushed by the backend. Returns whether it differs
    /// from the active one.
    pub fn adopt_pushed(&self, session_id: &str) -> bool {
        let changed = {
            let mut active = self.active.write();
            match active.as_mut() {
                Some(session) if session.id == session_id => {
                    session.touch();
                    false
                }
                _ => {
                    *active = Some(Session::new(session_id));
                    true
                }
            }
        };
        if let Err(e) = self.store.save(session_id) {
            warn!("Failed to persist session: {}", e);
        }
        if changed {
            info!("Backend assigned session {}", short_id(session_id));
        }
        changed
    }

    /// Record activity on the active session
    pub fn touch(&self) {
        if let Some(session) = self.active.write().as_mut() {
            session.touch();
        }
    }

    pub fn active(&self) -> Option<Session> {
        self.active.read().clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().as_ref().map(|s| s.id.clone())
    }
}
