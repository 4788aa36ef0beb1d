//! Session and message data model
//!
//! The client holds exactly one durable session id. Messages are keyed by
//! id; the session id itself survives restarts through a [`SessionStore`].

pub mod persist;
pub mod store;

pub use persist::{FileSessionStore, MemorySessionStore, SessionStore, SESSION_KEY};
pub use store::{
    ChatMessage, Role, Session, SessionInfo, SourceMetadata, SourceResult, StreamState,
};
