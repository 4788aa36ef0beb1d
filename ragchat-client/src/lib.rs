//! Session and streaming synchronization for ragchat
//!
//! This crate keeps a local chat view consistent with a RAG chat backend
//! that answers over a persistent event connection in incremental chunks.

pub mod assembler;
pub mod engine;
pub mod ingestion;
pub mod session;
pub mod timeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use assembler::{Effect, StreamAssembler};
pub use engine::{ChatEngine, ChatSnapshot, ChatUpdate};
pub use ingestion::{IngestionMonitor, IngestionStatus};
pub use session::SessionManager;
pub use timeline::{RollbackHandle, Timeline};
pub use transport::{
    Backend, ConnectionState, EventChannel, HttpBackend, IngestionSource, SocketChannel,
    Transport,
};
