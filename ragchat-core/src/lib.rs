//! Core types and utilities for ragchat
//!
//! This crate provides the data model, push-event protocol, error taxonomy,
//! configuration and logging shared by the client engine and the CLI.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;
pub mod utils;

pub use error::{Error, ErrorInfo, Result};
