//! # Counsel Common Library
//!
//! Shared code for the Counsel relay service:
//! - Error type and result alias
//! - Bootstrap configuration (TOML + overrides)
//! - Database schema and models
//! - Server-Sent Events wire frames

pub mod config;
pub mod db;
pub mod error;
pub mod sse;

pub use error::{Error, Result};
pub use sse::{DocumentRef, SseFrame};
