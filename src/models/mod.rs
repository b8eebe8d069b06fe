//! Core data models for the upload pipeline.
//!
//! These entities represent stored object versions and queued messages.
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod message;
pub mod object;
