//! Core data models for the encrypted file drop.
//!
//! These entities map cleanly to database tables via `sqlx::FromRow`.

pub mod account;
pub mod object;
pub mod upload;
