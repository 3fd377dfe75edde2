//! Sealdrop: end-to-end encrypted file sharing and vault storage.
//!
//! Clients encrypt files into chunked XChaCha20-Poly1305 containers and
//! upload them frame by frame. The server tracks quota in SQLite, stores the
//! ciphertext on an [`services::backend::ObjectBackend`], and hands frames
//! back by public path until the download limit or expiration is reached.

pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
