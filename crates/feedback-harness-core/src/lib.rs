//! # Feedback Harness Core
//!
//! Runtime-free logic for Feedback Harness: the opportunity data model,
//! error taxonomy, similarity capability, the dedup/merge decision, search
//! ranking, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network code.
//! The `feedback-harness` app crate supplies the SQLite store, the
//! embedding providers, and the single-writer service around [`dedup`].

pub mod dedup;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
pub mod summary;

pub use error::KbError;
