//! # Telemikiya Core
//!
//! Runtime-agnostic logic for Telemikiya: chat data models, dialog
//! identity mapping, media classification, the store abstraction, the
//! hybrid fusion algorithm, schema planning with the embedding guard,
//! and the embedding provider trait.
//!
//! This crate contains no sqlx, HTTP client, or filesystem I/O. The
//! `telemikiya` app crate supplies the PostgreSQL store, the provider
//! implementations, and the long-running workers.

pub mod clock;
pub mod dialog;
pub mod embedding;
pub mod error;
pub mod media;
pub mod models;
pub mod schema;
pub mod search;
pub mod store;

pub use error::Error;
