//! # Telemikiya
//!
//! Records chat messages as they arrive, embeds them in the background,
//! and answers hybrid (semantic + full-text) searches over the archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────────────────┐
//! │ Chat events │──▶│ Recorder │──▶│ PostgreSQL           │
//! │ (JSON-lines)│   └──────────┘   │ pgvector + pgroonga  │
//! └─────────────┘                  └───┬──────────────▲───┘
//!                                      │              │
//!                      ┌───────────────┤              │
//!                      ▼               ▼              │
//!                 ┌──────────┐   ┌──────────┐   ┌─────┴─────┐
//!                 │ Searcher │   │ Indexer  │──▶│ Embedding │
//!                 └──────────┘   └──────────┘   │ provider  │
//!                                               └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! telemikiya db migrate               # create or update the schema
//! telemikiya run --file events.jsonl  # record events and embed them
//! telemikiya search "release notes" --count 5
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | PostgreSQL connection pool |
//! | [`pg_store`] | PostgreSQL storage backend |
//! | [`migrate`] | Guarded schema migrations |
//! | [`embedding`] | Embedding providers and registry |
//! | [`dialog_lock`] | Per-dialog exclusive sections |
//! | [`recorder`] | Dialog and message ingestion |
//! | [`ingest`] | JSON-lines event source |
//! | [`indexer`] | Background embedding loop |
//! | [`search`] | Hybrid search front end |
//!
//! Storage-independent logic (models, fusion, schema planning) lives in
//! the `telemikiya-core` crate.

pub mod config;
pub mod db;
pub mod dialog_lock;
pub mod embedding;
pub mod indexer;
pub mod ingest;
pub mod migrate;
pub mod pg_store;
pub mod recorder;
pub mod search;
