//! Storage abstraction for Telemikiya.
//!
//! The [`Store`] trait defines every storage operation the recorder, the
//! indexer, and the searcher need, so the same pipeline runs against
//! PostgreSQL in production and [`memory::InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Dialog, InsertOutcome, NewMessage, PendingText, RankedCandidate, SearchFilter};

/// Abstract storage backend for Telemikiya.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`dialog_updated_at`](Store::dialog_updated_at) | Refresh check for a dialog |
/// | [`create_dialog`](Store::create_dialog) | First sighting of a dialog |
/// | [`update_dialog_title`](Store::update_dialog_title) | Periodic metadata refresh |
/// | [`get_dialogs`](Store::get_dialogs) | Attach dialogs to search hits |
/// | [`insert_message`](Store::insert_message) | Record a message once |
/// | [`pending_embeddings`](Store::pending_embeddings) | Indexer work queue |
/// | [`set_text_embedding`](Store::set_text_embedding) | Indexer write-back |
/// | [`lexical_search`](Store::lexical_search) | Full-text ranking |
/// | [`semantic_search`](Store::semantic_search) | Cosine-distance ranking |
#[async_trait]
pub trait Store: Send + Sync {
    /// `updated_at` of the dialog, or `None` if it was never recorded.
    async fn dialog_updated_at(&self, id: i64) -> Result<Option<DateTime<Utc>>>;

    /// Insert a new dialog.
    ///
    /// Fails with [`Error::DialogExists`](crate::Error::DialogExists) if
    /// the id is taken.
    async fn create_dialog(&self, dialog: &Dialog) -> Result<()>;

    /// Replace the title and bump `updated_at`. The type is never changed.
    ///
    /// `updated_at` is only ever moved forward.
    async fn update_dialog_title(&self, id: i64, title: &str, updated_at: DateTime<Utc>)
        -> Result<()>;

    /// Fetch dialogs by id. Unknown ids are skipped.
    async fn get_dialogs(&self, ids: &[i64]) -> Result<Vec<Dialog>>;

    /// Persist a message, leaving `text_embedding` empty.
    ///
    /// Returns [`InsertOutcome::Duplicate`] instead of an error when
    /// `(msg_id, dialog_id)` already exists.
    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome>;

    /// Up to `limit` messages whose embedding is still empty, oldest first.
    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingText>>;

    async fn set_text_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()>;

    /// Messages whose text matches `pattern`, best first, ranked from 1.
    ///
    /// An empty or whitespace-only pattern matches nothing.
    async fn lexical_search(
        &self,
        pattern: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>>;

    /// Embedded messages by ascending cosine distance to `query_vec`,
    /// ranked from 1. Rows farther than `max_distance` are dropped.
    async fn semantic_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        max_distance: Option<f64>,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>>;
}

/// Assign SQL `RANK()` positions to candidates already sorted best first.
///
/// Rows with equal keys share a rank and the next distinct key skips ahead,
/// so ranks can be `1, 1, 3`.
pub fn assign_ranks<T, K: PartialEq>(
    sorted: Vec<T>,
    key: impl Fn(&T) -> K,
) -> Vec<(T, usize)> {
    let mut out: Vec<(T, usize)> = Vec::with_capacity(sorted.len());
    for (pos, item) in sorted.into_iter().enumerate() {
        let rank = match out.last() {
            Some((prev, prev_rank)) if key(prev) == key(&item) => *prev_rank,
            _ => pos + 1,
        };
        out.push((item, rank));
    }
    out
}
