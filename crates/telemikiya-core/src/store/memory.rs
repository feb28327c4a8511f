//! In-memory [`Store`] implementation for testing.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Semantic search is brute-force cosine distance over every embedded
//! message. Lexical search is a case-insensitive term match scored by the
//! number of matching terms, standing in for the full-text index.
//!
//! The store also implements [`SchemaExecutor`] against a [`Schema`] model
//! so migrations can be exercised end to end.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::embedding::cosine_distance;
use crate::error::Error;
use crate::models::{
    Dialog, InsertOutcome, Message, NewMessage, PendingText, RankedCandidate, SearchFilter,
};
use crate::schema::guard::SchemaExecutor;
use crate::schema::{Plan, Schema};

use super::{assign_ranks, Store};

/// In-memory store for tests.
pub struct InMemoryStore {
    dialogs: RwLock<HashMap<i64, Dialog>>,
    messages: RwLock<Vec<Message>>,
    schema: RwLock<Schema>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            dialogs: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            schema: RwLock::new(Schema::default()),
        }
    }

    /// Snapshot of every stored dialog.
    pub fn dialogs(&self) -> Vec<Dialog> {
        let dialogs = self.dialogs.read().unwrap_or_else(PoisonError::into_inner);
        dialogs.values().cloned().collect()
    }

    /// Snapshot of every stored message, in insertion order.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn dialog_updated_at(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let dialogs = self.dialogs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(dialogs.get(&id).map(|d| d.updated_at))
    }

    async fn create_dialog(&self, dialog: &Dialog) -> Result<()> {
        let mut dialogs = self.dialogs.write().unwrap_or_else(PoisonError::into_inner);
        if dialogs.contains_key(&dialog.id) {
            return Err(Error::DialogExists(dialog.id).into());
        }
        dialogs.insert(dialog.id, dialog.clone());
        Ok(())
    }

    async fn update_dialog_title(
        &self,
        id: i64,
        title: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut dialogs = self.dialogs.write().unwrap_or_else(PoisonError::into_inner);
        let dialog = dialogs.get_mut(&id).ok_or(Error::DialogNotFound(id))?;
        dialog.title = title.to_string();
        dialog.updated_at = dialog.updated_at.max(updated_at);
        Ok(())
    }

    async fn get_dialogs(&self, ids: &[i64]) -> Result<Vec<Dialog>> {
        let dialogs = self.dialogs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids.iter().filter_map(|id| dialogs.get(id).cloned()).collect())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome> {
        if !self
            .dialogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&message.dialog_id)
        {
            return Err(Error::DialogNotFound(message.dialog_id).into());
        }
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        if messages
            .iter()
            .any(|m| m.msg_id == message.msg_id && m.dialog_id == message.dialog_id)
        {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = Uuid::new_v4();
        messages.push(Message {
            id,
            msg_id: message.msg_id,
            dialog_id: message.dialog_id,
            text: message.text.clone(),
            text_embedding: None,
            has_media: message.has_media(),
            media_info: message.media_info.clone(),
            sent_at: message.sent_at,
        });
        Ok(InsertOutcome::Inserted(id))
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingText>> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut pending: Vec<&Message> = messages
            .iter()
            .filter(|m| m.text_embedding.is_none())
            .collect();
        pending.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|m| PendingText {
                id: m.id,
                text: m.text.clone(),
            })
            .collect())
    }

    async fn set_text_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| anyhow::anyhow!("message {} not found", id))?;
        message.text_embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn lexical_search(
        &self,
        pattern: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>> {
        let pattern_lower = pattern.to_lowercase();
        let terms: Vec<&str> = pattern_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(&Message, usize)> = messages
            .iter()
            .filter(|m| filter.accepts(m.dialog_id, m.sent_at))
            .filter_map(|m| {
                let text_lower = m.text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                (matches > 0).then_some((m, matches))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
        scored.truncate(limit);
        Ok(assign_ranks(scored, |(_, s)| *s)
            .into_iter()
            .map(|((m, _), rank)| RankedCandidate {
                message: m.clone(),
                rank,
            })
            .collect())
    }

    async fn semantic_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        max_distance: Option<f64>,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(&Message, f32)> = messages
            .iter()
            .filter(|m| filter.accepts(m.dialog_id, m.sent_at))
            .filter_map(|m| {
                let emb = m.text_embedding.as_deref()?;
                let dist = cosine_distance(query_vec, emb);
                match max_distance {
                    Some(max) if f64::from(dist) > max => None,
                    _ => Some((m, dist)),
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);
        Ok(assign_ranks(scored, |(_, d)| *d)
            .into_iter()
            .map(|((m, _), rank)| RankedCandidate {
                message: m.clone(),
                rank,
            })
            .collect())
    }
}

#[async_trait]
impl SchemaExecutor for InMemoryStore {
    async fn current_schema(&self) -> Result<Schema> {
        Ok(self
            .schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn apply(&self, plan: &Plan, clear_embeddings: bool) -> Result<u64> {
        let mut cleared = 0;
        if clear_embeddings {
            let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
            for m in messages.iter_mut() {
                if m.text_embedding.take().is_some() {
                    cleared += 1;
                }
            }
        }
        self.schema
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_plan(plan);
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaInfo;
    use crate::models::DialogType;
    use crate::schema::guard::migrate;
    use chrono::{Duration, TimeZone};

    fn dialog(id: i64) -> Dialog {
        Dialog {
            id,
            title: format!("dialog {}", id),
            dialog_type: DialogType::User,
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn msg(dialog_id: i64, msg_id: i32, text: &str) -> NewMessage {
        NewMessage {
            msg_id,
            dialog_id,
            text: text.to_string(),
            media_info: MediaInfo::None,
            sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, msg_id as u32).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dialog_create_is_unique() {
        let store = InMemoryStore::new();
        store.create_dialog(&dialog(1)).await.unwrap();
        let err = store.create_dialog(&dialog(1)).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::DialogExists(1)));
    }

    #[tokio::test]
    async fn test_dialog_updated_at_never_moves_back() {
        let store = InMemoryStore::new();
        let d = dialog(1);
        store.create_dialog(&d).await.unwrap();
        store
            .update_dialog_title(1, "renamed", d.updated_at - Duration::days(1))
            .await
            .unwrap();
        let stored = &store.get_dialogs(&[1]).await.unwrap()[0];
        assert_eq!(stored.title, "renamed");
        assert_eq!(stored.updated_at, d.updated_at);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_reported() {
        let store = InMemoryStore::new();
        store.create_dialog(&dialog(1)).await.unwrap();
        assert!(matches!(
            store.insert_message(&msg(1, 5, "hi")).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.insert_message(&msg(1, 5, "hi again")).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_message_requires_dialog() {
        let store = InMemoryStore::new();
        assert!(store.insert_message(&msg(9, 1, "orphan")).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_is_oldest_first_and_shrinks() {
        let store = InMemoryStore::new();
        store.create_dialog(&dialog(1)).await.unwrap();
        for i in (1..=3).rev() {
            store.insert_message(&msg(1, i, "text")).await.unwrap();
        }
        let pending = store.pending_embeddings(2).await.unwrap();
        assert_eq!(pending.len(), 2);
        store.set_text_embedding(pending[0].id, &[1.0]).await.unwrap();
        let after = store.pending_embeddings(10).await.unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|p| p.id != pending[0].id));
    }

    #[tokio::test]
    async fn test_lexical_empty_pattern_matches_nothing() {
        let store = InMemoryStore::new();
        store.create_dialog(&dialog(1)).await.unwrap();
        store.insert_message(&msg(1, 1, "hello")).await.unwrap();
        let filter = SearchFilter::default();
        assert!(store.lexical_search("", 10, &filter).await.unwrap().is_empty());
        assert!(store.lexical_search("  ", 10, &filter).await.unwrap().is_empty());
        assert_eq!(store.lexical_search("HELLO", 10, &filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_semantic_skips_unembedded_and_respects_cutoff() {
        let store = InMemoryStore::new();
        store.create_dialog(&dialog(1)).await.unwrap();
        for i in 1..=3 {
            store.insert_message(&msg(1, i, "t")).await.unwrap();
        }
        let ids: Vec<Uuid> = store.messages().iter().map(|m| m.id).collect();
        store.set_text_embedding(ids[0], &[1.0, 0.0]).await.unwrap();
        store.set_text_embedding(ids[1], &[0.0, 1.0]).await.unwrap();

        let filter = SearchFilter::default();
        let all = store.semantic_search(&[1.0, 0.0], 10, None, &filter).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message.id, ids[0]);
        assert_eq!(all[0].rank, 1);
        assert_eq!(all[1].rank, 2);

        let close = store
            .semantic_search(&[1.0, 0.0], 10, Some(0.5), &filter)
            .await
            .unwrap();
        assert_eq!(close.len(), 1);
    }

    #[tokio::test]
    async fn test_migration_clears_embeddings_with_consent() {
        let store = InMemoryStore::new();
        migrate(&store, 768, false).await.unwrap();
        store.create_dialog(&dialog(1)).await.unwrap();
        store.insert_message(&msg(1, 1, "a")).await.unwrap();
        let id = store.messages()[0].id;
        store.set_text_embedding(id, &vec![0.1; 768]).await.unwrap();

        assert!(migrate(&store, 1536, false).await.is_err());
        assert!(store.messages()[0].text_embedding.is_some());

        let report = migrate(&store, 1536, true).await.unwrap();
        assert_eq!(report.cleared_embeddings, 1);
        assert!(store.messages()[0].text_embedding.is_none());
        assert_eq!(store.pending_embeddings(10).await.unwrap().len(), 1);
    }
}
