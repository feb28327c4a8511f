//! Ingestion recorder: persist dialogs and messages from the chat stream.
//!
//! Each incoming event is handled independently:
//!
//! ```text
//! ChatEvent ──► observed filter ──► dialog section (lock)
//!                                     │ absent → create
//!                                     │ stale  → refresh title
//!                                     │ fresh  → skip
//!                                     ▼
//!                                 classify media ──► insert message
//! ```
//!
//! A failed dialog write aborts the event. A failed message write is
//! reported but leaves the dialog write in place. Duplicate deliveries are
//! detected by the store and logged as warnings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use telemikiya_core::clock::{Clock, SystemClock};
use telemikiya_core::dialog::ChatPeer;
use telemikiya_core::media::{classify, SourceMedia};
use telemikiya_core::models::{Dialog, InsertOutcome, NewMessage};
use telemikiya_core::store::Store;
use telemikiya_core::Error;

use crate::config::Config;
use crate::dialog_lock::DialogLocks;

/// A message as delivered by the chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub msg_id: i32,
    #[serde(default)]
    pub text: String,
    /// Accepts unix seconds or an RFC 3339 timestamp.
    #[serde(with = "unix_or_rfc3339")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub media: Option<SourceMedia>,
}

/// One line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub peer: ChatPeer,
    pub message: IncomingMessage,
}

/// What [`Recorder::record`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The dialog is not in the observed list.
    Ignored,
    Stored(uuid::Uuid),
    Duplicate,
}

/// What happened to the dialog row while recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogAction {
    Created,
    Refreshed,
    Fresh,
}

pub struct Recorder {
    store: Arc<dyn Store>,
    locks: DialogLocks,
    clock: Arc<dyn Clock>,
    observed: Vec<i64>,
    refresh_interval: chrono::Duration,
}

impl Recorder {
    pub fn new(store: Arc<dyn Store>, observed: Vec<i64>, refresh_interval: Duration) -> Self {
        Self {
            store,
            locks: DialogLocks::new(),
            clock: Arc::new(SystemClock),
            observed,
            refresh_interval: chrono::Duration::from_std(refresh_interval)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &Config) -> Self {
        Self::new(
            store,
            config.telegram.observed_dialog_ids.clone(),
            config.telegram.dialog_update_interval(),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record one event.
    pub async fn record(&self, peer: &ChatPeer, message: &IncomingMessage) -> Result<RecordOutcome> {
        let dialog_id = peer.dialog_id()?;
        if !self.observed.is_empty() && !self.observed.contains(&dialog_id) {
            tracing::trace!(dialog_id, "dialog not observed");
            return Ok(RecordOutcome::Ignored);
        }

        let action = self
            .ensure_dialog(peer, dialog_id)
            .await
            .with_context(|| format!("Failed to record dialog {}", dialog_id))?;
        tracing::debug!(dialog_id, ?action, "dialog checked");

        let new_message = NewMessage {
            msg_id: message.msg_id,
            dialog_id,
            text: message.text.clone(),
            media_info: classify(message.msg_id, message.media.as_ref()),
            sent_at: message.date,
        };

        match self.store.insert_message(&new_message).await {
            Ok(InsertOutcome::Inserted(id)) => {
                tracing::debug!(dialog_id, msg_id = message.msg_id, %id, "message stored");
                Ok(RecordOutcome::Stored(id))
            }
            Ok(InsertOutcome::Duplicate) => {
                tracing::warn!(dialog_id, msg_id = message.msg_id, "duplicate message");
                Ok(RecordOutcome::Duplicate)
            }
            Err(e) => {
                tracing::error!(dialog_id, msg_id = message.msg_id, error = %e, "failed to store message");
                Err(e.context(format!(
                    "Failed to store message {} in dialog {}",
                    message.msg_id, dialog_id
                )))
            }
        }
    }

    async fn ensure_dialog(&self, peer: &ChatPeer, id: i64) -> Result<DialogAction> {
        let _section = self.locks.lock(id).await;

        let now = self.clock.now();
        match self.store.dialog_updated_at(id).await? {
            None => {
                let dialog = Dialog {
                    id,
                    title: peer.title(),
                    dialog_type: peer.dialog_type(),
                    updated_at: now,
                };
                match self.store.create_dialog(&dialog).await {
                    Ok(()) => {
                        tracing::info!(dialog_id = id, title = %dialog.title, "new dialog");
                        Ok(DialogAction::Created)
                    }
                    // Another writer sharing the database got there first.
                    Err(e) if e.downcast_ref::<Error>() == Some(&Error::DialogExists(id)) => {
                        tracing::debug!(dialog_id = id, "dialog created elsewhere");
                        Ok(DialogAction::Fresh)
                    }
                    Err(e) => Err(e),
                }
            }
            Some(updated_at) if now - updated_at >= self.refresh_interval => {
                let title = peer.title();
                self.store.update_dialog_title(id, &title, now).await?;
                tracing::debug!(dialog_id = id, %title, "dialog refreshed");
                Ok(DialogAction::Refreshed)
            }
            Some(_) => Ok(DialogAction::Fresh),
        }
    }
}

mod unix_or_rfc3339 {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unix(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(date.timestamp())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Unix(secs) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", secs))),
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(de::Error::custom),
        }
    }
}
