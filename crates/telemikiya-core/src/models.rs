//! Core data models used throughout Telemikiya.
//!
//! These types represent the dialogs and messages that flow from the chat
//! stream through the recorder, the indexer, and the searcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::media::MediaInfo;

/// Kind of conversation a [`Dialog`] represents.
///
/// Supergroups (megagroups and gigagroups) are stored as [`DialogType::Group`];
/// only broadcast channels are [`DialogType::Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogType {
    User,
    Group,
    Channel,
}

impl DialogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogType::User => "user",
            DialogType::Group => "group",
            DialogType::Channel => "channel",
        }
    }
}

impl fmt::Display for DialogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialogType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(DialogType::User),
            "group" => Ok(DialogType::Group),
            "channel" => Ok(DialogType::Channel),
            other => Err(Error::UnknownDialogType(other.to_string())),
        }
    }
}

/// A conversation, keyed by its bot-API identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub dialog_type: DialogType,
    pub updated_at: DateTime<Utc>,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Generated at insert time.
    pub id: Uuid,
    /// Identifier assigned by the chat platform, unique within a dialog.
    pub msg_id: i32,
    pub dialog_id: i64,
    pub text: String,
    /// `None` until the indexer fills it.
    pub text_embedding: Option<Vec<f32>>,
    pub has_media: bool,
    pub media_info: MediaInfo,
    pub sent_at: DateTime<Utc>,
}

/// A message about to be persisted. The store assigns the UUID.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub msg_id: i32,
    pub dialog_id: i64,
    pub text: String,
    pub media_info: MediaInfo,
    pub sent_at: DateTime<Utc>,
}

impl NewMessage {
    /// `has_media` is derived, never set independently.
    pub fn has_media(&self) -> bool {
        !self.media_info.is_none()
    }
}

/// Result of [`Store::insert_message`](crate::store::Store::insert_message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// A row with the same `(msg_id, dialog_id)` already exists.
    Duplicate,
}

/// A message still waiting for its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingText {
    pub id: Uuid,
    pub text: String,
}

/// Restrictions shared by both search sub-queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Messages in this dialog are never returned (the bot's own chat).
    pub exclude_dialog_id: Option<i64>,
    /// Inclusive lower bound on `sent_at`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `sent_at`.
    pub end_time: Option<DateTime<Utc>>,
    /// Only return messages from this dialog.
    pub dialog_id: Option<i64>,
}

impl SearchFilter {
    /// Whether a message in `dialog_id` sent at `sent_at` passes the filter.
    pub fn accepts(&self, dialog_id: i64, sent_at: DateTime<Utc>) -> bool {
        if self.exclude_dialog_id == Some(dialog_id) {
            return false;
        }
        if let Some(start) = self.start_time {
            if sent_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if sent_at > end {
                return false;
            }
        }
        match self.dialog_id {
            Some(only) => only == dialog_id,
            None => true,
        }
    }
}

/// A candidate from one search sub-query, with its 1-based position.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub message: Message,
    pub rank: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dialog_type_roundtrip() {
        for t in [DialogType::User, DialogType::Group, DialogType::Channel] {
            assert_eq!(t.as_str().parse::<DialogType>().unwrap(), t);
        }
        assert_eq!(
            "supergroup".parse::<DialogType>(),
            Err(Error::UnknownDialogType("supergroup".into()))
        );
    }

    #[test]
    fn test_filter_bounds_are_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let filter = SearchFilter {
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        };
        assert!(filter.accepts(1, start));
        assert!(filter.accepts(1, end));
        assert!(!filter.accepts(1, end + chrono::Duration::seconds(1)));
        assert!(!filter.accepts(1, start - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_filter_excludes_bot_and_restricts_dialog() {
        let now = Utc::now();
        let filter = SearchFilter {
            exclude_dialog_id: Some(42),
            dialog_id: Some(7),
            ..Default::default()
        };
        assert!(!filter.accepts(42, now));
        assert!(!filter.accepts(8, now));
        assert!(filter.accepts(7, now));
    }
}
