//! Dialog identity: mapping chat-client peers to stored dialogs and back.
//!
//! Dialogs are keyed by their bot-API identifier, which folds the three
//! protocol peer kinds into one signed id space:
//!
//! | Peer | Bot-API id | Stored type |
//! |------|------------|-------------|
//! | user `u` | `u` | `user` |
//! | basic group `c` | `-c` | `group` |
//! | channel `c` (megagroup/gigagroup) | `ZERO_CHANNEL_ID - c` | `group` |
//! | channel `c` (broadcast) | `ZERO_CHANNEL_ID - c` | `channel` |
//!
//! [`to_protocol`] reverses the mapping for building deep links.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{Dialog, DialogType};

/// Offset applied to channel ids in the bot-API id space.
pub const ZERO_CHANNEL_ID: i64 = -1_000_000_000_000;

/// The conversation a message arrived in, as described by the chat client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatPeer {
    User {
        id: i64,
        #[serde(default)]
        first_name: String,
        #[serde(default)]
        last_name: String,
        #[serde(default)]
        username: Option<String>,
    },
    Chat {
        id: i64,
        #[serde(default)]
        title: String,
    },
    Channel {
        id: i64,
        #[serde(default)]
        title: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        megagroup: bool,
        #[serde(default)]
        gigagroup: bool,
    },
}

impl ChatPeer {
    /// Bot-API dialog id.
    ///
    /// Fails with [`Error::InvalidPeerId`] when the folded id does not fit
    /// in an `i64`.
    pub fn dialog_id(&self) -> Result<i64, Error> {
        match self {
            ChatPeer::User { id, .. } => Ok(*id),
            ChatPeer::Chat { id, .. } => id.checked_neg().ok_or(Error::InvalidPeerId(*id)),
            ChatPeer::Channel { id, .. } => ZERO_CHANNEL_ID
                .checked_sub(*id)
                .ok_or(Error::InvalidPeerId(*id)),
        }
    }

    pub fn dialog_type(&self) -> DialogType {
        match self {
            ChatPeer::User { .. } => DialogType::User,
            ChatPeer::Chat { .. } => DialogType::Group,
            ChatPeer::Channel {
                megagroup,
                gigagroup,
                ..
            } => {
                if *megagroup || *gigagroup {
                    DialogType::Group
                } else {
                    DialogType::Channel
                }
            }
        }
    }

    /// Human-readable title, with `(@username)` appended when public.
    pub fn title(&self) -> String {
        match self {
            ChatPeer::User {
                first_name,
                last_name,
                username,
                ..
            } => with_username(format!("{} {}", first_name, last_name), username),
            ChatPeer::Chat { title, .. } => title.clone(),
            ChatPeer::Channel {
                title, username, ..
            } => with_username(title.clone(), username),
        }
    }
}

fn with_username(title: String, username: &Option<String>) -> String {
    match username.as_deref() {
        Some(u) if !u.is_empty() => format!("{} (@{})", title, u),
        _ => title,
    }
}

/// Peer kind in the chat protocol's own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPeer {
    User,
    Chat,
    Channel,
}

/// Convert a bot-API dialog id back to the protocol id and peer kind.
///
/// Groups above [`ZERO_CHANNEL_ID`] are basic groups; the rest are
/// supergroups and live in the channel space.
pub fn to_protocol(
    dialog_id: i64,
    dialog_type: DialogType,
) -> Result<(i64, ProtocolPeer), Error> {
    let mapped = match dialog_type {
        DialogType::User => Some((dialog_id, ProtocolPeer::User)),
        DialogType::Group if dialog_id > ZERO_CHANNEL_ID => dialog_id
            .checked_neg()
            .map(|id| (id, ProtocolPeer::Chat)),
        DialogType::Group | DialogType::Channel => ZERO_CHANNEL_ID
            .checked_sub(dialog_id)
            .map(|id| (id, ProtocolPeer::Channel)),
    };
    mapped.ok_or(Error::InvalidPeerId(dialog_id))
}

/// Build a link that opens `msg_id` in `dialog` in a chat client.
///
/// Users and basic groups have no per-message link, so the link opens
/// the conversation itself.
pub fn deep_link(dialog: &Dialog, msg_id: i32) -> Result<String, Error> {
    Ok(match to_protocol(dialog.id, dialog.dialog_type)? {
        (id, ProtocolPeer::User | ProtocolPeer::Chat) => format!("tg://user?id={}", id),
        (id, ProtocolPeer::Channel) => format!("https://t.me/c/{}/{}", id, msg_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn channel(id: i64, megagroup: bool) -> ChatPeer {
        ChatPeer::Channel {
            id,
            title: "News".into(),
            username: Some("news".into()),
            megagroup,
            gigagroup: false,
        }
    }

    #[test]
    fn test_dialog_ids() {
        let user = ChatPeer::User {
            id: 777,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            username: None,
        };
        assert_eq!(user.dialog_id(), Ok(777));
        assert_eq!(ChatPeer::Chat { id: 55, title: "x".into() }.dialog_id(), Ok(-55));
        assert_eq!(channel(1234, false).dialog_id(), Ok(-1_000_000_001_234));
    }

    #[test]
    fn test_out_of_range_peer_ids_are_rejected() {
        let chat = ChatPeer::Chat {
            id: i64::MIN,
            title: "x".into(),
        };
        assert_eq!(chat.dialog_id(), Err(Error::InvalidPeerId(i64::MIN)));
        assert_eq!(
            channel(i64::MAX, false).dialog_id(),
            Err(Error::InvalidPeerId(i64::MAX))
        );
        assert_eq!(
            to_protocol(i64::MAX, DialogType::Channel),
            Err(Error::InvalidPeerId(i64::MAX))
        );

        let broken = Dialog {
            id: i64::MAX,
            title: "x".into(),
            dialog_type: DialogType::Channel,
            updated_at: Utc::now(),
        };
        assert!(deep_link(&broken, 1).is_err());
    }

    #[test]
    fn test_supergroups_are_groups() {
        assert_eq!(channel(1, true).dialog_type(), DialogType::Group);
        assert_eq!(channel(1, false).dialog_type(), DialogType::Channel);
        let giga = ChatPeer::Channel {
            id: 1,
            title: String::new(),
            username: None,
            megagroup: false,
            gigagroup: true,
        };
        assert_eq!(giga.dialog_type(), DialogType::Group);
    }

    #[test]
    fn test_titles() {
        let user = ChatPeer::User {
            id: 1,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            username: Some("ada".into()),
        };
        assert_eq!(user.title(), "Ada Lovelace (@ada)");
        let anonymous = ChatPeer::User {
            id: 1,
            first_name: "Ada".into(),
            last_name: String::new(),
            username: Some(String::new()),
        };
        assert_eq!(anonymous.title(), "Ada ");
        assert_eq!(channel(1, false).title(), "News (@news)");
    }

    #[test]
    fn test_protocol_mapping_reverses_dialog_id() {
        let peer = channel(1234, true);
        assert_eq!(
            to_protocol(peer.dialog_id().unwrap(), peer.dialog_type()),
            Ok((1234, ProtocolPeer::Channel))
        );
        let chat = ChatPeer::Chat { id: 55, title: String::new() };
        assert_eq!(
            to_protocol(chat.dialog_id().unwrap(), chat.dialog_type()),
            Ok((55, ProtocolPeer::Chat))
        );
    }

    #[test]
    fn test_deep_links() {
        let dialog = Dialog {
            id: ZERO_CHANNEL_ID - 1234,
            title: "News".into(),
            dialog_type: DialogType::Channel,
            updated_at: Utc::now(),
        };
        assert_eq!(deep_link(&dialog, 99).unwrap(), "https://t.me/c/1234/99");
        let user = Dialog {
            id: 777,
            dialog_type: DialogType::User,
            ..dialog
        };
        assert_eq!(deep_link(&user, 99).unwrap(), "tg://user?id=777");
    }
}
