//! Media attached to incoming messages.
//!
//! [`SourceMedia`] is the shape a chat client hands to the recorder;
//! [`MediaInfo`] is what gets persisted in the `media_info` JSON column.
//! [`classify`] maps one to the other. Only photos, geo points, contacts,
//! documents, and explicitly unsupported media are kept. Everything else
//! (web pages, polls, dice, ...) is recorded as [`MediaInfo::None`].
//!
//! File references are opaque byte strings and are stored base64-encoded
//! with the standard alphabet.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ============ Persisted form ============

/// Media payload stored alongside a message.
///
/// Serialized with a `"type"` discriminant, e.g.
/// `{"type":"photo","id":1,"access_hash":2,"file_reference_base64":"AQI="}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaInfo {
    #[default]
    None,
    Photo(Photo),
    Geo(GeoPoint),
    Contact(Contact),
    Unsupported,
    Documents { documents: Vec<Document> },
}

impl MediaInfo {
    pub fn is_none(&self) -> bool {
        matches!(self, MediaInfo::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub long: f64,
    pub lat: f64,
    pub access_hash: i64,
    #[serde(default)]
    pub accuracy_radius: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub phone_number: String,
    pub first_name: String,
    pub last_name: String,
    pub vcard: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    #[default]
    File,
    Animated,
    Sticker,
    Video,
    Audio,
    CustomEmoji,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference_base64: String,
    pub mime_type: String,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// ============ Source form ============

/// Media as delivered by the chat client, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceMedia {
    Empty,
    /// The photo may be absent when the platform only sent a placeholder.
    Photo {
        #[serde(default)]
        photo: Option<SourcePhoto>,
    },
    Geo {
        #[serde(default)]
        point: Option<SourceGeoPoint>,
    },
    Contact {
        #[serde(default)]
        phone_number: String,
        #[serde(default)]
        first_name: String,
        #[serde(default)]
        last_name: String,
        #[serde(default)]
        vcard: String,
        #[serde(default)]
        user_id: i64,
    },
    Unsupported,
    Document {
        #[serde(default)]
        documents: Vec<SourceDocument>,
    },
    WebPage,
    Venue,
    Game,
    Invoice,
    GeoLive,
    Poll,
    Dice,
    Story,
    Giveaway,
    GiveawayResults,
    PaidMedia,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePhoto {
    pub id: i64,
    pub access_hash: i64,
    #[serde(default)]
    pub file_reference: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceGeoPoint {
    pub long: f64,
    pub lat: f64,
    #[serde(default)]
    pub access_hash: i64,
    #[serde(default)]
    pub accuracy_radius: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: i64,
    pub access_hash: i64,
    #[serde(default)]
    pub file_reference: Vec<u8>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub attributes: Vec<DocumentAttribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentAttribute {
    Animated,
    Sticker,
    Video,
    Audio,
    CustomEmoji,
    Filename {
        file_name: String,
    },
    #[serde(other)]
    Other,
}

// ============ Classification ============

/// Map source media to its persisted form.
///
/// `msg_id` is only used for log fields.
pub fn classify(msg_id: i32, media: Option<&SourceMedia>) -> MediaInfo {
    let Some(media) = media else {
        return MediaInfo::None;
    };
    match media {
        SourceMedia::Empty => {
            tracing::debug!(msg_id, "empty media");
            MediaInfo::None
        }
        SourceMedia::Photo { photo } => match photo {
            Some(p) => MediaInfo::Photo(Photo {
                id: p.id,
                access_hash: p.access_hash,
                file_reference_base64: encode_reference(&p.file_reference),
            }),
            None => {
                tracing::debug!(msg_id, "photo media without photo");
                MediaInfo::None
            }
        },
        SourceMedia::Geo { point } => match point {
            Some(g) => MediaInfo::Geo(GeoPoint {
                long: g.long,
                lat: g.lat,
                access_hash: g.access_hash,
                accuracy_radius: g.accuracy_radius.unwrap_or_default(),
            }),
            None => {
                tracing::debug!(msg_id, "geo media without point");
                MediaInfo::None
            }
        },
        SourceMedia::Contact {
            phone_number,
            first_name,
            last_name,
            vcard,
            user_id,
        } => MediaInfo::Contact(Contact {
            phone_number: phone_number.clone(),
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            vcard: vcard.clone(),
            user_id: *user_id,
        }),
        SourceMedia::Unsupported => MediaInfo::Unsupported,
        SourceMedia::Document { documents } => {
            let documents: Vec<Document> = documents.iter().map(classify_document).collect();
            if documents.is_empty() {
                tracing::debug!(msg_id, "document media without documents");
                MediaInfo::None
            } else {
                MediaInfo::Documents { documents }
            }
        }
        SourceMedia::Unknown => {
            tracing::warn!(msg_id, "unknown media type");
            MediaInfo::None
        }
        other => {
            tracing::debug!(msg_id, media = ?other, "media not recorded");
            MediaInfo::None
        }
    }
}

fn classify_document(doc: &SourceDocument) -> Document {
    let mut kind = DocumentKind::File;
    let mut filename = None;
    for attr in &doc.attributes {
        match attr {
            DocumentAttribute::Animated => kind = DocumentKind::Animated,
            DocumentAttribute::Sticker => kind = DocumentKind::Sticker,
            DocumentAttribute::Video => kind = DocumentKind::Video,
            DocumentAttribute::Audio => kind = DocumentKind::Audio,
            DocumentAttribute::CustomEmoji => kind = DocumentKind::CustomEmoji,
            DocumentAttribute::Filename { file_name } => filename = Some(file_name.clone()),
            DocumentAttribute::Other => {
                tracing::debug!(document_id = doc.id, "unsupported document attribute")
            }
        }
    }
    Document {
        id: doc.id,
        access_hash: doc.access_hash,
        file_reference_base64: encode_reference(&doc.file_reference),
        mime_type: doc.mime_type.clone(),
        kind,
        filename,
    }
}

fn encode_reference(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_media_is_none() {
        assert_eq!(classify(1, None), MediaInfo::None);
        assert_eq!(classify(1, Some(&SourceMedia::Empty)), MediaInfo::None);
    }

    #[test]
    fn test_photo_reference_is_base64() {
        let media = SourceMedia::Photo {
            photo: Some(SourcePhoto {
                id: 10,
                access_hash: 20,
                file_reference: vec![1, 2, 3],
            }),
        };
        match classify(1, Some(&media)) {
            MediaInfo::Photo(p) => {
                assert_eq!(p.id, 10);
                assert_eq!(p.file_reference_base64, "AQID");
            }
            other => panic!("expected photo, got {:?}", other),
        }
    }

    #[test]
    fn test_placeholders_are_dropped() {
        assert!(classify(1, Some(&SourceMedia::Photo { photo: None })).is_none());
        assert!(classify(1, Some(&SourceMedia::Geo { point: None })).is_none());
        assert!(classify(1, Some(&SourceMedia::Document { documents: vec![] })).is_none());
    }

    #[test]
    fn test_ignored_kinds_record_nothing() {
        for media in [
            SourceMedia::WebPage,
            SourceMedia::Poll,
            SourceMedia::Dice,
            SourceMedia::PaidMedia,
            SourceMedia::Unknown,
        ] {
            assert!(classify(1, Some(&media)).is_none());
        }
        assert_eq!(
            classify(1, Some(&SourceMedia::Unsupported)),
            MediaInfo::Unsupported
        );
    }

    #[test]
    fn test_document_kind_last_attribute_wins() {
        let media = SourceMedia::Document {
            documents: vec![
                SourceDocument {
                    id: 1,
                    access_hash: 2,
                    file_reference: vec![],
                    mime_type: "video/mp4".into(),
                    attributes: vec![
                        DocumentAttribute::Video,
                        DocumentAttribute::Filename {
                            file_name: "clip.mp4".into(),
                        },
                        DocumentAttribute::Animated,
                    ],
                },
                SourceDocument {
                    id: 3,
                    access_hash: 4,
                    file_reference: vec![],
                    mime_type: "application/pdf".into(),
                    attributes: vec![DocumentAttribute::Other],
                },
            ],
        };
        let MediaInfo::Documents { documents } = classify(1, Some(&media)) else {
            panic!("expected documents");
        };
        assert_eq!(documents[0].kind, DocumentKind::Animated);
        assert_eq!(documents[0].filename.as_deref(), Some("clip.mp4"));
        assert_eq!(documents[1].kind, DocumentKind::File);
        assert_eq!(documents[1].filename, None);
    }

    #[test]
    fn test_source_media_from_json() {
        let media: SourceMedia = serde_json::from_str(
            r#"{"kind":"document","documents":[{"id":1,"access_hash":2,
                "attributes":[{"kind":"sticker"},{"kind":"image_size"}]}]}"#,
        )
        .unwrap();
        let MediaInfo::Documents { documents } = classify(1, Some(&media)) else {
            panic!("expected documents");
        };
        assert_eq!(documents[0].kind, DocumentKind::Sticker);

        let unknown: SourceMedia = serde_json::from_str(r#"{"kind":"todo_list"}"#).unwrap();
        assert_eq!(unknown, SourceMedia::Unknown);
    }

    #[test]
    fn test_persisted_shape_is_tagged() {
        let info = MediaInfo::Contact(Contact {
            phone_number: "+100".into(),
            first_name: "Ada".into(),
            last_name: String::new(),
            vcard: String::new(),
            user_id: 5,
        });
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "contact");
        assert_eq!(json["user_id"], 5);
        assert_eq!(
            serde_json::to_value(MediaInfo::None).unwrap(),
            serde_json::json!({"type": "none"})
        );
    }
}
