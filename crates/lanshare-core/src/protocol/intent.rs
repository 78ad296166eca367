//! Client→server intents.
//!
//! One enum variant per mutation the store understands. The wire tag is the
//! snake_case intent name, payload fields are camelCase:
//! `{"type":"create_entry","payload":{"groupId":"..."}}`.
//!
//! Intents are idempotent-by-id where an id is supplied and silently ignored
//! by the store when the target is missing; the decoder's job here is purely
//! structural validation.

use crate::model::Timestamp;
use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};

/// Where to splice a new entry relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
    Before,
    After,
}

/// A single client-issued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Intent {
    #[serde(rename_all = "camelCase")]
    CreateGroup {
        title: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateGroup {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
        updated_at: Timestamp,
    },
    #[serde(rename_all = "camelCase")]
    DeleteGroup { id: String },
    #[serde(rename_all = "camelCase")]
    CreateEntry {
        group_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume_id: Option<String>,
    },
    /// Rematerialize an offline-created entry with its original content and
    /// timestamps (reconciler traffic, not a user-facing create).
    #[serde(rename_all = "camelCase")]
    CreateEntryWithContent {
        group_id: String,
        volume_id: String,
        title: String,
        content: String,
        created_at: Timestamp,
        updated_at: Timestamp,
    },
    #[serde(rename_all = "camelCase")]
    UpdateEntry {
        group_id: String,
        entry_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        updated_at: Timestamp,
    },
    #[serde(rename_all = "camelCase")]
    DeleteEntry { group_id: String, entry_id: String },
    #[serde(rename_all = "camelCase")]
    CloneEntry { group_id: String, entry_id: String },
    #[serde(rename_all = "camelCase")]
    InsertEntry {
        group_id: String,
        anchor_entry_id: String,
        position: InsertPosition,
    },
    #[serde(rename_all = "camelCase")]
    CreateVolume { group_id: String, title: String },
    #[serde(rename_all = "camelCase")]
    UpdateVolume {
        group_id: String,
        volume_id: String,
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteVolume { group_id: String, volume_id: String },
    #[serde(rename_all = "camelCase")]
    ReorderVolumes {
        group_id: String,
        new_order: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReorderEntries {
        group_id: String,
        volume_id: String,
        new_order: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    MoveEntry {
        group_id: String,
        from_volume_id: String,
        to_volume_id: String,
        entry_id: String,
        to_index: i64,
    },
}

impl Intent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("Intent serialization should not fail")
    }

    /// Parse a JSON text frame, rejecting anything structurally invalid.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The wire-level intent name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::CreateGroup { .. } => "create_group",
            Intent::UpdateGroup { .. } => "update_group",
            Intent::DeleteGroup { .. } => "delete_group",
            Intent::CreateEntry { .. } => "create_entry",
            Intent::CreateEntryWithContent { .. } => "create_entry_with_content",
            Intent::UpdateEntry { .. } => "update_entry",
            Intent::DeleteEntry { .. } => "delete_entry",
            Intent::CloneEntry { .. } => "clone_entry",
            Intent::InsertEntry { .. } => "insert_entry",
            Intent::CreateVolume { .. } => "create_volume",
            Intent::UpdateVolume { .. } => "update_volume",
            Intent::DeleteVolume { .. } => "delete_volume",
            Intent::ReorderVolumes { .. } => "reorder_volumes",
            Intent::ReorderEntries { .. } => "reorder_entries",
            Intent::MoveEntry { .. } => "move_entry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Wire format ====================

    #[test]
    fn test_intent_wire_format() {
        let intent = Intent::CreateEntry {
            group_id: "g1".to_string(),
            volume_id: Some("v1".to_string()),
        };
        let json = intent.encode();
        assert!(json.contains("\"type\":\"create_entry\""));
        assert!(json.contains("\"payload\":{"));
        assert!(json.contains("\"groupId\":\"g1\""));
        assert!(json.contains("\"volumeId\":\"v1\""));
    }

    #[test]
    fn test_intent_roundtrip() {
        let intent = Intent::MoveEntry {
            group_id: "g".to_string(),
            from_volume_id: "a".to_string(),
            to_volume_id: "b".to_string(),
            entry_id: "e".to_string(),
            to_index: 3,
        };
        let parsed = Intent::decode(&intent.encode()).unwrap();
        assert_eq!(intent, parsed);
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let json = r#"{"type":"create_entry","payload":{"groupId":"g1"}}"#;
        let parsed = Intent::decode(json).unwrap();
        assert_eq!(
            parsed,
            Intent::CreateEntry {
                group_id: "g1".to_string(),
                volume_id: None,
            }
        );

        let json = r#"{"type":"update_entry","payload":{"groupId":"g","entryId":"e","updatedAt":"2024-05-01T10:00:00Z"}}"#;
        match Intent::decode(json).unwrap() {
            Intent::UpdateEntry { title, content, .. } => {
                assert!(title.is_none());
                assert!(content.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_insert_position_is_lowercase_on_the_wire() {
        let json = r#"{"type":"insert_entry","payload":{"groupId":"g","anchorEntryId":"e","position":"after"}}"#;
        match Intent::decode(json).unwrap() {
            Intent::InsertEntry { position, .. } => assert_eq!(position, InsertPosition::After),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    // ==================== Rejection ====================

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Intent::decode(r#"{"type":"drop_tables","payload":{}}"#).is_err());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        assert!(Intent::decode(r#"{"type":"delete_group","payload":{}}"#).is_err());
    }

    #[test]
    fn test_malformed_timestamp_is_rejected() {
        let json = r#"{"type":"update_entry","payload":{"groupId":"g","entryId":"e","updatedAt":"yesterday"}}"#;
        assert!(Intent::decode(json).is_err());
    }

    #[test]
    fn test_non_json_is_rejected() {
        assert!(Intent::decode("not json").is_err());
        assert!(Intent::decode("").is_err());
    }
}
