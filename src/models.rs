//! Core data models that flow through the archival pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A chat message row in the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub channel_id: String,
    pub sent_at: String,
    pub indexed: bool,
}

/// Metadata attached to every vector document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub sent_at: String,
}

/// One document submitted to the vector index per indexed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VectorDocument {
    pub id: String,
    pub text: String,
    pub metadata: VectorMetadata,
}

impl From<&Message> for VectorDocument {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            text: message.content.clone(),
            metadata: VectorMetadata {
                message_id: message.id.clone(),
                channel_id: message.channel_id.clone(),
                author_id: message.author_id.clone(),
                sent_at: message.sent_at.clone(),
            },
        }
    }
}

/// A message returned from a vector query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMessage {
    pub message_id: String,
    pub score: f32,
    pub text: String,
    pub metadata: Option<VectorMetadata>,
}

/// An uploaded export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub local_path: PathBuf,
    pub storage_key: String,
    pub public_url: String,
}

// ============ Transcript (exporter JSON) ============

/// The bundle written by the exporter in `json` format.
///
/// Only the fields the ingestion stage needs are decoded; everything else in
/// the exporter output is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub channel: TranscriptChannel,
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptMessage {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub author: TranscriptAuthor,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptAuthor {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_ignores_unknown_fields() {
        let raw = r#"{
            "guild": {"id": "1", "name": "Guild"},
            "channel": {"id": "42", "name": "general", "type": "GuildTextChat"},
            "messages": [
                {"id": "100", "type": "Default", "content": "hello",
                 "author": {"id": "7", "name": "ada"}, "timestamp": "2024-01-01T00:00:00+00:00"},
                {"id": "101", "author": {"id": "8"}, "timestamp": "2024-01-01T00:01:00+00:00",
                 "attachments": [{"url": "x"}]}
            ],
            "messageCount": 2
        }"#;
        let t: Transcript = serde_json::from_str(raw).unwrap();
        assert_eq!(t.channel.id, "42");
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.messages[0].content.as_deref(), Some("hello"));
        assert!(t.messages[1].content.is_none());
    }

    #[test]
    fn vector_document_carries_message_metadata() {
        let m = Message {
            id: "100".into(),
            content: "hello".into(),
            author_id: "7".into(),
            channel_id: "42".into(),
            sent_at: "2024-01-01T00:00:00+00:00".into(),
            indexed: false,
        };
        let doc = VectorDocument::from(&m);
        assert_eq!(doc.text, "hello");
        assert_eq!(doc.metadata.message_id, "100");
        let json = serde_json::to_value(&doc.metadata).unwrap();
        assert_eq!(json["channelId"], "42");
        assert_eq!(json["sentAt"], "2024-01-01T00:00:00+00:00");
    }
}
