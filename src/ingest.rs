//! Normalization and routing of raw upstream events.
//!
//! An event is deliverable iff its envelope carries a `dataMessage`
//! sub-object; everything else (typing indicators, receipts, sync messages)
//! is silently dropped. For deliverable events the side effects run in
//! strict order: persist the message, update the peer's conversation, then
//! hand the fan-out to an independent task so delivery latency never stalls
//! the ingestion loop.

use serde::Deserialize;

use crate::delivery::DeliveryEngine;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{now_millis, Attachment, NewMessage, WebhookEvent};

// Upstream wire shapes. Every field is optional; normalization supplies the
// defaults.

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    envelope: Option<Envelope>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "sourceNumber", default)]
    source_number: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(rename = "sourceName", default)]
    source_name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(rename = "dataMessage", default)]
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
struct DataMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<RawAttachment>>,
    #[serde(rename = "groupInfo", default)]
    group_info: Option<GroupInfo>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Normalize one decoded upstream event into an insertable message.
///
/// Returns `None` for events without a `dataMessage` and for shapes that do
/// not deserialize as an envelope at all. Field defaults follow the upstream
/// contract: sender falls back from `sourceNumber` to `source` to
/// `"unknown"`, the display name to empty, the origin timestamp to now.
fn normalize(raw: &serde_json::Value) -> Option<NewMessage> {
    let event: RawEvent = serde_json::from_value(raw.clone()).ok()?;
    let envelope = event.envelope?;
    let data_message = envelope.data_message?;

    let sender_number = envelope
        .source_number
        .or(envelope.source)
        .unwrap_or_else(|| "unknown".to_string());
    let (group_id, group_name) = match data_message.group_info {
        Some(info) => (info.group_id, info.group_name),
        None => (None, None),
    };
    let attachments = data_message
        .attachments
        .unwrap_or_default()
        .into_iter()
        .map(|att| Attachment {
            content_type: att.content_type.unwrap_or_default(),
            filename: att.filename.unwrap_or_default(),
            id: att.id.unwrap_or_default(),
            size: att.size.unwrap_or_default(),
        })
        .collect();

    Some(NewMessage {
        sender_number,
        sender_name: envelope.source_name.unwrap_or_default(),
        timestamp: envelope.timestamp.unwrap_or_else(now_millis),
        message_body: data_message.message.unwrap_or_default(),
        attachments,
        raw_data: Some(raw.clone()),
        group_id,
        group_name,
        recipient_number: None,
    })
}

#[derive(Debug, Deserialize)]
struct GroupInfo {
    #[serde(rename = "groupId", default)]
    group_id: Option<String>,
    #[serde(rename = "groupName", default)]
    group_name: Option<String>,
}

/// Process one raw upstream event end to end.
///
/// Never fails and never panics: normalization or persistence errors are
/// logged with context and the event is dropped, leaving the ingestion loop
/// untouched.
pub async fn process_event(store: &Store, engine: &DeliveryEngine, raw: serde_json::Value) {
    if let Err(e) = process_event_inner(store, engine, raw).await {
        tracing::error!(error = %e, "error processing incoming event; dropped");
    }
}

async fn process_event_inner(
    store: &Store,
    engine: &DeliveryEngine,
    raw: serde_json::Value,
) -> Result<(), StoreError> {
    let Some(message) = normalize(&raw) else {
        tracing::debug!("skipping non-data event");
        return Ok(());
    };

    let id = store.insert_message(&message).await?;

    // Group messages aggregate under the group peer, individual messages
    // under the sender.
    match &message.group_id {
        Some(group_id) => {
            store
                .record_conversation_message(
                    group_id,
                    message.group_name.as_deref(),
                    message.timestamp,
                    Some(group_id),
                )
                .await?;
            tracing::info!(
                message_id = id.0,
                sender = %message.sender_number,
                group = message.group_name.as_deref().unwrap_or(""),
                "stored group message"
            );
        }
        None => {
            store
                .record_conversation_message(
                    &message.sender_number,
                    Some(&message.sender_name),
                    message.timestamp,
                    None,
                )
                .await?;
            tracing::info!(
                message_id = id.0,
                sender = %message.sender_number,
                "stored message"
            );
        }
    }

    let event = WebhookEvent::NewMessage {
        message_id: id.0,
        sender_number: message.sender_number,
        sender_name: message.sender_name,
        message_body: message.message_body,
        timestamp: message.timestamp,
        group_id: message.group_id,
        group_name: message.group_name,
        attachments: message.attachments,
    };

    // Fire-and-forget: the fan-out's outcome must not affect ingestion.
    let engine = engine.clone();
    tokio::spawn(async move {
        engine.notify_all(&event).await;
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_minimal_data_message() {
        let raw = json!({
            "envelope": {
                "sourceNumber": "+15551234567",
                "timestamp": 1000,
                "dataMessage": {"message": "hi"}
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.sender_number, "+15551234567");
        assert_eq!(msg.message_body, "hi");
        assert_eq!(msg.timestamp, 1000);
        assert_eq!(msg.sender_name, "");
        assert!(msg.attachments.is_empty());
        assert!(msg.group_id.is_none());
        assert_eq!(msg.raw_data.as_ref(), Some(&raw));
    }

    #[test]
    fn drops_events_without_data_message() {
        assert!(normalize(&json!({"envelope": {"typingMessage": {}}})).is_none());
        assert!(normalize(&json!({"envelope": {}})).is_none());
        assert!(normalize(&json!({})).is_none());
        assert!(normalize(&json!("not an object")).is_none());
    }

    #[test]
    fn sender_falls_back_to_source_then_unknown() {
        let with_source = json!({
            "envelope": {"source": "uuid-abc", "dataMessage": {}}
        });
        assert_eq!(normalize(&with_source).unwrap().sender_number, "uuid-abc");

        let without = json!({"envelope": {"dataMessage": {}}});
        assert_eq!(normalize(&without).unwrap().sender_number, "unknown");
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let raw = json!({"envelope": {"source": "+1", "dataMessage": {}}});
        let before = now_millis();
        let msg = normalize(&raw).unwrap();
        assert!(msg.timestamp >= before);
        assert_eq!(msg.message_body, "");
    }

    #[test]
    fn attachments_get_field_defaults() {
        let raw = json!({
            "envelope": {
                "source": "+1",
                "dataMessage": {
                    "message": "photo",
                    "attachments": [
                        {"contentType": "image/jpeg", "filename": "cat.jpg", "id": "a1", "size": 1234},
                        {}
                    ]
                }
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.attachments.len(), 2);
        assert_eq!(msg.attachments[0].content_type, "image/jpeg");
        assert_eq!(msg.attachments[0].size, 1234);
        assert_eq!(msg.attachments[1], Attachment::default());
    }

    #[test]
    fn group_info_extracted_when_present() {
        let raw = json!({
            "envelope": {
                "sourceNumber": "+1",
                "dataMessage": {
                    "message": "hello team",
                    "groupInfo": {"groupId": "grp==", "groupName": "Team"}
                }
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.group_id.as_deref(), Some("grp=="));
        assert_eq!(msg.group_name.as_deref(), Some("Team"));
    }
}
