use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Store-assigned identifier of a persisted message.
///
/// Monotonic and assigned exactly once at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Store-assigned identifier of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub i64);

/// Normalized attachment metadata.
///
/// Every field has a defined default (`""` / `0`) so that a partially
/// described attachment from the upstream still round-trips.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub filename: String,
    pub id: String,
    pub size: u64,
}

/// A message about to be persisted.
///
/// The store assigns the identifier and receipt timestamp; everything else
/// is supplied by the normalizer (inbound) or the send collaborator
/// (outbound).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_number: String,
    pub sender_name: String,
    /// Origin timestamp in milliseconds since epoch, sender-supplied.
    pub timestamp: i64,
    pub message_body: String,
    pub attachments: Vec<Attachment>,
    /// Opaque source payload kept for audit.
    pub raw_data: Option<serde_json::Value>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    /// Direct recipient, set only on outbound records.
    pub recipient_number: Option<String>,
}

impl NewMessage {
    pub fn inbound(sender_number: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender_number: sender_number.into(),
            sender_name: String::new(),
            timestamp,
            message_body: String::new(),
            attachments: Vec::new(),
            raw_data: None,
            group_id: None,
            group_name: None,
            recipient_number: None,
        }
    }
}

/// An immutable persisted message record.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_number: String,
    pub sender_name: String,
    pub timestamp: i64,
    /// Receipt timestamp in milliseconds since epoch, store-assigned.
    pub received_at: i64,
    pub message_body: String,
    pub attachments: Vec<Attachment>,
    pub raw_data: Option<serde_json::Value>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub recipient_number: Option<String>,
}

/// One conversation row per distinct peer (contact number or group id).
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    /// Unique peer key: a phone number, or a group identifier.
    pub peer: String,
    pub display_name: Option<String>,
    pub last_message_at: i64,
    pub message_count: i64,
    pub is_group: bool,
    pub group_id: Option<String>,
    pub created_at: i64,
}

/// A webhook subscription row, including its shared secret.
///
/// Only the delivery path sees this type; anything user-facing goes through
/// [`SubscriptionInfo`], which withholds the secret.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub callback_url: String,
    pub secret: String,
    pub enabled: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub created_at: i64,
}

/// A subscription as exposed by listing operations. No secret.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub callback_url: String,
    pub enabled: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub created_at: i64,
}

impl From<Subscription> for SubscriptionInfo {
    fn from(sub: Subscription) -> Self {
        Self {
            id: sub.id,
            callback_url: sub.callback_url,
            enabled: sub.enabled,
            success_count: sub.success_count,
            failure_count: sub.failure_count,
            last_success_at: sub.last_success_at,
            last_failure_at: sub.last_failure_at,
            created_at: sub.created_at,
        }
    }
}

/// Outbound recipient, explicitly tagged as a contact or a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Direct(String),
    Group(String),
}

impl Recipient {
    /// Classify a bare recipient string the way the legacy send path did:
    /// group identifiers are base64 blobs, so anything containing `=` or
    /// longer than 20 characters is treated as a group.
    ///
    /// The rule can misclassify (a long phone alias, an unpadded group id);
    /// callers that know the recipient kind should construct the variant
    /// directly instead.
    pub fn classify(recipient: &str) -> Self {
        if recipient.contains('=') || recipient.len() > 20 {
            Recipient::Group(recipient.to_string())
        } else {
            Recipient::Direct(recipient.to_string())
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Recipient::Direct(id) | Recipient::Group(id) => id,
        }
    }
}

/// Wire envelope POSTed to webhook subscribers.
///
/// Serialized compactly; the HMAC signature covers the exact encoded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    NewMessage {
        message_id: i64,
        sender_number: String,
        sender_name: String,
        message_body: String,
        timestamp: i64,
        group_id: Option<String>,
        group_name: Option<String>,
        attachments: Vec<Attachment>,
    },
    Challenge {
        challenge: String,
    },
    Test {
        message: String,
        timestamp: i64,
    },
}

/// Per-sender message count, part of [`Statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct SenderCount {
    pub sender_number: String,
    pub sender_name: Option<String>,
    pub count: i64,
}

/// Aggregate counters over the message store.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_messages: i64,
    pub total_conversations: i64,
    /// Messages received since UTC midnight.
    pub messages_today: i64,
    pub top_senders: Vec<SenderCount>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
