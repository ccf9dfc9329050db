//! SQLite persistence for the relay.
//!
//! Three tables: `messages` (append-only), `conversations` (one row per
//! peer, upserted), `webhook_subscriptions` (one row per callback URL).
//! Every operation is a single self-contained statement executed under a
//! short-lived connection lock; concurrent writers rely on the upsert
//! semantics rather than application-level locking.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    now_millis, Attachment, Conversation, Message, MessageId, NewMessage, SenderCount,
    Statistics, Subscription, SubscriptionId, SubscriptionInfo,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_number TEXT NOT NULL,
    sender_name TEXT,
    timestamp INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    message_body TEXT,
    attachments TEXT,
    raw_data TEXT,
    group_id TEXT,
    group_name TEXT,
    recipient_number TEXT
);

CREATE INDEX IF NOT EXISTS idx_sender ON messages(sender_number);
CREATE INDEX IF NOT EXISTS idx_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_received ON messages(received_at);
CREATE INDEX IF NOT EXISTS idx_group_id ON messages(group_id);
CREATE INDEX IF NOT EXISTS idx_recipient ON messages(recipient_number);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer TEXT UNIQUE NOT NULL,
    display_name TEXT,
    last_message_at INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    is_group INTEGER NOT NULL DEFAULT 0,
    group_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_peer ON conversations(peer);

CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    callback_url TEXT UNIQUE NOT NULL,
    secret TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_success_at INTEGER,
    last_failure_at INTEGER,
    created_at INTEGER NOT NULL
);
";

/// Filter for message queries. Empty filter selects everything.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub group_id: Option<String>,
}

/// Shared handle to the SQLite database.
///
/// Cheap to clone; all clones serialize access through one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and initialize, if needed) the database at `path`.
    ///
    /// The parent directory is created when missing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a throwaway in-memory database. Used in tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::info!("database schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- messages ----------------------------------------------------------

    /// Persist a message and return its store-assigned identifier.
    ///
    /// The receipt timestamp is assigned here; the row is never mutated
    /// afterwards.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageId, StoreError> {
        let attachments_json = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.attachments)?)
        };
        let raw_json = message
            .raw_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (
                sender_number, sender_name, timestamp, received_at, message_body,
                attachments, raw_data, group_id, group_name, recipient_number
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.sender_number,
                message.sender_name,
                message.timestamp,
                now_millis(),
                message.message_body,
                attachments_json,
                raw_json,
                message.group_id,
                message.group_name,
                message.recipient_number,
            ],
        )?;
        Ok(MessageId(conn.last_insert_rowid()))
    }

    /// Fetch one message by id.
    pub async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, sender_number, sender_name, timestamp, received_at, message_body,
                    attachments, raw_data, group_id, group_name, recipient_number
             FROM messages WHERE id = ?1",
            params![id.0],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Fetch messages newest-first, optionally filtered.
    pub async fn messages(
        &self,
        filter: &MessageFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let mut sql = String::from(
            "SELECT id, sender_number, sender_name, timestamp, received_at, message_body,
                    attachments, raw_data, group_id, group_name, recipient_number
             FROM messages WHERE 1=1",
        );
        let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(sender) = &filter.sender {
            sql.push_str(" AND sender_number = ?");
            binds.push(Box::new(sender.clone()));
        }
        if let Some(recipient) = &filter.recipient {
            sql.push_str(" AND recipient_number = ?");
            binds.push(Box::new(recipient.clone()));
        }
        if let Some(group_id) = &filter.group_id {
            sql.push_str(" AND group_id = ?");
            binds.push(Box::new(group_id.clone()));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
        binds.push(Box::new(limit));
        binds.push(Box::new(offset));

        let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
            binds.iter().map(AsRef::as_ref).collect();

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bind_refs.as_slice(), row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // -- conversations -----------------------------------------------------

    /// Record one more message for `peer`, creating the conversation row on
    /// first contact.
    ///
    /// Atomic upsert: message_count strictly increases, last_message_at is
    /// monotonically non-decreasing, is_group once set is never unset, and a
    /// missing display name never erases a known one.
    pub async fn record_conversation_message(
        &self,
        peer: &str,
        display_name: Option<&str>,
        message_at: i64,
        group_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let display_name = display_name.filter(|n| !n.is_empty());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations
                (peer, display_name, last_message_at, message_count, is_group, group_id, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
             ON CONFLICT(peer) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name),
                last_message_at = MAX(last_message_at, excluded.last_message_at),
                message_count = message_count + 1,
                is_group = MAX(is_group, excluded.is_group),
                group_id = COALESCE(excluded.group_id, group_id)",
            params![
                peer,
                display_name,
                message_at,
                group_id.is_some(),
                group_id,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    /// All conversations, most recently active first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, peer, display_name, last_message_at, message_count,
                    is_group, group_id, created_at
             FROM conversations ORDER BY last_message_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                peer: row.get(1)?,
                display_name: row.get(2)?,
                last_message_at: row.get(3)?,
                message_count: row.get(4)?,
                is_group: row.get(5)?,
                group_id: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Aggregate counters: totals, messages since UTC midnight, top senders.
    pub async fn statistics(&self) -> Result<Statistics, StoreError> {
        let day_ms = 86_400_000i64;
        let midnight = (now_millis() / day_ms) * day_ms;

        let conn = self.conn.lock().await;
        let total_messages =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let total_conversations =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
        let messages_today = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE received_at >= ?1",
            params![midnight],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT sender_number, sender_name, COUNT(*) AS count
             FROM messages GROUP BY sender_number ORDER BY count DESC LIMIT 10",
        )?;
        let top_senders = stmt
            .query_map([], |row| {
                Ok(SenderCount {
                    sender_number: row.get(0)?,
                    sender_name: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Statistics {
            total_messages,
            total_conversations,
            messages_today,
            top_senders,
        })
    }

    // -- webhook subscriptions ---------------------------------------------

    /// Insert a verified subscription. Duplicate callback URLs are rejected.
    pub async fn add_subscription(
        &self,
        callback_url: &str,
        secret: &str,
    ) -> Result<SubscriptionId, StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO webhook_subscriptions (callback_url, secret, created_at)
             VALUES (?1, ?2, ?3)",
            params![callback_url, secret, now_millis()],
        );
        match result {
            Ok(_) => Ok(SubscriptionId(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::AlreadyExists(callback_url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a subscription by callback URL.
    pub async fn remove_subscription(&self, callback_url: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM webhook_subscriptions WHERE callback_url = ?1",
            params![callback_url],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound(callback_url.to_string()));
        }
        Ok(())
    }

    /// Subscriptions with secrets, for the delivery path.
    pub async fn subscriptions(&self, enabled_only: bool) -> Result<Vec<Subscription>, StoreError> {
        let sql = if enabled_only {
            "SELECT id, callback_url, secret, enabled, success_count, failure_count,
                    last_success_at, last_failure_at, created_at
             FROM webhook_subscriptions WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT id, callback_url, secret, enabled, success_count, failure_count,
                    last_success_at, last_failure_at, created_at
             FROM webhook_subscriptions ORDER BY id"
        };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_subscription)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Subscriptions without secrets, for listing to callers.
    pub async fn list_subscriptions(
        &self,
        include_disabled: bool,
    ) -> Result<Vec<SubscriptionInfo>, StoreError> {
        let subs = self.subscriptions(!include_disabled).await?;
        Ok(subs.into_iter().map(SubscriptionInfo::from).collect())
    }

    /// Enable or disable a subscription without removing it.
    pub async fn set_subscription_enabled(
        &self,
        callback_url: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE webhook_subscriptions SET enabled = ?2 WHERE callback_url = ?1",
            params![callback_url, enabled],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(callback_url.to_string()));
        }
        Ok(())
    }

    /// Record one successful delivery attempt.
    pub async fn record_delivery_success(&self, callback_url: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_subscriptions
             SET success_count = success_count + 1, last_success_at = ?2
             WHERE callback_url = ?1",
            params![callback_url, now_millis()],
        )?;
        Ok(())
    }

    /// Record one failed delivery attempt.
    pub async fn record_delivery_failure(&self, callback_url: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_subscriptions
             SET failure_count = failure_count + 1, last_failure_at = ?2
             WHERE callback_url = ?1",
            params![callback_url, now_millis()],
        )?;
        Ok(())
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let attachments_json: Option<String> = row.get(6)?;
    let raw_json: Option<String> = row.get(7)?;
    // Stored JSON was written by us; a damaged column degrades to defaults
    // rather than failing the whole query.
    let attachments: Vec<Attachment> = attachments_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let raw_data = raw_json.as_deref().and_then(|s| serde_json::from_str(s).ok());

    Ok(Message {
        id: MessageId(row.get(0)?),
        sender_number: row.get(1)?,
        sender_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        timestamp: row.get(3)?,
        received_at: row.get(4)?,
        message_body: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        attachments,
        raw_data,
        group_id: row.get(8)?,
        group_name: row.get(9)?,
        recipient_number: row.get(10)?,
    })
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: SubscriptionId(row.get(0)?),
        callback_url: row.get(1)?,
        secret: row.get(2)?,
        enabled: row.get(3)?,
        success_count: row.get(4)?,
        failure_count: row.get(5)?,
        last_success_at: row.get(6)?,
        last_failure_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(sender: &str, timestamp: i64) -> NewMessage {
        NewMessage {
            message_body: "hello".into(),
            ..NewMessage::inbound(sender, timestamp)
        }
    }

    #[tokio::test]
    async fn message_ids_are_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_message(&sample_message("+1", 1)).await.unwrap();
        let b = store.insert_message(&sample_message("+1", 2)).await.unwrap();
        assert!(b.0 > a.0);

        let fetched = store.message(a).await.unwrap().unwrap();
        assert_eq!(fetched.sender_number, "+1");
        assert_eq!(fetched.message_body, "hello");
        assert!(fetched.received_at > 0);
    }

    #[tokio::test]
    async fn conversation_upsert_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_conversation_message("+15551234567", Some("Alice"), 2000, None)
            .await
            .unwrap();
        // Out-of-order timestamp and a missing name must not regress the row.
        store
            .record_conversation_message("+15551234567", None, 1000, None)
            .await
            .unwrap();

        let convs = store.conversations().await.unwrap();
        assert_eq!(convs.len(), 1);
        let conv = &convs[0];
        assert_eq!(conv.peer, "+15551234567");
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.last_message_at, 2000);
        assert_eq!(conv.display_name.as_deref(), Some("Alice"));
        assert!(!conv.is_group);
    }

    #[tokio::test]
    async fn group_flag_is_never_unset() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_conversation_message("grp==", Some("Team"), 1, Some("grp=="))
            .await
            .unwrap();
        store
            .record_conversation_message("grp==", None, 2, None)
            .await
            .unwrap();

        let convs = store.conversations().await.unwrap();
        assert_eq!(convs.len(), 1);
        assert!(convs[0].is_group);
        assert_eq!(convs[0].group_id.as_deref(), Some("grp=="));
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_subscription("http://127.0.0.1/hook", "s1")
            .await
            .unwrap();
        let err = store
            .add_subscription("http://127.0.0.1/hook", "s2")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn listing_withholds_secrets_and_respects_enabled() {
        let store = Store::open_in_memory().unwrap();
        store.add_subscription("http://a/hook", "sa").await.unwrap();
        store.add_subscription("http://b/hook", "sb").await.unwrap();
        store
            .set_subscription_enabled("http://b/hook", false)
            .await
            .unwrap();

        let enabled = store.subscriptions(true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].callback_url, "http://a/hook");
        assert_eq!(enabled[0].secret, "sa");

        let listed = store.list_subscriptions(true).await.unwrap();
        assert_eq!(listed.len(), 2);
        let listed_json = serde_json::to_string(&listed).unwrap();
        assert!(!listed_json.contains("sa"));
        assert!(!listed_json.contains("secret"));
    }

    #[tokio::test]
    async fn delivery_counters_accumulate() {
        let store = Store::open_in_memory().unwrap();
        store.add_subscription("http://a/hook", "sa").await.unwrap();
        store.record_delivery_success("http://a/hook").await.unwrap();
        store.record_delivery_failure("http://a/hook").await.unwrap();
        store.record_delivery_failure("http://a/hook").await.unwrap();

        let subs = store.subscriptions(false).await.unwrap();
        assert_eq!(subs[0].success_count, 1);
        assert_eq!(subs[0].failure_count, 2);
        assert!(subs[0].last_success_at.is_some());
        assert!(subs[0].last_failure_at.is_some());
    }

    #[tokio::test]
    async fn message_filters_compose() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(&sample_message("+1", 1)).await.unwrap();
        store.insert_message(&sample_message("+2", 2)).await.unwrap();
        let mut outbound = sample_message("+me", 3);
        outbound.recipient_number = Some("+2".into());
        store.insert_message(&outbound).await.unwrap();

        let from_one = store
            .messages(
                &MessageFilter {
                    sender: Some("+1".into()),
                    ..Default::default()
                },
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(from_one.len(), 1);

        let to_two = store
            .messages(
                &MessageFilter {
                    recipient: Some("+2".into()),
                    ..Default::default()
                },
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(to_two.len(), 1);
        assert_eq!(to_two[0].sender_number, "+me");

        let all = store.messages(&MessageFilter::default(), 100, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].timestamp, 3);
    }

    #[tokio::test]
    async fn statistics_count_totals() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(&sample_message("+1", 1)).await.unwrap();
        store.insert_message(&sample_message("+1", 2)).await.unwrap();
        store
            .record_conversation_message("+1", None, 2, None)
            .await
            .unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.messages_today, 2);
        assert_eq!(stats.top_senders.len(), 1);
        assert_eq!(stats.top_senders[0].count, 2);
    }
}
