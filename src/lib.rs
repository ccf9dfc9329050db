//! A single-process message ingestion and webhook fan-out relay.
//!
//! This crate sits between a signal-cli HTTP daemon and downstream
//! consumers: it tails the daemon's SSE event stream, persists inbound
//! messages to SQLite, and pushes signed webhook notifications to
//! subscribed callback URLs.
//!
//! ## Guarantees
//! - At-least-once, HMAC-signed delivery per enabled subscriber
//! - Per-subscriber isolation: one endpoint's failure never blocks another
//! - Exactly one persisted message per deliverable upstream event
//! - Durable storage across restarts (single-file SQLite)
//! - Challenge-verified subscriptions behind a host allow-list
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Cross-event delivery ordering
//! - Distributed coordination
//!
//! This crate is intentionally **not a hosted service**. It is the
//! embeddable core of a relay; callers bring their own HTTP surface and
//! wire these pieces together.

mod challenge;
mod client;
mod config;
mod delivery;
mod error;
mod ingest;
mod listener;
mod signing;
mod store;
mod subscribe;
mod types;

pub use client::SignalClient;
pub use config::{AllowList, Config};
pub use delivery::DeliveryEngine;
pub use error::{
    ChallengeError,
    DeliveryOutcome,
    FailureReason,
    SendError,
    StoreError,
    SubscribeError,
};
pub use ingest::process_event;
pub use listener::Listener;
pub use signing::{compute_signature, generate_token, verify_signature, SIGNATURE_HEADER};
pub use store::{MessageFilter, Store};
pub use subscribe::{SubscriptionReceipt, SubscriptionService};
pub use types::{
    Attachment, Conversation, Message, MessageId, NewMessage, Recipient, SenderCount,
    Statistics, Subscription, SubscriptionId, SubscriptionInfo, WebhookEvent,
};
