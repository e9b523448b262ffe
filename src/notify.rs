//! Notification dispatch
//!
//! A notification is a durable row first and a real-time push second. Rows
//! are written inside the caller's transaction; pushes are queued in an
//! [`Outbox`] and only published after that transaction commits, so a
//! rolled-back transition never reaches a client. Push failures are logged
//! and dropped.

use crate::db::{last_insert_id, NewNotification, Notification};
use crate::error::Result;
use crate::schema::notifications;
use crate::types::NotificationKind;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Topic carrying lead-level update events for every connected client
pub const LEADS_TOPIC: &str = "leads";

pub fn user_topic(user_id: i32) -> String {
    format!("user:{}", user_id)
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Nobody is listening on the topic (user offline)
    #[error("no subscribers on {0}")]
    NoSubscribers(String),

    #[error("could not encode push payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fire-and-forget, at-most-once publish
pub trait PushChannel: Send + Sync {
    /// Returns the number of receivers reached
    fn publish(&self, topic: &str, payload: &Value) -> std::result::Result<usize, PushError>;
}

/// Push channel that drops everything, for CLI runs with no live clients
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPush;

impl PushChannel for NoPush {
    fn publish(&self, topic: &str, _payload: &Value) -> std::result::Result<usize, PushError> {
        Err(PushError::NoSubscribers(topic.to_string()))
    }
}

/// In-process hub of broadcast channels keyed by topic
pub struct BroadcastHub {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PushChannel for BroadcastHub {
    fn publish(&self, topic: &str, payload: &Value) -> std::result::Result<usize, PushError> {
        let text = serde_json::to_string(payload)?;
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = topics.get(topic) else {
            return Err(PushError::NoSubscribers(topic.to_string()));
        };
        match tx.send(text) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                // Every receiver is gone
                topics.remove(topic);
                Err(PushError::NoSubscribers(topic.to_string()))
            }
        }
    }
}

/// Pushes queued during a transaction, published after commit
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<(String, Value)>,
}

impl Outbox {
    pub fn push(&mut self, topic: impl Into<String>, payload: Value) {
        self.pending.push((topic.into(), payload));
    }

    /// Broadcast a lead-level update to every connected client
    pub fn lead_event(&mut self, event: &str, lead_id: i32, extra: Value) {
        let mut payload = json!({ "event": event, "lead_id": lead_id });
        if let (Some(obj), Value::Object(more)) = (payload.as_object_mut(), extra) {
            obj.extend(more);
        }
        self.push(LEADS_TOPIC, payload);
    }

    pub fn flush(self, channel: &dyn PushChannel) {
        for (topic, payload) in self.pending {
            match channel.publish(&topic, &payload) {
                Ok(reached) => tracing::trace!(topic = %topic, reached, "push delivered"),
                Err(e) => tracing::debug!(topic = %topic, error = %e, "push dropped"),
            }
        }
    }
}

/// What to tell a user
#[derive(Debug, Clone)]
pub struct Notice<'a> {
    pub user_id: i32,
    pub lead_id: Option<i32>,
    pub message: &'a str,
    pub kind: NotificationKind,
    pub play_sound: bool,
}

/// Persist a notification row and queue its real-time push
pub fn dispatch(conn: &mut SqliteConnection, outbox: &mut Outbox, notice: &Notice<'_>, now: &str) -> Result<i32> {
    diesel::insert_into(notifications::table)
        .values(&NewNotification {
            user_id: notice.user_id,
            lead_id: notice.lead_id,
            message: notice.message,
            notification_type: notice.kind.as_str(),
            is_read: false,
            sound_enabled: notice.play_sound,
            created_at: now,
        })
        .execute(conn)?;
    let id = last_insert_id(conn)?;

    outbox.push(
        user_topic(notice.user_id),
        json!({
            "event": "new_notification",
            "id": id,
            "message": notice.message,
            "type": notice.kind.as_str(),
            "lead_id": notice.lead_id,
            "play_sound": notice.play_sound,
            "timestamp": now,
        }),
    );
    Ok(id)
}

// ============================================================================
// Inbox queries
// ============================================================================

pub fn unread(conn: &mut SqliteConnection, user_id: i32) -> Result<Vec<Notification>> {
    let rows = notifications::table
        .filter(notifications::user_id.eq(user_id))
        .filter(notifications::is_read.eq(false))
        .order((notifications::created_at.desc(), notifications::id.desc()))
        .load::<Notification>(conn)?;
    Ok(rows)
}

pub fn recent(conn: &mut SqliteConnection, user_id: i32, limit: i64) -> Result<Vec<Notification>> {
    let rows = notifications::table
        .filter(notifications::user_id.eq(user_id))
        .order((notifications::created_at.desc(), notifications::id.desc()))
        .limit(limit)
        .load::<Notification>(conn)?;
    Ok(rows)
}

pub fn mark_all_read(conn: &mut SqliteConnection, user_id: i32) -> Result<usize> {
    let n = diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(user_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set(notifications::is_read.eq(true))
    .execute(conn)?;
    Ok(n)
}

/// Mark one of the user's notifications read; false if it isn't theirs
pub fn mark_read(conn: &mut SqliteConnection, user_id: i32, notification_id: i32) -> Result<bool> {
    let n = diesel::update(
        notifications::table
            .filter(notifications::id.eq(notification_id))
            .filter(notifications::user_id.eq(user_id)),
    )
    .set(notifications::is_read.eq(true))
    .execute(conn)?;
    Ok(n == 1)
}
