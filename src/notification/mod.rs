use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered capacity per subscriber channel. Broadcasts never block: a full
/// channel drops the notification in favor of liveness.
const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub event_type: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub link: String,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event_type: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority: priority_for_event(&event_type),
            event_type,
            title: title.into(),
            message: message.into(),
            link: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }
}

/// Default priority by event type; escalations and failed workflows always
/// surface at the top of the stream.
pub fn priority_for_event(event_type: &str) -> NotificationPriority {
    match event_type {
        "workflow.failed" | "bead.escalated" | "provider.deleted" => NotificationPriority::Critical,
        "bead.assigned" | "decision.created" => NotificationPriority::High,
        "bead.created" | "bead.closed" | "agent.spawned" => NotificationPriority::Normal,
        _ => NotificationPriority::Low,
    }
}

/// Fan-out map `user_id -> {subscriber_id -> channel}`. Producers use
/// non-blocking sends; subscribers that fall behind lose messages rather
/// than stalling dispatch.
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<String, HashMap<String, mpsc::Sender<Notification>>>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &str, subscriber_id: &str) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, user_id: &str, subscriber_id: &str) {
        let mut guard = self.subscribers.write();
        if let Some(subs) = guard.get_mut(user_id) {
            subs.remove(subscriber_id);
            if subs.is_empty() {
                guard.remove(user_id);
            }
        }
    }

    /// Sends to every subscriber of one user. Returns how many deliveries
    /// succeeded; full channels are skipped.
    pub fn broadcast_to(&self, user_id: &str, notification: &Notification) -> usize {
        let guard = self.subscribers.read();
        let Some(subs) = guard.get(user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (subscriber_id, tx) in subs {
            match tx.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    debug!(user = user_id, subscriber = %subscriber_id, "Subscriber channel full, dropping");
                }
            }
        }
        delivered
    }

    /// Sends to every subscriber of every user.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let users: Vec<String> = self.subscribers.read().keys().cloned().collect();
        users
            .iter()
            .map(|user| self.broadcast_to(user, notification))
            .sum()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(|m| m.len()).sum()
    }

    /// Drops every channel; subscribers observe closure on their receivers.
    pub fn shutdown(&self) {
        self.subscribers.write().clear();
    }
}
