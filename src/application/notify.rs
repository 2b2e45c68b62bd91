//! Push notification dispatch toward the host
//!
//! The host supplies a sink at engine construction; the dispatcher maps
//! signaling events onto notifications and suppresses duplicates inside a
//! short window so a retransmitted INVITE can never wake the device twice.

use crate::infrastructure::protocols::sip::engine::SignalingEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What the host is being woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    IncomingCall,
    IncomingMessage,
    AboutToExpire,
    NotAnswered,
    Expired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::IncomingCall => "incoming-call",
            NotificationKind::IncomingMessage => "incoming-message",
            NotificationKind::AboutToExpire => "about-to-expire",
            NotificationKind::NotAnswered => "not-answered",
            NotificationKind::Expired => "expired",
        }
    }
}

/// One notification delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub account_id: String,
    /// Push token/selector the account was provisioned with
    pub selector: String,
    pub call_id: Option<String>,
    pub remote: Option<String>,
}

/// Host-side notification channel. Implementations must not block; delivery
/// happens on the engine's runtime.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Maps signaling events to notifications, deduplicating within a window.
pub struct Dispatcher {
    sink: std::sync::Arc<dyn NotificationSink>,
    window: Duration,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Dispatcher {
    pub fn new(sink: std::sync::Arc<dyn NotificationSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, event: SignalingEvent) {
        let notification = match event {
            SignalingEvent::IncomingCall {
                account_id,
                selector,
                call_id,
                remote,
            } => Notification {
                kind: NotificationKind::IncomingCall,
                account_id,
                selector,
                call_id: Some(call_id),
                remote: Some(remote),
            },
            SignalingEvent::IncomingMessage {
                account_id,
                selector,
                call_id,
                remote,
            } => Notification {
                kind: NotificationKind::IncomingMessage,
                account_id,
                selector,
                call_id: Some(call_id),
                remote: Some(remote),
            },
            SignalingEvent::AboutToExpire {
                account_id,
                selector,
            } => Notification {
                kind: NotificationKind::AboutToExpire,
                account_id,
                selector,
                call_id: None,
                remote: None,
            },
            SignalingEvent::Expired {
                account_id,
                selector,
            } => Notification {
                kind: NotificationKind::Expired,
                account_id,
                selector,
                call_id: None,
                remote: None,
            },
            SignalingEvent::NotAnswered {
                account_id,
                selector,
                call_id,
            } => Notification {
                kind: NotificationKind::NotAnswered,
                account_id,
                selector,
                call_id: Some(call_id),
                remote: None,
            },
        };

        if self.is_duplicate(&notification).await {
            debug!(
                kind = notification.kind.as_str(),
                account = %notification.account_id,
                "suppressing duplicate notification"
            );
            return;
        }

        info!(
            kind = notification.kind.as_str(),
            account = %notification.account_id,
            "raising notification"
        );
        self.sink.notify(notification).await;
    }

    async fn is_duplicate(&self, notification: &Notification) -> bool {
        let key = format!(
            "{}|{}|{}",
            notification.kind.as_str(),
            notification.account_id,
            notification.call_id.as_deref().unwrap_or("")
        );
        let now = Utc::now();
        let mut recent = self.recent.lock().await;
        recent.retain(|_, at| now - *at < self.window);
        match recent.get(&key) {
            Some(_) => true,
            None => {
                recent.insert(key, now);
                false
            }
        }
    }
}
