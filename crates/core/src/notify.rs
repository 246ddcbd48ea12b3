use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::request::ResourceRequestId;
use crate::domain::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Created,
    Advanced,
    Rejected,
    AssignedToIt,
}

impl NotificationKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created => "request.created",
            Self::Advanced => "request.advanced",
            Self::Rejected => "request.rejected",
            Self::AssignedToIt => "request.assigned_to_it",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_id: String,
    pub kind: NotificationKind,
    pub request_id: ResourceRequestId,
    pub correlation_id: String,
    pub actor: UserId,
    pub recipients: Vec<UserId>,
    pub payload: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        request_id: ResourceRequestId,
        correlation_id: impl Into<String>,
        actor: UserId,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            request_id,
            correlation_id: correlation_id.into(),
            actor,
            recipients: Vec::new(),
            payload: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Adds recipients, skipping duplicates while keeping first-seen order.
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = UserId>) -> Self {
        for recipient in recipients {
            if !self.recipients.contains(&recipient) {
                self.recipients.push(recipient);
            }
        }
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected by channel: {0}")]
    Rejected(String),
}

/// Delivery is best-effort: the engine logs a failed delivery and carries on.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        (**self).notify(notification)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(notifications) => notifications.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications().into_iter().filter(|notification| notification.kind == kind).collect()
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Clone, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let recipients: Vec<&str> =
            notification.recipients.iter().map(|recipient| recipient.0.as_str()).collect();
        info!(
            event_name = notification.kind.event_type(),
            correlation_id = %notification.correlation_id,
            request_id = %notification.request_id,
            actor = %notification.actor.0,
            recipients = ?recipients,
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryNotifier, Notification, NotificationKind, Notifier};
    use crate::domain::request::ResourceRequestId;
    use crate::domain::user::UserId;

    #[test]
    fn in_memory_notifier_records_recipients_once() {
        let notifier = InMemoryNotifier::default();
        notifier
            .notify(
                Notification::new(
                    NotificationKind::Advanced,
                    ResourceRequestId("rr-1".to_owned()),
                    "corr-1",
                    UserId("u-dh".to_owned()),
                )
                .with_recipients([
                    UserId("u-emp".to_owned()),
                    UserId("u-ith".to_owned()),
                    UserId("u-emp".to_owned()),
                ])
                .with_payload("level", "1"),
            )
            .expect("in-memory delivery");

        let recorded = notifier.of_kind(NotificationKind::Advanced);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].recipients.len(), 2);
        assert_eq!(recorded[0].payload.get("level").map(String::as_str), Some("1"));
        assert_eq!(recorded[0].kind.event_type(), "request.advanced");
        assert!(notifier.of_kind(NotificationKind::Rejected).is_empty());
    }
}
