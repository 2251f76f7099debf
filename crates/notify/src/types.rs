//! Core data model shared by transports, reconciliation and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a notification, used by consumers for routing and icons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Contact,
    Consultant,
    Community,
}

/// A single server-assigned notification.
///
/// `id` is unique and stable and is the sole de-duplication key. Canonical
/// ordering is descending `created_at`, ties broken by descending `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub target_route: String,
    #[serde(default)]
    pub reference_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Sort a notification list into canonical order.
pub fn canonical_sort(items: &mut [Notification]) {
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Connection status as owned by the active transport and mirrored by the
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Polling,
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Polling => "polling",
            Self::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Standard backend response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub pages: u32,
}

/// Payload of `GET /notifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub pagination: Pagination,
}

/// Payload of `GET /notifications/unread-count`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnreadCountData {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: i64, secs: i64) -> Notification {
        Notification {
            id,
            title: format!("n{id}"),
            message: String::new(),
            target_route: String::new(),
            reference_id: 0,
            kind: NotificationKind::Contact,
            is_read: false,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn canonical_order_is_created_at_desc_then_id_desc() {
        let mut items = vec![item(1, 100), item(3, 200), item(2, 200)];
        canonical_sort(&mut items);
        let ids: Vec<i64> = items.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn notification_deserializes_backend_shape() {
        let json = r#"{
            "id": 7,
            "title": "New contact request",
            "message": "Someone wrote in",
            "targetRoute": "/admin/contact-responses",
            "referenceId": 42,
            "type": "contact",
            "isRead": false,
            "createdAt": "2026-08-24T10:00:00Z"
        }"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.id, 7);
        assert_eq!(n.kind, NotificationKind::Contact);
        assert_eq!(n.target_route, "/admin/contact-responses");
        assert!(!n.is_read);
    }
}
