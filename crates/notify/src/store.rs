//! Canonical local view of the notification state.
//!
//! Single-writer: only the reconciliation engine and the explicit
//! `mark_read`/`mark_all_read`/`remove` calls routed through the engine facade
//! mutate this. Consumers subscribe to read-only views.

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::types::{ConnectionState, Notification};

const NEW_NOTIFICATION_CAPACITY: usize = 64;

pub struct LocalNotificationStore {
    notifications: watch::Sender<Vec<Notification>>,
    unread_count: watch::Sender<u64>,
    connection_state: watch::Sender<ConnectionState>,
    new_notification: broadcast::Sender<Notification>,
}

impl Default for LocalNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNotificationStore {
    pub fn new() -> Self {
        let (notifications, _) = watch::channel(Vec::new());
        let (unread_count, _) = watch::channel(0);
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (new_notification, _) = broadcast::channel(NEW_NOTIFICATION_CAPACITY);
        Self {
            notifications,
            unread_count,
            connection_state,
            new_notification,
        }
    }

    // --- read-only views ---

    pub fn watch_notifications(&self) -> watch::Receiver<Vec<Notification>> {
        self.notifications.subscribe()
    }

    pub fn watch_unread_count(&self) -> watch::Receiver<u64> {
        self.unread_count.subscribe()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    /// Stream of newly announced notifications (at-least-once, de-duplicated
    /// by id upstream).
    pub fn subscribe_new(&self) -> broadcast::Receiver<Notification> {
        self.new_notification.subscribe()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn unread_count(&self) -> u64 {
        *self.unread_count.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    // --- writer side ---

    pub(crate) fn set_notifications(&self, items: Vec<Notification>) {
        self.notifications.send_replace(items);
    }

    pub(crate) fn set_unread_count(&self, count: u64) {
        self.unread_count.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "connection state changed");
                *current = state;
                true
            }
        });
    }

    pub(crate) fn announce(&self, notification: Notification) {
        // A send error just means nobody is listening right now.
        let _ = self.new_notification.send(notification);
    }

    /// Insert a pushed notification in canonical position if its id is not
    /// already present. Returns whether it was inserted.
    pub(crate) fn insert_sorted(&self, notification: Notification) -> bool {
        let mut inserted = false;
        self.notifications.send_if_modified(|items| {
            if items.iter().any(|n| n.id == notification.id) {
                return false;
            }
            items.push(notification.clone());
            crate::types::canonical_sort(items);
            inserted = true;
            true
        });
        inserted
    }

    /// Optimistically mark one item read, decrementing the unread count
    /// (floored at zero). Returns whether an unread item was flipped.
    pub fn mark_read(&self, id: i64) -> bool {
        let mut flipped = false;
        self.notifications.send_if_modified(|items| {
            match items.iter_mut().find(|n| n.id == id && !n.is_read) {
                Some(item) => {
                    item.is_read = true;
                    flipped = true;
                    true
                }
                None => false,
            }
        });
        if flipped {
            self.unread_count
                .send_replace(self.unread_count().saturating_sub(1));
        }
        flipped
    }

    /// Optimistically mark everything read and zero the unread count.
    pub fn mark_all_read(&self) {
        self.notifications.send_if_modified(|items| {
            let mut changed = false;
            for item in items.iter_mut() {
                if !item.is_read {
                    item.is_read = true;
                    changed = true;
                }
            }
            changed
        });
        self.unread_count.send_replace(0);
    }

    /// Remove one item locally, adjusting the unread count if it was unread.
    /// Returns whether the item existed.
    pub fn remove(&self, id: i64) -> bool {
        let mut was_unread = false;
        let mut removed = false;
        self.notifications.send_if_modified(|items| {
            let before = items.len();
            items.retain(|n| {
                if n.id == id {
                    was_unread = !n.is_read;
                    false
                } else {
                    true
                }
            });
            removed = items.len() != before;
            removed
        });
        if removed && was_unread {
            self.unread_count
                .send_replace(self.unread_count().saturating_sub(1));
        }
        removed
    }
}
