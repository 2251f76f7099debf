//! Reconciliation of raw unread-count signals into concrete notification
//! events.
//!
//! The count delta only decides *whether* to look; the list fetch is the
//! source of truth for *which* items are new. List fetches are tagged with a
//! monotonically increasing sequence number and applied last-request-wins, so
//! an older response that resolves late can never overwrite state already
//! written by a newer one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::NotificationFetcher;
use crate::store::LocalNotificationStore;
use crate::types::{Notification, canonical_sort};

#[derive(Debug, Default)]
struct ReconcileState {
    prev_count: u64,
    applied_seq: u64,
}

pub struct ReconciliationEngine {
    fetcher: Arc<dyn NotificationFetcher>,
    store: Arc<LocalNotificationStore>,
    page_size: u32,
    recent_window: chrono::Duration,
    state: Mutex<ReconcileState>,
    next_seq: AtomicU64,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(
        fetcher: Arc<dyn NotificationFetcher>,
        store: Arc<LocalNotificationStore>,
        page_size: u32,
        recent_window: std::time::Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            store,
            page_size,
            recent_window: chrono::Duration::from_std(recent_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            state: Mutex::new(ReconcileState::default()),
            next_seq: AtomicU64::new(0),
            cancel,
        }
    }

    /// Handle one unread-count signal from the active transport.
    ///
    /// Counts arrive in channel order, so `prev` is advanced at receipt time;
    /// only the list fetch races and that is sequenced separately.
    pub fn handle_unread_count(self: &Arc<Self>, count: u64) {
        self.store.set_unread_count(count);

        let prev = {
            let mut state = self.state.lock();
            let prev = state.prev_count;
            state.prev_count = count;
            prev
        };

        if count <= prev {
            // External mark-read or no change; nothing new to announce.
            return;
        }

        info!(count, prev, "unread count increased, fetching latest page");
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.fetcher.recent(this.page_size).await {
                Ok(list) => {
                    if this.cancel.is_cancelled() {
                        debug!(seq, "discarding fetch result after stop");
                        return;
                    }
                    this.apply_fetch(seq, list);
                }
                Err(e) => {
                    if !this.cancel.is_cancelled() {
                        warn!(seq, error = %e, "reconciliation fetch failed");
                    }
                }
            }
        });
    }

    /// Apply a completed list fetch. Returns false when the result was
    /// discarded because a later-sequenced fetch already landed.
    fn apply_fetch(&self, seq: u64, list: Vec<Notification>) -> bool {
        let mut state = self.state.lock();
        if seq <= state.applied_seq {
            debug!(
                seq,
                applied = state.applied_seq,
                "discarding out-of-order fetch result"
            );
            return false;
        }
        state.applied_seq = seq;

        let known_ids: HashSet<i64> =
            self.store.notifications().iter().map(|n| n.id).collect();

        // The backend's order is authoritative; replace, never merge.
        self.store.set_notifications(list.clone());

        let cutoff = Utc::now() - self.recent_window;
        let mut fresh: Vec<Notification> = list
            .into_iter()
            .filter(|n| !known_ids.contains(&n.id) && !n.is_read && n.created_at >= cutoff)
            .collect();
        canonical_sort(&mut fresh);

        drop(state);
        for item in fresh {
            debug!(id = item.id, title = %item.title, "announcing new notification");
            self.store.announce(item);
        }
        true
    }

    /// A server-pushed notification frame (stream transport). Provisional:
    /// still de-duplicated by id against the store.
    pub fn handle_pushed(&self, notification: Notification) {
        let unread = !notification.is_read;
        if self.store.insert_sorted(notification.clone()) && unread {
            self.store.announce(notification);
        }
    }

    /// A local optimistic decrement happened (mark-read); keep `prev` in step
    /// so the next equal count from the server is not mistaken for growth.
    pub fn note_local_decrement(&self) {
        let mut state = self.state.lock();
        state.prev_count = state.prev_count.saturating_sub(1);
    }

    /// All items were marked read locally.
    pub fn note_local_reset(&self) {
        self.state.lock().prev_count = 0;
    }

    /// Seed `prev` from a one-shot count load without triggering a fetch.
    pub fn seed_count(&self, count: u64) {
        self.state.lock().prev_count = count;
        self.store.set_unread_count(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::types::NotificationKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn item(id: i64, age_secs: i64, is_read: bool) -> Notification {
        Notification {
            id,
            title: format!("n{id}"),
            message: String::new(),
            target_route: String::new(),
            reference_id: 0,
            kind: NotificationKind::Consultant,
            is_read,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    /// Fetcher whose `recent` calls block until the test resolves them,
    /// allowing out-of-order completion.
    struct GatedFetcher {
        pending: Mutex<VecDeque<oneshot::Sender<Result<Vec<Notification>>>>>,
    }

    impl GatedFetcher {
        fn new() -> Self {
            Self {
                pending: Mutex::new(VecDeque::new()),
            }
        }

        /// Wait until `n` calls are in flight.
        async fn wait_for_calls(&self, n: usize) {
            for _ in 0..200 {
                if self.pending.lock().len() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {n} in-flight recent() calls");
        }

        fn resolve_call(&self, index: usize, result: Result<Vec<Notification>>) {
            let tx = self
                .pending
                .lock()
                .remove(index)
                .expect("no such in-flight call");
            let _ = tx.send(result);
        }
    }

    #[async_trait]
    impl NotificationFetcher for GatedFetcher {
        async fn unread_count(&self) -> Result<u64> {
            Ok(0)
        }

        async fn recent(&self, _page_size: u32) -> Result<Vec<Notification>> {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push_back(tx);
            rx.await.map_err(|_| EngineError::Internal {
                reason: "gate dropped".into(),
            })?
        }
    }

    /// Fetcher returning canned pages in order.
    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Vec<Notification>>>,
    }

    #[async_trait]
    impl NotificationFetcher for ScriptedFetcher {
        async fn unread_count(&self) -> Result<u64> {
            Ok(0)
        }

        async fn recent(&self, _page_size: u32) -> Result<Vec<Notification>> {
            Ok(self.pages.lock().pop_front().unwrap_or_default())
        }
    }

    fn engine_with(
        fetcher: Arc<dyn NotificationFetcher>,
    ) -> (Arc<ReconciliationEngine>, Arc<LocalNotificationStore>) {
        let store = Arc::new(LocalNotificationStore::new());
        let engine = Arc::new(ReconciliationEngine::new(
            fetcher,
            Arc::clone(&store),
            10,
            Duration::from_secs(60),
            CancellationToken::new(),
        ));
        (engine, store)
    }

    async fn drain_new(
        rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn cold_start_announces_each_unread_recent_item_in_order() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([vec![
                item(3, 5, false),
                item(2, 10, false),
                item(1, 20, false),
            ]])),
        });
        let (engine, store) = engine_with(fetcher);
        let mut new_rx = store.subscribe_new();

        engine.handle_unread_count(3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let announced = drain_new(&mut new_rx).await;
        let ids: Vec<i64> = announced.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(store.unread_count(), 3);
        assert_eq!(store.notifications().len(), 3);
    }

    #[tokio::test]
    async fn count_decrease_updates_count_without_fetch() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([vec![item(1, 5, false)]])),
        });
        let (engine, store) = engine_with(fetcher);
        engine.handle_unread_count(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut new_rx = store.subscribe_new();
        engine.handle_unread_count(0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.unread_count(), 0);
        assert!(drain_new(&mut new_rx).await.is_empty());
        // List untouched by a pure count decrement.
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn stale_items_are_not_reannounced() {
        // Items older than the recency window surface in the list but are
        // not announced.
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([vec![
                item(2, 5, false),
                item(1, 3_600, false),
            ]])),
        });
        let (engine, store) = engine_with(fetcher);
        let mut new_rx = store.subscribe_new();

        engine.handle_unread_count(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let announced = drain_new(&mut new_rx).await;
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].id, 2);
        assert_eq!(store.notifications().len(), 2);
    }

    #[tokio::test]
    async fn read_items_are_not_announced() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([vec![
                item(2, 5, true),
                item(1, 5, false),
            ]])),
        });
        let (engine, store) = engine_with(fetcher);
        let mut new_rx = store.subscribe_new();

        engine.handle_unread_count(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let announced = drain_new(&mut new_rx).await;
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].id, 1);
    }

    #[tokio::test]
    async fn no_id_is_announced_twice() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([
                vec![item(1, 5, false)],
                vec![item(2, 5, false), item(1, 5, false)],
            ])),
        });
        let (engine, store) = engine_with(fetcher);
        let mut new_rx = store.subscribe_new();

        engine.handle_unread_count(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.handle_unread_count(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let announced = drain_new(&mut new_rx).await;
        let ids: Vec<i64> = announced.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn later_fetch_wins_even_when_earlier_resolves_after() {
        let fetcher = Arc::new(GatedFetcher::new());
        let (engine, store) = engine_with(Arc::clone(&fetcher) as Arc<dyn NotificationFetcher>);
        let mut new_rx = store.subscribe_new();

        // Fetch A (count 1), then fetch B (count 2) while A is in flight.
        engine.handle_unread_count(1);
        fetcher.wait_for_calls(1).await;
        engine.handle_unread_count(2);
        fetcher.wait_for_calls(2).await;

        // B resolves first.
        fetcher.resolve_call(1, Ok(vec![item(2, 5, false), item(1, 5, false)]));
        for _ in 0..200 {
            if store.notifications().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A resolves late with the older page; it must be discarded.
        fetcher.resolve_call(0, Ok(vec![item(1, 5, false)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ids: Vec<i64> = store.notifications().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 1]);

        let announced = drain_new(&mut new_rx).await;
        let mut announced_ids: Vec<i64> = announced.iter().map(|n| n.id).collect();
        announced_ids.sort_unstable();
        announced_ids.dedup();
        assert_eq!(announced_ids.len(), announced.len(), "duplicate announcements");
    }

    #[tokio::test]
    async fn stop_discards_in_flight_fetch() {
        let fetcher = Arc::new(GatedFetcher::new());
        let store = Arc::new(LocalNotificationStore::new());
        let cancel = CancellationToken::new();
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&fetcher) as Arc<dyn NotificationFetcher>,
            Arc::clone(&store),
            10,
            Duration::from_secs(60),
            cancel.clone(),
        ));
        let mut new_rx = store.subscribe_new();

        engine.handle_unread_count(1);
        fetcher.wait_for_calls(1).await;

        cancel.cancel();
        fetcher.resolve_call(0, Ok(vec![item(1, 5, false)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.notifications().is_empty());
        assert!(drain_new(&mut new_rx).await.is_empty());
    }

    #[tokio::test]
    async fn pushed_notifications_are_deduplicated() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::new()),
        });
        let (engine, store) = engine_with(fetcher);
        let mut new_rx = store.subscribe_new();

        engine.handle_pushed(item(1, 5, false));
        engine.handle_pushed(item(1, 5, false));

        assert_eq!(drain_new(&mut new_rx).await.len(), 1);
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn local_decrement_keeps_prev_in_step() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: Mutex::new(VecDeque::from([
                vec![item(1, 5, false)],
                vec![item(1, 5, true), item(2, 5, false)],
            ])),
        });
        let (engine, store) = engine_with(fetcher);
        engine.handle_unread_count(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Host marks the item read; server count will come back as 1 when a
        // genuinely new item arrives, and that must still trigger a fetch.
        store.mark_read(1);
        engine.note_local_decrement();

        let mut new_rx = store.subscribe_new();
        engine.handle_unread_count(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let announced = drain_new(&mut new_rx).await;
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].id, 2);
    }
}
