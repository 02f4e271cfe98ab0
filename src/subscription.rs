//! Id-indexed change listeners with synchronous fan-out.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::action::ChangeEvent;

/// Identifier returned by [`Store::subscribe`](crate::Store::subscribe).
///
/// Ids increase monotonically for the lifetime of a store and are never
/// reused, even after unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Callback invoked once per [`ChangeEvent`].
pub type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync + 'static>;

/// Live subscriptions in subscription order.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    entries: Vec<(SubscriptionId, Callback)>,
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(&mut self, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Callbacks live at this instant.
    ///
    /// Notification iterates this copy, so subscribing or unsubscribing from
    /// inside a callback only affects later dispatches.
    pub(crate) fn snapshot(&self) -> Vec<(SubscriptionId, Callback)> {
        self.entries.clone()
    }
}

/// Deliver `events` to `subscribers`: for each event, every callback in
/// subscription order.
///
/// A panicking callback is logged and skipped; the remaining callbacks
/// still receive the event.
pub(crate) fn notify(subscribers: &[(SubscriptionId, Callback)], events: &[ChangeEvent]) {
    for event in events {
        for (id, callback) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(
                    subscription = id.0,
                    key = %event.key,
                    "subscriber panicked during notification"
                );
            }
        }
    }
}
