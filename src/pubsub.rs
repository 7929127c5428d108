//! Generic in-process publish/subscribe hub.
//!
//! A [`Hub`] fans published messages out to every registered
//! [`Subscriber`] without ever blocking on a slow one: each subscriber owns
//! a bounded mailbox, and when the mailbox is full the message is dropped
//! for that subscriber with a warning. Delivery is at-most-once and
//! best-effort; nothing is queued to disk. A subscriber's delivery loop
//! invokes its callback for each message in arrival order until its
//! cancellable scope ends or it is explicitly unsubscribed.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::warn;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// A named mailbox plus the callback invoked on delivery.
pub struct Subscriber<M> {
    name: String,
    capacity: usize,
    callback: Box<dyn FnMut(M) + Send>,
}

impl<M> Subscriber<M> {
    /// Create a subscriber whose mailbox holds up to `capacity` messages.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        callback: impl FnMut(M) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            callback: Box::new(callback),
        }
    }
}

/// Handle identifying a registered subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubEntry<M> {
    name: String,
    tx: mpsc::Sender<M>,
    cancel: CancellationToken,
}

struct HubInner<M> {
    subs: DashMap<u64, SubEntry<M>>,
    next_id: AtomicU64,
}

/// Cloneable fan-out hub for cross-subsystem notification.
pub struct Hub<M>(Arc<HubInner<M>>);

impl<M> Clone for Hub<M> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<M> Default for Hub<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self { Self::new() }
}

impl<M> Hub<M>
where
    M: Clone + Send + 'static,
{
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(HubInner {
            subs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }))
    }

    /// Register `subscriber` and start its delivery loop.
    ///
    /// The loop runs until `scope` is cancelled or the subscriber is
    /// removed with [`unsubscribe`](Self::unsubscribe); either way its
    /// mailbox is discarded and the hub forgets it.
    pub fn subscribe(&self, scope: &CancellationToken, subscriber: Subscriber<M>) -> SubscriptionId {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(subscriber.capacity);
        let cancel = scope.child_token();
        self.0.subs.insert(
            id,
            SubEntry {
                name: subscriber.name.clone(),
                tx,
                cancel: cancel.clone(),
            },
        );

        let hub: Weak<HubInner<M>> = Arc::downgrade(&self.0);
        let mut callback = subscriber.callback;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => callback(message),
                        None => break,
                    },
                }
            }
            if let Some(hub) = hub.upgrade() {
                hub.subs.remove(&id);
            }
        });

        SubscriptionId(id)
    }

    /// Fan `message` out to every registered subscriber.
    ///
    /// Never blocks: a subscriber whose mailbox is full loses this message
    /// (logged at warn level). Publishing under a cancelled scope is a
    /// no-op.
    pub fn publish(&self, scope: &CancellationToken, message: M) {
        if scope.is_cancelled() {
            return;
        }
        for entry in self.0.subs.iter() {
            match entry.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("subscriber {} mailbox full; message dropped", entry.name);
                }
                // Delivery loop already gone; the entry prunes itself.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Remove a subscriber and stop its delivery loop.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some((_, entry)) = self.0.subs.remove(&id.0) {
            entry.cancel.cancel();
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize { self.0.subs.len() }
}
