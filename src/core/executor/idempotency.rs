//! Idempotency cache for order submissions.
//!
//! The first submitter of a `client_id` becomes the owner and runs the real
//! submission; concurrent and later duplicates become followers and receive
//! the owner's outcome without a second venue call. Completed outcomes are
//! kept for a short TTL and swept lazily.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};

type Shared<T> = Arc<Result<T>>;

enum Slot<T> {
    InFlight(watch::Receiver<Option<Shared<T>>>),
    Done { outcome: Shared<T>, at: Instant },
}

/// Result of claiming a `client_id`.
pub enum Claim<T> {
    /// This caller runs the submission and must complete the guard.
    Owner(OwnerGuard<T>),
    /// Another submission owns this id; await its outcome.
    Follower(watch::Receiver<Option<Shared<T>>>),
}

/// Completion handle held by the owning submission.
pub struct OwnerGuard<T> {
    client_id: Uuid,
    tx: watch::Sender<Option<Shared<T>>>,
    slots: Arc<DashMap<Uuid, Slot<T>>>,
    completed: bool,
}

impl<T> OwnerGuard<T> {
    /// Publish the outcome to followers and cache it for the TTL window.
    pub fn complete(mut self, outcome: Result<T>) -> Shared<T> {
        let shared = Arc::new(outcome);
        self.slots.insert(
            self.client_id,
            Slot::Done {
                outcome: Arc::clone(&shared),
                at: Instant::now(),
            },
        );
        let _ = self.tx.send(Some(Arc::clone(&shared)));
        self.completed = true;
        shared
    }
}

impl<T> Drop for OwnerGuard<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Owner abandoned the submission (cancelled / panicked): release the
        // id so a retry can own it, and unblock any followers.
        self.slots.remove(&self.client_id);
        let _ = self.tx.send(Some(Arc::new(Err(Error::Cancelled))));
    }
}

/// Short-lived `client_id → outcome` map.
pub struct IdempotencyCache<T> {
    slots: Arc<DashMap<Uuid, Slot<T>>>,
    ttl: Duration,
}

impl<T: Clone> IdempotencyCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Claim `client_id`, sweeping expired outcomes on the way.
    pub fn begin(&self, client_id: Uuid) -> Claim<T> {
        self.sweep();

        if let Some(slot) = self.slots.get(&client_id) {
            match &*slot {
                Slot::Done { outcome, .. } => {
                    let (_, rx) = watch::channel(Some(Arc::clone(outcome)));
                    return Claim::Follower(rx);
                }
                Slot::InFlight(rx) => return Claim::Follower(rx.clone()),
            }
        }

        let (tx, rx) = watch::channel(None);
        // entry() guards the race between two simultaneous first submitters.
        match self.slots.entry(client_id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => match occupied.get() {
                Slot::Done { outcome, .. } => {
                    let (_, rx) = watch::channel(Some(Arc::clone(outcome)));
                    Claim::Follower(rx)
                }
                Slot::InFlight(rx) => Claim::Follower(rx.clone()),
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Slot::InFlight(rx));
                Claim::Owner(OwnerGuard {
                    client_id,
                    tx,
                    slots: Arc::clone(&self.slots),
                    completed: false,
                })
            }
        }
    }

    /// Await a follower's copy of the owner's outcome.
    pub async fn await_outcome(
        mut rx: watch::Receiver<Option<Shared<T>>>,
    ) -> Result<T> {
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return match &*outcome {
                    Ok(value) => Ok(value.clone()),
                    Err(err) => Err(err.clone()),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Number of live entries (in-flight plus unexpired outcomes).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn sweep(&self) {
        let ttl = self.ttl;
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight(_) => true,
            Slot::Done { at, .. } => at.elapsed() < ttl,
        });
    }
}
