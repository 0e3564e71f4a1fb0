//! Admission control against the shared counter.
//!
//! Each attempt runs the same steps, and the loop re-enters them after every
//! backoff:
//!
//! 1. **Cached check:** if the last counter value this instance saw is already over
//!    the limit, back off without a store round trip. A call only trusts the cache
//!    once per observation: if nothing refreshed it during the call's last sleep, the
//!    next attempt reads the store instead of backing off on the same stale value.
//! 2. **Refresh:** read the counter. Over the limit: back off.
//! 3. **Claim:** atomically increment (with a ttl refresh for self-expiring windows).
//!    If the post-increment value is over the limit another claimant won the race:
//!    decrement once and back off. Otherwise the call is admitted.
//! 4. **Backoff:** sleep for the poll interval, then start over.
//!
//! Each attempt's store round trips run on a detached task. If the call is dropped
//! while its increment is in flight, the task still sees the claim through and
//! releases it when nobody is left to take the slot.
//!
//! There is no retry cap and no ordering among waiters. The bound is approximate:
//! concurrent claimants can push the counter over the limit for one round trip
//! before their rollbacks land, and racing rollbacks can briefly undercount.
//! Making admission exact would need an "increment if below" store primitive.

use std::{sync::Arc, time::Duration};

use crate::{
    CounterKey, CounterStore, TrammelError, Window,
    call_tracker::{CallTracker, WaitingGuard},
    common::ConcurrencyLimit,
    runtime,
};

/// Why an attempt did not admit the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    /// The cached counter was already over the limit.
    Cached(i64),
    /// A fresh read was over the limit.
    Refreshed(i64),
    /// The claim overshot and was rolled back; holds the post-rollback value.
    Overshoot(i64),
}

impl Backoff {
    fn reason(&self) -> &'static str {
        match self {
            Backoff::Cached(_) => "cached",
            Backoff::Refreshed(_) => "refreshed",
            Backoff::Overshoot(_) => "overshoot",
        }
    }

    fn observed(&self) -> i64 {
        match *self {
            Backoff::Cached(value) | Backoff::Refreshed(value) | Backoff::Overshoot(value) => value,
        }
    }
}

enum Attempt {
    Admitted(i64),
    Backoff(Backoff),
}

pub(crate) struct AdmissionController<S: CounterStore> {
    pub(crate) store: S,
    pub(crate) key: CounterKey,
    pub(crate) limit: ConcurrencyLimit,
    pub(crate) window: Window,
    pub(crate) poll_interval: Duration,
    pub(crate) tracker: Arc<CallTracker>,
}

impl<S: CounterStore> AdmissionController<S> {
    /// Loop until a slot is claimed. Store failures abort the loop.
    pub(crate) async fn admit(
        self: &Arc<Self>,
        waiting: WaitingGuard,
    ) -> Result<AdmissionPermit<S>, TrammelError> {
        let mut attempts: u64 = 0;
        let mut seen_generation: Option<u64> = None;

        loop {
            attempts += 1;

            match self.attempt(&mut seen_generation).await? {
                Attempt::Admitted(claimed) => {
                    tracing::trace!(
                        key = %self.key,
                        claimed,
                        limit = *self.limit,
                        attempts,
                        "admitted"
                    );

                    return Ok(AdmissionPermit {
                        controller: Arc::clone(self),
                        claimed,
                        released: false,
                        _waiting: waiting,
                    });
                }
                Attempt::Backoff(reason) => {
                    tracing::debug!(
                        key = %self.key,
                        reason = reason.reason(),
                        observed = reason.observed(),
                        limit = *self.limit,
                        attempts,
                        poll_interval = ?self.poll_interval,
                        "at capacity, backing off"
                    );

                    runtime::sleep(self.poll_interval).await;
                }
            }
        }
    } // end method admit

    async fn attempt(
        self: &Arc<Self>,
        seen_generation: &mut Option<u64>,
    ) -> Result<Attempt, TrammelError> {
        let limit = self.limit.as_counter();
        let generation = self.tracker.generation();

        if *seen_generation != Some(generation) {
            if let Some(cached) = self.tracker.observed().filter(|cached| *cached > limit) {
                *seen_generation = Some(generation);
                return Ok(Attempt::Backoff(Backoff::Cached(cached)));
            }
        }

        let attempt = self.claim_detached(limit).await;
        *seen_generation = Some(self.tracker.generation());
        attempt
    }

    /// Run [`claim`](Self::claim) on a detached task and wait for its outcome.
    ///
    /// Dropping the returned future does not strand a claim: an admitted outcome
    /// nobody received is released by whichever side notices first.
    async fn claim_detached(self: &Arc<Self>, limit: i64) -> Result<Attempt, TrammelError> {
        let (sender, receiver) = async_channel::bounded(1);
        let controller = Arc::clone(self);

        let spawned = runtime::spawn_task(async move {
            let outcome = controller.claim(limit).await;

            if let Err(async_channel::TrySendError::Closed(Ok(Attempt::Admitted(_)))) =
                sender.try_send(outcome)
            {
                if let Err(err) = controller.release().await {
                    tracing::error!(key = %controller.key, error = ?err, "failed to release orphaned claim");
                }
            }
        });

        if !spawned {
            return self.claim(limit).await;
        }

        let pending = PendingClaim {
            controller: Arc::clone(self),
            receiver,
        };

        let outcome = pending.receiver.recv().await;
        outcome.map_err(|_| TrammelError::ClaimInterrupted)?
    }

    async fn claim(&self, limit: i64) -> Result<Attempt, TrammelError> {
        let current = self.store.get(&self.key).await?;
        self.tracker.observe(current);

        if current > limit {
            return Ok(Attempt::Backoff(Backoff::Refreshed(current)));
        }

        let claimed = match self.window.claim_ttl() {
            None => self.store.increment(&self.key).await?,
            Some(ttl) => self.store.increment_with_expiry(&self.key, ttl).await?,
        };
        self.tracker.observe(claimed);

        if claimed > limit {
            let rolled_back = self.store.decrement(&self.key).await?;
            self.tracker.observe(rolled_back);

            return Ok(Attempt::Backoff(Backoff::Overshoot(rolled_back)));
        }

        Ok(Attempt::Admitted(claimed))
    }

    async fn release(&self) -> Result<i64, TrammelError> {
        let value = self.store.decrement(&self.key).await?;
        self.tracker.observe(value);
        Ok(value)
    }

    /// Release a slot from synchronous code by handing the decrement to a task.
    fn release_detached(self: Arc<Self>, what: &'static str) {
        let key = self.key.clone();

        let spawned = runtime::spawn_task(async move {
            if let Err(err) = self.release().await {
                tracing::error!(key = %self.key, error = ?err, "failed to release {what}");
            }
        });

        if !spawned {
            tracing::warn!(key = %key, "{what} not released: no async runtime available");
        }
    }
}

/// Receiving end of a detached claim, held by the waiting call.
struct PendingClaim<S: CounterStore> {
    controller: Arc<AdmissionController<S>>,
    receiver: async_channel::Receiver<Result<Attempt, TrammelError>>,
}

impl<S: CounterStore> Drop for PendingClaim<S> {
    fn drop(&mut self) {
        // After close the claim task either fails to send and releases the slot
        // itself, or its outcome is already buffered here.
        self.receiver.close();

        if let Ok(Ok(Attempt::Admitted(_))) = self.receiver.try_recv() {
            Arc::clone(&self.controller).release_detached("orphaned claim");
        }
    }
}

/// A claimed slot on the shared counter.
///
/// The slot stays claimed until [`release`](Self::release) is awaited. Dropping an
/// unreleased permit (for example when the future holding it is cancelled) hands the
/// decrement to a detached task on the current runtime; if there is none, the slot
/// stays claimed until the window expires or the key is reset.
///
/// The permit also keeps its call counted in the instance's waiting tally.
pub struct AdmissionPermit<S: CounterStore> {
    controller: Arc<AdmissionController<S>>,
    claimed: i64,
    released: bool,
    _waiting: WaitingGuard,
}

impl<S: CounterStore> AdmissionPermit<S> {
    /// Counter value right after this permit's claim.
    pub fn claimed(&self) -> i64 {
        self.claimed
    }

    /// The key this permit holds a slot on.
    pub fn key(&self) -> &CounterKey {
        &self.controller.key
    }

    /// Give the slot back, returning the counter value after the decrement.
    pub async fn release(mut self) -> Result<i64, TrammelError> {
        let result = self.controller.release().await;
        // Only mark after the round trip: a release cancelled mid-flight is retried on drop.
        self.released = true;
        result
    }
}

impl<S: CounterStore> std::fmt::Debug for AdmissionPermit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.controller.key)
            .field("claimed", &self.claimed)
            .field("released", &self.released)
            .finish()
    }
}

impl<S: CounterStore> Drop for AdmissionPermit<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        Arc::clone(&self.controller).release_detached("abandoned slot");
    }
}
