use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    AdmissionPermit, CallError, CheckIntervalDivisor, CheckIntervalMs, ConcurrencyLimit,
    CounterKey, CounterStore, TrammelError, Window, admission::AdmissionController,
    call_tracker::CallTracker,
};

// Floor for derived poll intervals, so a tiny window over a huge divisor cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for a [`Throttle`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use trammel::{CheckIntervalDivisor, ConcurrencyLimit, CounterKey, ThrottleOptions, Window};
///
/// let options = ThrottleOptions {
///     key: CounterKey::try_from("reports:export").unwrap(),
///     limit: ConcurrencyLimit::try_from(3).unwrap(),
///     window: Window::fixed(Duration::from_secs(5)).unwrap(),
///     check_interval_divisor: CheckIntervalDivisor::default(),
///     check_interval_ms: None,
/// };
///
/// assert_eq!(options.poll_interval(), Duration::from_millis(1250));
/// ```
#[derive(Clone, Debug)]
pub struct ThrottleOptions {
    /// Store key of the shared counter.
    pub key: CounterKey,

    /// Maximum number of concurrently admitted calls across every instance sharing
    /// `key`.
    pub limit: ConcurrencyLimit,

    /// How the counter's window resets. See [`Window`].
    pub window: Window,

    /// Divides the window duration into the poll interval. Default: 4.
    ///
    /// Ignored when `check_interval_ms` is set.
    pub check_interval_divisor: CheckIntervalDivisor,

    /// Explicit poll interval. Overrides the divisor-derived value.
    pub check_interval_ms: Option<CheckIntervalMs>,
}

impl ThrottleOptions {
    /// Time between re-checks while at capacity.
    pub fn poll_interval(&self) -> Duration {
        match self.check_interval_ms {
            Some(ms) => Duration::from_millis(*ms),
            None => (self.window.duration() / *self.check_interval_divisor).max(MIN_POLL_INTERVAL),
        }
    }
}

/// Distributed concurrency throttle.
///
/// Bounds how many calls may be in flight at once across every process whose
/// throttle uses the same key, coordinating only through the shared counter in a
/// [`CounterStore`].
///
/// A call is admitted when its atomic increment leaves the counter at or below the
/// limit; otherwise it polls until a slot frees up. The counter is decremented when
/// the call settles, whether the operation succeeded or failed.
///
/// # Semantics & Limitations
///
/// - **No fairness:** waiters are not queued; any of them may win the next free slot
/// - **No timeout:** a call waits until it is admitted. Wrap it externally if needed;
///   a dropped call still returns its slot (see [`AdmissionPermit`])
/// - **Approximate bound:** racing claimants can overshoot the limit for one round
///   trip before rolling back
/// - **Store failures** abort the call with [`CallError::Store`] and are not retried
///
/// Clones share the same store, key and local tallies.
///
/// # Examples
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use trammel::{
///     CheckIntervalDivisor, ConcurrencyLimit, CounterKey, MemoryCounterStore, Throttle,
///     ThrottleOptions, Window,
/// };
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryCounterStore::new());
///
/// let throttle = Throttle::new(
///     store,
///     ThrottleOptions {
///         key: CounterKey::try_from("thumbnails")?,
///         limit: ConcurrencyLimit::try_from(3)?,
///         window: Window::self_expiring(Duration::from_secs(30))?,
///         check_interval_divisor: CheckIntervalDivisor::default(),
///         check_interval_ms: None,
///     },
/// );
///
/// let size = throttle
///     .run(|| async { Ok::<_, std::io::Error>(42u64) })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Throttle<S: CounterStore> {
    controller: Arc<AdmissionController<S>>,
}

impl<S: CounterStore> Clone for Throttle<S> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
        }
    }
}

impl<S: CounterStore> std::fmt::Debug for Throttle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("key", &self.controller.key)
            .field("limit", &*self.controller.limit)
            .field("window", &self.controller.window)
            .field("poll_interval", &self.controller.poll_interval)
            .field("running", &self.running_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

impl<S: CounterStore> Throttle<S> {
    /// Create a throttle over `store`.
    ///
    /// To share one store between throttles, pass an `Arc` of it.
    pub fn new(store: S, options: ThrottleOptions) -> Self {
        let poll_interval = options.poll_interval();

        Self {
            controller: Arc::new(AdmissionController {
                store,
                key: options.key,
                limit: options.limit,
                window: options.window,
                poll_interval,
                tracker: Arc::new(CallTracker::new()),
            }),
        }
    } // end constructor

    /// Bind `operation` to this throttle, so it can be invoked with just its
    /// arguments. See [`Throttled::call`].
    pub fn wrap<F>(self, operation: F) -> Throttled<S, F> {
        Throttled {
            throttle: self,
            operation,
        }
    }

    /// Run `operation` once a slot is available.
    ///
    /// Returns the operation's result, with its error wrapped in
    /// [`CallError::Operation`]. If the store fails while the call is being admitted,
    /// the operation is never run and [`CallError::Store`] is returned.
    ///
    /// The slot is released after the operation settles. A failing release is logged
    /// and does not replace the operation's result.
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().await.map_err(CallError::Store)?;

        let result = operation().await;

        if let Err(err) = permit.release().await {
            tracing::error!(
                key = %self.controller.key,
                error = ?err,
                "failed to release slot after call settled"
            );
        }

        result.map_err(CallError::Operation)
    }

    /// Wait for a slot and return it as a permit.
    ///
    /// The call counts as waiting until the permit is released or dropped.
    pub async fn acquire(&self) -> Result<AdmissionPermit<S>, TrammelError> {
        let waiting = self.controller.tracker.enter();
        self.controller.admit(waiting).await
    }

    /// Delete the shared counter and zero the local tallies.
    ///
    /// Calls already admitted or waiting are not cancelled. Admitted calls will still
    /// decrement the fresh counter when they settle, which can drive it negative
    /// until the next reset or expiry; reset only while nothing is outstanding.
    pub async fn reset(&self) -> Result<(), TrammelError> {
        self.controller.store.delete(&self.controller.key).await?;
        self.controller.tracker.reset();
        Ok(())
    }

    /// Last counter value this instance observed (`0` if it never read the store).
    pub fn running_count(&self) -> i64 {
        self.controller.tracker.running()
    }

    /// Calls on this instance that are queued or executing.
    pub fn waiting_count(&self) -> u64 {
        self.controller.tracker.waiting()
    }

    /// Read the counter from the store, bypassing and refreshing the cached value.
    pub async fn running_store_count(&self) -> Result<i64, TrammelError> {
        let value = self.controller.store.get(&self.controller.key).await?;
        self.controller.tracker.observe(value);
        Ok(value)
    }

    /// Store key of the shared counter.
    pub fn key(&self) -> &CounterKey {
        &self.controller.key
    }

    /// Configured concurrency limit.
    pub fn limit(&self) -> ConcurrencyLimit {
        self.controller.limit
    }

    /// Configured window.
    pub fn window(&self) -> Window {
        self.controller.window
    }

    /// Time between re-checks while at capacity.
    pub fn poll_interval(&self) -> Duration {
        self.controller.poll_interval
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.controller.store
    }
}

/// A [`Throttle`] bound to one operation.
///
/// The operation takes a single argument; use a tuple or a struct for more.
pub struct Throttled<S: CounterStore, F> {
    throttle: Throttle<S>,
    operation: F,
}

impl<S: CounterStore, F> Throttled<S, F> {
    /// Run the bound operation with `args` once a slot is available.
    ///
    /// Same admission and error semantics as [`Throttle::run`].
    pub async fn call<A, Fut, T, E>(&self, args: A) -> Result<T, CallError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.throttle.run(|| (self.operation)(args)).await
    }

    /// The throttle this operation runs through.
    pub fn throttle(&self) -> &Throttle<S> {
        &self.throttle
    }

    /// See [`Throttle::reset`].
    pub async fn reset(&self) -> Result<(), TrammelError> {
        self.throttle.reset().await
    }

    /// See [`Throttle::running_count`].
    pub fn running_count(&self) -> i64 {
        self.throttle.running_count()
    }

    /// See [`Throttle::waiting_count`].
    pub fn waiting_count(&self) -> u64 {
        self.throttle.waiting_count()
    }

    /// See [`Throttle::running_store_count`].
    pub async fn running_store_count(&self) -> Result<i64, TrammelError> {
        self.throttle.running_store_count().await
    }
}
