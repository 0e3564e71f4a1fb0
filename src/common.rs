use std::{ops::Deref, sync::Arc, time::Duration};

use crate::TrammelError;

/// Longest accepted window: about 136 years, far inside Redis's expiry range.
const MAX_WINDOW: Duration = Duration::from_secs(u32::MAX as u64);

/// Longest accepted counter key, in bytes.
const MAX_COUNTER_KEY_LEN: usize = 512;

/// A validated store key identifying one shared counter.
///
/// The key is sent to the store verbatim, so every process that builds a throttle
/// with the same key shares the same admission bound.
///
/// Constraints:
/// - Must not be empty
/// - Must not be longer than 512 bytes
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct CounterKey(Arc<str>);

impl CounterKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for CounterKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CounterKey {
    type Error = TrammelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(TrammelError::InvalidCounterKey(
                "Counter key must not be empty".to_string(),
            ))
        } else if value.len() > MAX_COUNTER_KEY_LEN {
            Err(TrammelError::InvalidCounterKey(format!(
                "Counter key must not be longer than {MAX_COUNTER_KEY_LEN} bytes"
            )))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for CounterKey {
    type Error = TrammelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Maximum number of concurrently admitted calls sharing one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConcurrencyLimit(u64);

impl Deref for ConcurrencyLimit {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for ConcurrencyLimit {
    type Error = TrammelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TrammelError::InvalidConcurrencyLimit(
                "Concurrency limit must be at least 1".to_string(),
            ))
        } else if value > i64::MAX as u64 {
            Err(TrammelError::InvalidConcurrencyLimit(
                "Concurrency limit must fit a signed 64-bit counter".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

impl ConcurrencyLimit {
    /// The limit as a signed value, comparable with store counters.
    pub(crate) fn as_counter(&self) -> i64 {
        self.0 as i64
    }
}

/// Divides the window duration into the poll interval used while at capacity.
///
/// A larger divisor polls more often: more store round trips, but freed slots are
/// noticed sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckIntervalDivisor(u32);

impl Default for CheckIntervalDivisor {
    /// Returns a divisor of 4.
    fn default() -> Self {
        Self(4)
    }
}

impl Deref for CheckIntervalDivisor {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u32> for CheckIntervalDivisor {
    type Error = TrammelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TrammelError::InvalidCheckInterval(
                "Check interval divisor must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Explicit poll interval in milliseconds. Overrides the divisor-derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckIntervalMs(u64);

impl Deref for CheckIntervalMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for CheckIntervalMs {
    type Error = TrammelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TrammelError::InvalidCheckInterval(
                "Check interval must be greater than 0 ms".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// How the shared counter's window resets.
///
/// Both variants run the same admission algorithm; they only differ in how the
/// claim step touches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// The counter is reset by something outside the throttle (a scheduler, a cron
    /// job, or [`Throttle::reset`](crate::Throttle::reset)). Claims never carry a ttl.
    Fixed {
        /// Nominal window length. Only used to derive the poll interval.
        duration: Duration,
    },
    /// Every claim refreshes the key's time-to-live to `ttl`, so an idle key
    /// disappears from the store and the window restarts at zero.
    ///
    /// Expiry is anchored to the most recent claim: a continuously busy key never
    /// expires.
    SelfExpiring {
        /// Time-to-live applied on each claim.
        ttl: Duration,
    },
}

impl Window {
    // Every constructor accepts durations from 1 ms up to `u32::MAX` seconds.

    /// A fixed window of `duration`, reset externally.
    pub fn fixed(duration: Duration) -> Result<Self, TrammelError> {
        validate_window_duration(duration)?;
        Ok(Window::Fixed { duration })
    }

    /// A self-expiring window whose claims refresh a `ttl` on the key.
    pub fn self_expiring(ttl: Duration) -> Result<Self, TrammelError> {
        validate_window_duration(ttl)?;
        Ok(Window::SelfExpiring { ttl })
    }

    /// A fixed window given in (possibly fractional) seconds.
    pub fn fixed_secs(seconds: f64) -> Result<Self, TrammelError> {
        Self::fixed(duration_from_secs(seconds)?)
    }

    /// A self-expiring window given in (possibly fractional) seconds.
    pub fn self_expiring_secs(seconds: f64) -> Result<Self, TrammelError> {
        Self::self_expiring(duration_from_secs(seconds)?)
    }

    /// Length of one window.
    pub fn duration(&self) -> Duration {
        match self {
            Window::Fixed { duration } => *duration,
            Window::SelfExpiring { ttl } => *ttl,
        }
    }

    /// The ttl claims must set on the key, if any.
    pub fn claim_ttl(&self) -> Option<Duration> {
        match self {
            Window::Fixed { .. } => None,
            Window::SelfExpiring { ttl } => Some(*ttl),
        }
    }
}

fn duration_from_secs(seconds: f64) -> Result<Duration, TrammelError> {
    if !seconds.is_finite() || seconds <= 0f64 {
        return Err(TrammelError::InvalidWindow(
            "Window must be a finite number of seconds greater than 0".to_string(),
        ));
    }

    Duration::try_from_secs_f64(seconds)
        .map_err(|err| TrammelError::InvalidWindow(format!("Window is out of range: {err}")))
}

fn validate_window_duration(duration: Duration) -> Result<(), TrammelError> {
    // Redis PEXPIRE has millisecond resolution; anything shorter would expire at once.
    if duration.as_millis() == 0 {
        Err(TrammelError::InvalidWindow(
            "Window must be at least 1 ms".to_string(),
        ))
    } else if duration > MAX_WINDOW {
        Err(TrammelError::InvalidWindow(format!(
            "Window must not exceed {} seconds",
            MAX_WINDOW.as_secs()
        )))
    } else {
        Ok(())
    }
}
