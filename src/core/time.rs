//! Log-derived time.
//!
//! Every timestamp that influences replicated state is carried inside a
//! committed log entry and is therefore identical on all replicas. Session
//! expiration is evaluated against these timestamps only; wall clocks on
//! individual replicas are advisory and never mutate replicated state.

use serde::{Deserialize, Serialize};

/// A point in log-derived time.
///
/// `LogTime` values originate from `timestamp` fields of committed entries
/// and are the sole clock used for session expiration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogTime {
    /// Milliseconds since an epoch (implementation-defined).
    pub ms: u64,
}

impl LogTime {
    /// Create a log time with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// The zero point (epoch start).
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this time.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self { ms: self.ms + ms }
    }

    /// Milliseconds elapsed since an earlier time, saturating at zero.
    pub const fn elapsed_since(self, earlier: LogTime) -> u64 {
        self.ms.saturating_sub(earlier.ms)
    }

    /// Check whether this time is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: LogTime) -> bool {
        self.ms >= deadline.ms
    }

    /// The later of two times.
    pub fn later(self, other: LogTime) -> LogTime {
        if other.ms > self.ms {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for LogTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogTime({}ms)", self.ms)
    }
}
