//! Timestamps.

/// A point in time expressed as a pair of nanosecond counters: wall-clock (`system_ns`) and
/// monotonic (`monotonic_ns`).
///
/// The two components are compared and combined independently; a `Timestamp` has no total
/// ordering of its own; `Timestamp`s are combined "oldest wins" component-wise wherever the
/// transfer reassemblers need to track the earliest frame seen for a transfer (see
/// [`Timestamp::earliest`]).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Timestamp {
    pub system_ns: u64,
    pub monotonic_ns: u64,
}

impl Timestamp {
    pub const fn new(system_ns: u64, monotonic_ns: u64) -> Self {
        Timestamp {
            system_ns,
            monotonic_ns,
        }
    }

    pub const ZERO: Timestamp = Timestamp::new(0, 0);

    /// Combines two timestamps by taking the older value of each component independently.
    ///
    /// This is the timestamp-clamping rule used by the generic transfer reassembler (the system
    /// and monotonic components are not assumed to be consistent with each other).
    pub fn earliest(self, other: Timestamp) -> Timestamp {
        Timestamp {
            system_ns: self.system_ns.min(other.system_ns),
            monotonic_ns: self.monotonic_ns.min(other.monotonic_ns),
        }
    }

    /// The duration, in nanoseconds, from `self` to `later` measured on the monotonic clock.
    /// Saturates to zero if `later` is not actually later.
    pub fn monotonic_since(self, later: Timestamp) -> u64 {
        later.monotonic_ns.saturating_sub(self.monotonic_ns)
    }
}

#[cfg(feature = "std")]
mod std_clock {
    use super::Timestamp;
    use std::time::{SystemTime, UNIX_EPOCH};

    impl Timestamp {
        /// Samples the current time, monotonic clock first, then wall clock, matching the
        /// ordering documented in the data model (the two reads are not atomic with each other).
        pub fn now(epoch: &std::time::Instant) -> Timestamp {
            let monotonic_ns = epoch.elapsed().as_nanos() as u64;
            let system_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            Timestamp::new(system_ns, monotonic_ns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_is_component_wise() {
        let a = Timestamp::new(100, 5);
        let b = Timestamp::new(50, 20);
        let combined = a.earliest(b);
        assert_eq!(combined, Timestamp::new(50, 5));
    }

    #[test]
    fn monotonic_since_saturates() {
        let a = Timestamp::new(0, 100);
        let b = Timestamp::new(0, 50);
        assert_eq!(a.monotonic_since(b), 0);
    }
}
