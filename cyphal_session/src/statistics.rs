//! Shared session statistics: transfers, frames, payload bytes, errors,
//! drops. Plain atomics so a background reader thread and the session's owning thread can update
//! and read them without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Statistics {
    transfers: AtomicU64,
    frames: AtomicU64,
    payload_bytes: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
}

/// A point-in-time copy of a [`Statistics`] counter set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct StatisticsSnapshot {
    pub transfers: u64,
    pub frames: u64,
    pub payload_bytes: u64,
    pub errors: u64,
    pub drops: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            transfers: self.transfers.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }

    pub fn record_transfer(&self, frame_count: u64, payload_bytes: u64) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(frame_count, Ordering::Relaxed);
        self.payload_bytes.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Statistics::new();
        stats.record_transfer(3, 100);
        stats.record_transfer(1, 8);
        stats.record_error();
        stats.record_drop();
        stats.record_drop();
        assert_eq!(
            stats.snapshot(),
            StatisticsSnapshot {
                transfers: 2,
                frames: 4,
                payload_bytes: 108,
                errors: 1,
                drops: 2,
            }
        );
    }
}
