//! Accounting for scarce codec sessions.
//!
//! Hardware decoders and encoders are limited per process. Backends take a
//! [`ResourceGuard`] for every session they open so callers (and tests) can
//! verify that every acquisition was matched by a release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Extractor,
    Decoder,
    Encoder,
    Muxer,
}

/// Live session counts at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    pub extractors: usize,
    pub decoders: usize,
    pub encoders: usize,
    pub muxers: usize,
}

impl ResourceSnapshot {
    /// Decoder + encoder sessions, the OS-limited ones.
    pub fn codec_sessions(&self) -> usize {
        self.decoders + self.encoders
    }

    pub fn total(&self) -> usize {
        self.extractors + self.decoders + self.encoders + self.muxers
    }
}

#[derive(Debug, Default)]
struct Counters {
    extractors: AtomicUsize,
    decoders: AtomicUsize,
    encoders: AtomicUsize,
    muxers: AtomicUsize,
    acquired_total: AtomicUsize,
}

impl Counters {
    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Extractor => &self.extractors,
            ResourceKind::Decoder => &self.decoders,
            ResourceKind::Encoder => &self.encoders,
            ResourceKind::Muxer => &self.muxers,
        }
    }
}

/// Shared live-session counters.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    counters: Arc<Counters>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, kind: ResourceKind) -> ResourceGuard {
        self.counters.counter(kind).fetch_add(1, Ordering::SeqCst);
        self.counters.acquired_total.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(?kind, "codec resource acquired");
        ResourceGuard {
            counters: Arc::clone(&self.counters),
            kind,
            released: false,
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            extractors: self.counters.extractors.load(Ordering::SeqCst),
            decoders: self.counters.decoders.load(Ordering::SeqCst),
            encoders: self.counters.encoders.load(Ordering::SeqCst),
            muxers: self.counters.muxers.load(Ordering::SeqCst),
        }
    }

    /// Sessions ever opened through this ledger.
    pub fn acquired_total(&self) -> usize {
        self.counters.acquired_total.load(Ordering::SeqCst)
    }
}

/// One live session. Released explicitly or on drop, exactly once.
#[derive(Debug)]
pub struct ResourceGuard {
    counters: Arc<Counters>,
    kind: ResourceKind,
    released: bool,
}

impl ResourceGuard {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns `true` if this call performed the release.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.counters.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(kind = ?self.kind, "codec resource released");
        true
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counts_once() {
        let ledger = ResourceLedger::new();
        let mut decoder = ledger.acquire(ResourceKind::Decoder);
        let _encoder = ledger.acquire(ResourceKind::Encoder);
        assert_eq!(ledger.snapshot().codec_sessions(), 2);

        assert!(decoder.release());
        assert!(!decoder.release());
        assert_eq!(ledger.snapshot().decoders, 0);
        drop(decoder);
        assert_eq!(ledger.snapshot().decoders, 0);
        assert_eq!(ledger.snapshot().encoders, 1);
    }

    #[test]
    fn test_drop_releases() {
        let ledger = ResourceLedger::new();
        {
            let _muxer = ledger.acquire(ResourceKind::Muxer);
            assert_eq!(ledger.snapshot().muxers, 1);
        }
        assert_eq!(ledger.snapshot(), ResourceSnapshot::default());
        assert_eq!(ledger.acquired_total(), 1);
    }
}
