use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Counters shared by a list and every fragment in its chain.
#[derive(Default, Debug)]
pub(crate) struct ListMetrics {
    head_fetches: AtomicU64,
    page_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    fragments_absorbed: AtomicU64,
    token_misses: AtomicU64,
    relocated_reads: AtomicU64,
}

impl ListMetrics {
    pub fn head_fetched(&self) {
        self.head_fetches.fetch_add(1, Relaxed);
    }

    pub fn page_fetched(&self) {
        self.page_fetches.fetch_add(1, Relaxed);
    }

    pub fn fetch_failed(&self) {
        self.failed_fetches.fetch_add(1, Relaxed);
    }

    pub fn absorbed(&self, fragments: usize) {
        self.fragments_absorbed.fetch_add(fragments as u64, Relaxed);
    }

    pub fn token_missed(&self) {
        self.token_misses.fetch_add(1, Relaxed);
    }

    pub fn read_relocated(&self) {
        self.relocated_reads.fetch_add(1, Relaxed);
    }

    pub fn stats(&self) -> ListStats {
        ListStats {
            head_fetches: self.head_fetches.load(Relaxed),
            page_fetches: self.page_fetches.load(Relaxed),
            failed_fetches: self.failed_fetches.load(Relaxed),
            fragments_absorbed: self.fragments_absorbed.load(Relaxed),
            token_misses: self.token_misses.load(Relaxed),
            relocated_reads: self.relocated_reads.load(Relaxed),
        }
    }
}

/// A point-in-time copy of a list's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListStats {
    /// Upstream loads of a first page, successful or not.
    pub head_fetches: u64,
    /// Upstream loads of a continuation page, successful or not.
    pub page_fetches: u64,
    /// Upstream loads that returned an error.
    pub failed_fetches: u64,
    /// Fragments spliced into their predecessor.
    pub fragments_absorbed: u64,
    /// Token-addressed reads whose token was not found.
    pub token_misses: u64,
    /// Reads restarted because their fragment was absorbed mid-read.
    pub relocated_reads: u64,
}

#[derive(Default, Debug)]
pub(crate) struct CacheMetrics {
    hits: AtomicU64,
    joins: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl CacheMetrics {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Relaxed);
    }

    pub fn joined(&self) {
        self.joins.fetch_add(1, Relaxed);
    }

    pub fn missed(&self) {
        self.misses.fetch_add(1, Relaxed);
    }

    pub fn failed(&self) {
        self.failures.fetch_add(1, Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Relaxed),
            joins: self.joins.load(Relaxed),
            misses: self.misses.load(Relaxed),
            failures: self.failures.load(Relaxed),
        }
    }
}

/// A point-in-time copy of a cache's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a resolved entry.
    pub hits: u64,
    /// Lookups that joined a fetch already in flight.
    pub joins: u64,
    /// Lookups that started a new fetch.
    pub misses: u64,
    /// Fetches, including seeded ones, that settled with an error.
    pub failures: u64,
}
