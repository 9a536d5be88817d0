use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use fnv::FnvHashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::metrics::{CacheMetrics, CacheStats};
use crate::Result;

/// A joinable handle on an operation that has not settled yet. Every
/// clone resolves to the same outcome, and whichever clone is polled
/// drives the operation forward.
pub type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

type FetchFn<K, V> = dyn Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync;

type Entries<K, V> = Mutex<FnvHashMap<K, Slot<V>>>;

/// What [`SingleFlightCache::get`] found for a key.
pub enum Lookup<V> {
    /// A resolved value.
    Ready(V),
    /// An operation still in flight, which may be awaited.
    Pending(Flight<V>),
    /// Nothing is cached or in flight for the key.
    Absent,
}

impl<V> Lookup<V> {
    /// Returns the resolved value, if there is one.
    pub fn ready(self) -> Option<V> {
        match self {
            Lookup::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Returns `true` if an operation is in flight for the key.
    pub fn is_pending(&self) -> bool {
        matches!(self, Lookup::Pending(_))
    }

    /// Returns `true` if the key is neither cached nor in flight.
    pub fn is_absent(&self) -> bool {
        matches!(self, Lookup::Absent)
    }
}

/// Bookkeeping kept per resolved entry, for use by eviction policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTimes {
    /// When the value was stored.
    pub updated_at: Instant,
    /// When the value was last handed out.
    pub accessed_at: Instant,
}

enum Slot<V> {
    InFlight { generation: u64, flight: Flight<V> },
    Ready { value: V, times: EntryTimes },
}

/// A keyed memoizing cache over asynchronous lookups.
///
/// At most one fetch runs per key: callers arriving while a fetch is in
/// flight join it and observe its outcome. Successful outcomes stay
/// cached; failed ones remove the key so that the next caller starts
/// over. Nothing is ever evicted, but every entry records when it was
/// stored and last accessed.
pub struct SingleFlightCache<K, V> {
    fetch: Box<FetchFn<K, V>>,
    entries: Arc<Entries<K, V>>,
    next_generation: AtomicU64,
    metrics: Arc<CacheMetrics>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache that resolves misses with `fetch`.
    ///
    /// `fetch` is called with the cache's internal lock held and should
    /// only build its future; the actual work must happen when the
    /// future is polled.
    pub fn new<F>(fetch: F) -> SingleFlightCache<K, V>
    where
        F: Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync + 'static,
    {
        SingleFlightCache {
            fetch: Box::new(fetch),
            entries: Arc::default(),
            next_generation: AtomicU64::new(0),
            metrics: Arc::default(),
        }
    }

    /// Returns the cached value for `key`, joins the fetch in flight for
    /// it, or starts a new fetch.
    pub async fn get_or_fetch(&self, key: K) -> Result<V> {
        let flight = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(Slot::Ready { value, times }) => {
                    times.accessed_at = Instant::now();
                    self.metrics.hit();
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { flight, .. }) => {
                    self.metrics.joined();
                    flight.clone()
                }
                None => {
                    self.metrics.missed();
                    let operation = (self.fetch)(key.clone());
                    self.launch(&mut entries, key, operation)
                }
            }
        };

        flight.await
    }

    /// Non-blocking lookup. Never starts a fetch.
    pub fn get(&self, key: &K) -> Lookup<V> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(Slot::Ready { value, times }) => {
                times.accessed_at = Instant::now();
                Lookup::Ready(value.clone())
            }
            Some(Slot::InFlight { flight, .. }) => {
                Lookup::Pending(flight.clone())
            }
            None => Lookup::Absent,
        }
    }

    /// Store a value computed outside of the fetch function, replacing
    /// whatever was cached or in flight for `key`.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        let times = EntryTimes { updated_at: now, accessed_at: now };
        self.entries.lock().insert(key, Slot::Ready { value, times });
    }

    /// Store an operation computed outside of the fetch function. Its
    /// outcome is recorded exactly like a fetch started by
    /// [`get_or_fetch`](Self::get_or_fetch): kept on success, removed on
    /// failure. The returned flight may be awaited or dropped; later
    /// callers for `key` join the same operation either way.
    pub fn set_pending(
        &self,
        key: K,
        operation: BoxFuture<'static, Result<V>>,
    ) -> Flight<V> {
        let mut entries = self.entries.lock();
        self.launch(&mut entries, key, operation)
    }

    /// Forget `key`. A fetch already in flight still settles for its
    /// joined callers but no longer populates the cache.
    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Timestamps of a resolved entry.
    pub fn entry_times(&self, key: &K) -> Option<EntryTimes> {
        match self.entries.lock().get(key) {
            Some(Slot::Ready { times, .. }) => Some(*times),
            _ => None,
        }
    }

    /// Number of keys that are cached or in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no key is cached or in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Hit, join, miss and failure counters.
    pub fn stats(&self) -> CacheStats {
        self.metrics.stats()
    }

    fn launch(
        &self,
        entries: &mut FnvHashMap<K, Slot<V>>,
        key: K,
        operation: BoxFuture<'static, Result<V>>,
    ) -> Flight<V> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak_entries = Arc::downgrade(&self.entries);
        let metrics = Arc::clone(&self.metrics);
        let settle_key = key.clone();

        let flight = async move {
            let outcome = operation.await;
            if outcome.is_err() {
                metrics.failed();
            }
            settle(&weak_entries, settle_key, generation, &outcome);
            outcome
        }
        .boxed()
        .shared();

        entries
            .insert(key, Slot::InFlight { generation, flight: flight.clone() });

        flight
    }
}

// Records the outcome of the flight with the given generation, unless the
// slot it was launched into has since been replaced or removed.
fn settle<K, V>(
    entries: &Weak<Entries<K, V>>,
    key: K,
    generation: u64,
    outcome: &Result<V>,
) where
    K: Hash + Eq,
    V: Clone,
{
    let entries = match entries.upgrade() {
        Some(entries) => entries,
        None => return,
    };
    let mut entries = entries.lock();

    let still_ours = matches!(
        entries.get(&key),
        Some(Slot::InFlight { generation: g, .. }) if *g == generation
    );
    if !still_ours {
        log::trace!(
            "flight {} settled after its slot was replaced, not recording it",
            generation
        );
        return;
    }

    match outcome {
        Ok(value) => {
            let now = Instant::now();
            let times = EntryTimes { updated_at: now, accessed_at: now };
            entries.insert(key, Slot::Ready { value: value.clone(), times });
        }
        Err(e) => {
            log::debug!("flight {} failed, dropping its key: {}", generation, e);
            entries.remove(&key);
        }
    }
}
