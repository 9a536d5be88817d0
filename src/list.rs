use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::fragment::Fragment;
use crate::metrics::{ListMetrics, ListStats};
use crate::{Config, Error, Page, Result, Source, SourcePage};

type HeadFlight = Shared<BoxFuture<'static, Result<()>>>;

struct ListState<S: Source> {
    head: Option<Arc<Fragment<S>>>,
    fetched_at: Option<Instant>,
    head_flight: Option<HeadFlight>,
    merge_pending: bool,
}

struct Inner<S: Source> {
    source: Arc<S>,
    config: Config,
    metrics: Arc<ListMetrics>,
    state: Mutex<ListState<S>>,
}

/// A lazily loaded, periodically refreshed view over a [`Source`].
///
/// The list keeps a chain of fragments: the head holds the most recently
/// fetched first page and whatever pages have been loaded after it, its
/// successors hold data loaded by earlier heads. Reads that start at the
/// head refetch it once the configured
/// [`RefreshInterval`](crate::RefreshInterval) has passed; older pages
/// stay readable meanwhile, and are spliced onto the new head when its
/// pages reach them.
///
/// `List` is a cheap handle. Clones share the same chain.
pub struct List<S: Source> {
    inner: Arc<Inner<S>>,
}

impl<S: Source> Clone for List<S> {
    fn clone(&self) -> List<S> {
        List { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Source> fmt::Debug for List<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("List")
            .field("config", &self.inner.config)
            .field("head", &st.head)
            .field("head_loading", &st.head_flight.is_some())
            .field("merge_pending", &st.merge_pending)
            .finish()
    }
}

impl<S: Source> List<S> {
    /// Create an empty list over `source`. Nothing is fetched until the
    /// first read.
    pub fn new(source: S, config: Config) -> List<S> {
        List::from_arc(Arc::new(source), config)
    }

    /// Like [`List::new`], for a source shared with other owners.
    pub fn from_arc(source: Arc<S>, config: Config) -> List<S> {
        List {
            inner: Arc::new(Inner {
                source,
                config,
                metrics: Arc::default(),
                state: Mutex::new(ListState {
                    head: None,
                    fetched_at: None,
                    head_flight: None,
                    merge_pending: false,
                }),
            }),
        }
    }

    /// Returns the first `max_count` loaded items, refetching the head
    /// first if there is none yet or the refresh interval has passed.
    ///
    /// At least one page is loaded before answering, but no further
    /// pages are fetched to fill `max_count`.
    pub async fn get_or_fetch_start_items(
        &self,
        max_count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let page = self.read_start(max_count, unique).await;
        self.run_pending_merge();
        page
    }

    /// Reads `count` items starting `offset` positions after the first
    /// item ordered at or after `start_token`, or after the start of the
    /// list if `start_token` is `None`. Further pages are loaded as
    /// needed.
    ///
    /// A `start_token` that cannot be found in the loaded chain yields an
    /// empty page with `has_more == false` rather than an error. An
    /// offset that resolves before the start of the list is rejected
    /// with [`Error::InvalidInput`].
    pub async fn get_or_fetch_items(
        &self,
        start_token: Option<&S::Token>,
        offset: isize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let page = self.read_from(start_token, offset, count, unique).await;
        self.run_pending_merge();
        page
    }

    /// Refetches the head now, regardless of the refresh interval. Joins
    /// a head fetch that is already in flight instead of starting a
    /// second one.
    pub async fn refresh(&self) -> Result<()> {
        let head = self.current_head(true).await?;
        self.schedule_merge(&head);
        self.run_pending_merge();
        Ok(())
    }

    /// Runs a merge scheduled by an earlier read, if one is pending.
    /// Returns the number of fragments spliced into the head.
    ///
    /// Reads run this themselves once their result is ready, so calling
    /// it is only useful to hosts that want the chain compacted at some
    /// other point.
    pub fn run_pending_merge(&self) -> usize {
        let head = {
            let mut st = self.inner.state.lock();
            if !mem::take(&mut st.merge_pending) {
                return 0;
            }
            st.head.clone()
        };
        match head {
            Some(head) => head.combine_fragments_if_able(),
            None => 0,
        }
    }

    /// Number of raw items in the whole chain, or `None` while any part
    /// of it can still load more pages.
    pub fn total_item_count(&self) -> Option<usize> {
        self.head()?.chain_total(false)
    }

    /// Number of distinct-id items in the whole chain, or `None` while
    /// any part of it can still load more pages.
    pub fn total_unique_item_count(&self) -> Option<usize> {
        self.head()?.chain_total(true)
    }

    /// The newest fragment, if the list has fetched anything yet.
    pub fn head(&self) -> Option<Arc<Fragment<S>>> {
        self.inner.state.lock().head.clone()
    }

    /// Number of fragments in the chain, merged or not.
    pub fn fragment_count(&self) -> usize {
        self.head().map_or(0, |head| head.chain_len())
    }

    /// This list's configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The source this list loads from.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// Load and merge counters.
    pub fn stats(&self) -> ListStats {
        self.inner.metrics.stats()
    }

    async fn read_start(
        &self,
        max_count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        loop {
            let head = self.current_head(false).await?;
            let read = match head.get_or_fetch_items(0, 1, unique).await {
                Ok(_) => head.read_loaded(0, max_count, unique),
                Err(e) => Err(e),
            };
            match read {
                Err(Error::Detached) => {
                    // a newer head absorbed this one while we were loading
                    self.inner.metrics.read_relocated();
                    log::debug!("start read landed on an absorbed head, retrying");
                }
                result => {
                    self.schedule_merge(&head);
                    return result;
                }
            }
        }
    }

    async fn read_from(
        &self,
        start_token: Option<&S::Token>,
        offset: isize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        if self.head().is_none() {
            self.read_start(1, unique).await?;
        }

        loop {
            let head = self.head().ok_or_else(|| {
                Error::ReportableBug("list lost its head after loading it".into())
            })?;

            let read = match start_token {
                None => {
                    let start = offset_from(0, offset)?;
                    head.get_or_fetch_items(start, count, unique).await
                }
                Some(token) => match head.find_item_token_point(token) {
                    Some(point) => {
                        let start = offset_from(point.position(unique), offset)?;
                        point.get_or_fetch_items(start, count, unique).await
                    }
                    None => {
                        self.inner.metrics.token_missed();
                        log::warn!(
                            "start token not found in the loaded chain, \
                             answering with an empty page"
                        );
                        self.schedule_merge(&head);
                        return Ok(Page::empty());
                    }
                },
            };

            match read {
                Err(Error::Detached) => {
                    // the fragment was spliced into its predecessor while
                    // we were reading, find the token again from the head
                    self.inner.metrics.read_relocated();
                    log::debug!("read landed on an absorbed fragment, retrying");
                }
                result => {
                    self.schedule_merge(&head);
                    return result;
                }
            }
        }
    }

    // Returns the head, fetching it first if there is none, if it is due
    // for a refresh, or if `force` is set. Joins a head fetch in flight.
    async fn current_head(&self, force: bool) -> Result<Arc<Fragment<S>>> {
        let flight = {
            let mut st = self.inner.state.lock();
            if let Some(flight) = st.head_flight.clone() {
                log::trace!("joining head fetch in flight");
                flight
            } else {
                let due = match (&st.head, st.fetched_at) {
                    (Some(_), Some(fetched_at)) => {
                        force
                            || self
                                .inner
                                .config
                                .refresh_interval
                                .is_due(fetched_at.elapsed())
                    }
                    _ => true,
                };
                if !due {
                    if let Some(head) = &st.head {
                        return Ok(Arc::clone(head));
                    }
                }
                self.start_head_fetch(&mut st)
            }
        };

        flight.await?;

        self.head().ok_or_else(|| {
            Error::ReportableBug("head fetch settled without a head".into())
        })
    }

    fn start_head_fetch(&self, st: &mut ListState<S>) -> HeadFlight {
        let inner = Arc::clone(&self.inner);
        let candidate = st.head.clone();
        log::trace!(
            "fetching head, {} previous chain",
            if candidate.is_some() { "keeping" } else { "without" }
        );

        let flight = async move {
            let created = Fragment::create_in(
                Arc::clone(&inner.source),
                Arc::clone(&inner.metrics),
                candidate,
            )
            .await;

            let mut st = inner.state.lock();
            st.head_flight = None;
            let head = match created {
                Ok(head) => head,
                Err(e) => return Err(e),
            };

            let unchanged = st
                .head
                .as_ref()
                .is_some_and(|previous| Arc::ptr_eq(previous, &head));
            if unchanged {
                log::debug!("refetched head adds nothing, keeping the chain");
            } else {
                log::debug!("installed new head with {} items", head.len());
            }
            st.head = Some(head);
            st.fetched_at = Some(Instant::now());
            Ok(())
        }
        .boxed()
        .shared();

        st.head_flight = Some(flight.clone());
        flight
    }

    // Marks a merge of the head with its successors as pending. Nothing
    // is scheduled while either side is loading, and a merge already
    // pending is not scheduled twice.
    fn schedule_merge(&self, head: &Arc<Fragment<S>>) {
        let successor = match head.successor() {
            Some(successor) => successor,
            None => return,
        };
        if head.is_loading() || successor.is_loading() {
            return;
        }
        let mut st = self.inner.state.lock();
        if !st.merge_pending {
            log::trace!("scheduling merge of the head with its successor");
            st.merge_pending = true;
        }
    }
}

fn offset_from(base: usize, offset: isize) -> Result<usize> {
    let start = if offset >= 0 {
        base.checked_add(offset.unsigned_abs())
    } else {
        base.checked_sub(offset.unsigned_abs())
    };
    start.ok_or_else(|| {
        Error::InvalidInput(format!(
            "offset {} from position {} is outside the list",
            offset, base
        ))
    })
}
