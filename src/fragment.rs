use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::metrics::ListMetrics;
use crate::{Error, Page, Result, Source, SourceChunk, SourceItem, SourcePage};

type PageFlight = Shared<BoxFuture<'static, Result<()>>>;

/// First-occurrence positions of every id seen in a chunk, in the order
/// the ids were first seen. Positions only ever grow, so `positions` is
/// sorted.
#[derive(Debug, Default)]
struct UniqueIndex {
    positions: Vec<usize>,
    ranks: FnvHashMap<String, usize>,
}

impl UniqueIndex {
    fn record(&mut self, id: &str, position: usize) -> bool {
        if self.ranks.contains_key(id) {
            return false;
        }
        self.ranks.insert(id.to_owned(), self.positions.len());
        self.positions.push(position);
        true
    }

    fn len(&self) -> usize {
        self.positions.len()
    }
}

struct State<S: Source> {
    items: Vec<SourceItem<S>>,
    next_page: Option<S::PageToken>,
    unique: UniqueIndex,
    successor: Option<Arc<Fragment<S>>>,
    merged: bool,
    loading: Option<PageFlight>,
    detached: bool,
}

impl<S: Source> State<S> {
    fn len(&self, unique: bool) -> usize {
        if unique { self.unique.len() } else { self.items.len() }
    }

    // First-occurrence positions, minus ids already passed earlier in the
    // chain
    fn unique_positions(&self, seen: &FnvHashSet<String>) -> Cow<'_, [usize]> {
        if seen.is_empty() {
            return Cow::Borrowed(&self.unique.positions);
        }
        Cow::Owned(
            self.unique
                .positions
                .iter()
                .copied()
                .filter(|&position| !seen.contains(&self.items[position].id))
                .collect(),
        )
    }

    fn visible_len(&self, unique: bool, seen: &FnvHashSet<String>) -> usize {
        if unique && !seen.is_empty() {
            self.unique_positions(seen).len()
        } else {
            self.len(unique)
        }
    }

    fn mark_seen(&self, seen: &mut FnvHashSet<String>) {
        seen.extend(self.items.iter().map(|item| item.id.clone()));
    }

    fn append(&mut self, items: Vec<SourceItem<S>>) {
        self.items.reserve(items.len());
        for item in items {
            self.unique.record(&item.id, self.items.len());
            self.items.push(item);
        }
    }

    fn copy_window(
        &self,
        start: usize,
        end: usize,
        unique: bool,
        seen: &FnvHashSet<String>,
        out: &mut Vec<SourceItem<S>>,
    ) {
        if unique {
            let positions = self.unique_positions(seen);
            let loaded = positions.len();
            let (start, end) = (start.min(loaded), end.min(loaded));
            out.extend(
                positions[start..end]
                    .iter()
                    .map(|&position| self.items[position].clone()),
            );
        } else {
            let loaded = self.items.len();
            let (start, end) = (start.min(loaded), end.min(loaded));
            out.extend_from_slice(&self.items[start..end]);
        }
    }

    fn merged_successor(&self) -> Option<&Arc<Fragment<S>>> {
        if self.merged { self.successor.as_ref() } else { None }
    }
}

// whether anything follows the loaded data of `state`, either in merged
// successors or upstream. `seen` holds the ids passed before `state` when
// walking the unique view.
fn has_more_after<S: Source>(
    state: &State<S>,
    unique: bool,
    seen: &FnvHashSet<String>,
) -> bool {
    let mut next = match state.merged_successor() {
        Some(successor) => Arc::clone(successor),
        None => return state.next_page.is_some(),
    };
    let mut seen = if unique {
        let mut seen = seen.clone();
        state.mark_seen(&mut seen);
        seen
    } else {
        FnvHashSet::default()
    };
    loop {
        let successor = {
            let st = next.state.lock();
            if st.visible_len(unique, &seen) > 0 {
                return true;
            }
            match st.merged_successor() {
                Some(successor) => {
                    if unique {
                        st.mark_seen(&mut seen);
                    }
                    Arc::clone(successor)
                }
                None => return st.next_page.is_some(),
            }
        };
        next = successor;
    }
}

/// Cuts `chunk` where it reaches `successor_first`, the first token of the
/// older fragment that follows it. Returns `true` if the chunk is now known
/// to connect to the successor: either it reached the successor's first
/// token, or it is the final upstream page and nothing can come between.
fn splice_onto<S: Source>(
    source: &S,
    chunk: &mut SourceChunk<S>,
    successor_first: Option<&S::Token>,
) -> bool {
    if let Some(first) = successor_first {
        let reconnects_at = chunk.items.iter().position(|item| {
            source.compare(&item.token, first) != Ordering::Less
        });
        if let Some(at) = reconnects_at {
            chunk.items.truncate(at);
            // the successor continues the sequence from here
            chunk.next_page = None;
            return true;
        }
    }
    chunk.next_page.is_none()
}

enum Step<S: Source> {
    Done(bool),
    Continue { successor: Arc<Fragment<S>>, loaded: usize },
}

/// Where a token falls inside a fragment chain.
pub struct TokenPoint<S: Source> {
    /// The fragment holding the item.
    pub fragment: Arc<Fragment<S>>,
    /// Raw position of the first item ordered at or after the token.
    pub index: usize,
    /// Number of distinct ids first seen before `index`, which is the
    /// item's position in the unique view if it represents its id.
    pub unique_index: usize,
    /// `true` if the item is the first occurrence of its id.
    pub is_unique: bool,
    // ids held by the fragments passed on the way to `fragment`
    seen: FnvHashSet<String>,
}

impl<S: Source> TokenPoint<S> {
    /// The position in the raw or unique view.
    pub fn position(&self, unique: bool) -> usize {
        if unique { self.unique_index } else { self.index }
    }

    /// Reads `count` items starting `offset` positions into the point's
    /// fragment, like [`Fragment::get_or_fetch_items`]. In the unique
    /// view, ids already held by fragments before the point's fragment
    /// are skipped, so positions agree with `unique_index`.
    pub async fn get_or_fetch_items(
        &self,
        offset: usize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        self.fragment.read_after(&self.seen, offset, count, unique).await
    }
}

impl<S: Source> fmt::Debug for TokenPoint<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPoint")
            .field("index", &self.index)
            .field("unique_index", &self.unique_index)
            .field("is_unique", &self.is_unique)
            .finish()
    }
}

/// One segment of a paginated sequence.
///
/// A fragment owns a single chunk of items that grows page by page as
/// readers ask for more, and may link to an older successor fragment
/// that was loaded before it. Once the fragment's own pages are known to
/// reach the successor's first item the two are `merged`: reads run
/// straight through into the successor, and
/// [`combine_fragments_if_able`](Fragment::combine_fragments_if_able)
/// can later splice the successor's data into this fragment.
///
/// Every method is safe to call from interleaved tasks. At most one
/// next-page load is outstanding per fragment, and readers that need it
/// join the load already running.
pub struct Fragment<S: Source> {
    source: Arc<S>,
    metrics: Arc<ListMetrics>,
    state: Mutex<State<S>>,
}

impl<S: Source> fmt::Debug for Fragment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Fragment")
            .field("len", &st.items.len())
            .field("unique_len", &st.unique.len())
            .field("has_next_page", &st.next_page.is_some())
            .field("has_successor", &st.successor.is_some())
            .field("merged", &st.merged)
            .field("loading", &st.loading.is_some())
            .field("detached", &st.detached)
            .finish()
    }
}

impl<S: Source> Fragment<S> {
    /// Fetch a first page and build a fragment from it.
    ///
    /// `candidate` is the previously loaded chain, if any. The returned
    /// fragment links to it as its successor, truncated where its page
    /// reaches the successor's first item. When the fetched page adds
    /// nothing over the candidate (empty, or the same start and no
    /// longer than what is already loaded) the candidate itself is
    /// returned.
    pub async fn create(
        source: Arc<S>,
        candidate: Option<Arc<Fragment<S>>>,
    ) -> Result<Arc<Fragment<S>>> {
        let metrics = match &candidate {
            Some(fragment) => Arc::clone(&fragment.metrics),
            None => Arc::default(),
        };
        Fragment::create_in(source, metrics, candidate).await
    }

    pub(crate) async fn create_in(
        source: Arc<S>,
        metrics: Arc<ListMetrics>,
        candidate: Option<Arc<Fragment<S>>>,
    ) -> Result<Arc<Fragment<S>>> {
        metrics.head_fetched();
        log::trace!("loading first page");

        let mut chunk = match source.load(None).await {
            Ok(chunk) => chunk,
            Err(e) => {
                metrics.fetch_failed();
                log::warn!("first page load failed: {}", e);
                return Err(e);
            }
        };

        let successor = candidate.and_then(skip_vacuous);
        let mut merged = false;

        if let Some(successor) = &successor {
            let (successor_first, successor_len) = {
                let st = successor.state.lock();
                (st.items.first().map(|item| item.token.clone()), st.items.len())
            };

            if chunk.items.is_empty() {
                log::debug!("first page came back empty, keeping loaded chain");
                return Ok(Arc::clone(successor));
            }

            if let Some(first) = &successor_first {
                let same_start = source.compare(first, &chunk.items[0].token)
                    == Ordering::Equal;
                if same_start && chunk.items.len() <= successor_len {
                    log::debug!(
                        "first page adds nothing over the loaded chain, \
                         keeping it"
                    );
                    return Ok(Arc::clone(successor));
                }
            }

            merged = splice_onto(&*source, &mut chunk, successor_first.as_ref());
            log::debug!(
                "new head holds {} items before the loaded chain, merged: {}",
                chunk.items.len(),
                merged
            );
        }

        let mut state = State {
            items: Vec::new(),
            next_page: chunk.next_page,
            unique: UniqueIndex::default(),
            successor,
            merged,
            loading: None,
            detached: false,
        };
        state.append(chunk.items);

        Ok(Arc::new(Fragment { source, metrics, state: Mutex::new(state) }))
    }

    /// Reads `count` items starting at `offset`, loading further pages
    /// as needed. Positions count raw items, or distinct ids when
    /// `unique` is set.
    ///
    /// Windows running past this fragment's data continue into its
    /// successor once the two are merged. A failed load commits nothing
    /// and fails every reader that joined it.
    pub async fn get_or_fetch_items(
        self: &Arc<Self>,
        offset: usize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        self.read_after(&FnvHashSet::default(), offset, count, unique).await
    }

    async fn read_after(
        self: &Arc<Self>,
        seen: &FnvHashSet<String>,
        offset: usize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let end = window_end(offset, count)?;
        loop {
            match self.read_chain(seen.clone(), offset, end, unique).await {
                Err(Error::Detached) if !self.is_detached() => {
                    // a successor was absorbed into this chain mid-read,
                    // the same window is now reachable from here
                    self.metrics.read_relocated();
                }
                result => return result,
            }
        }
    }

    async fn read_chain(
        self: &Arc<Self>,
        mut seen: FnvHashSet<String>,
        mut offset: usize,
        mut end: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let mut items = Vec::new();
        let mut current = Arc::clone(self);

        loop {
            current.load_through(end, unique, &seen).await?;

            match current.take_window(offset, end, unique, &mut seen, &mut items)?
            {
                Step::Done(has_more) => return Ok(Page { items, has_more }),
                Step::Continue { successor, loaded } => {
                    offset = offset.saturating_sub(loaded);
                    end -= loaded;
                    current = successor;
                }
            }
        }
    }

    /// Reads `count` raw items starting at `offset` from loaded data only.
    pub fn get_items(
        self: &Arc<Self>,
        offset: usize,
        count: usize,
    ) -> Result<SourcePage<S>> {
        self.read_loaded(offset, count, false)
    }

    /// Reads `count` distinct-id items starting at `offset` from loaded
    /// data only.
    pub fn get_unique_items(
        self: &Arc<Self>,
        offset: usize,
        count: usize,
    ) -> Result<SourcePage<S>> {
        self.read_loaded(offset, count, true)
    }

    pub(crate) fn read_loaded(
        self: &Arc<Self>,
        offset: usize,
        count: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let end = window_end(offset, count)?;
        loop {
            match self.read_loaded_chain(offset, end, unique) {
                Err(Error::Detached) if !self.is_detached() => {
                    self.metrics.read_relocated();
                }
                result => return result,
            }
        }
    }

    fn read_loaded_chain(
        self: &Arc<Self>,
        mut offset: usize,
        mut end: usize,
        unique: bool,
    ) -> Result<SourcePage<S>> {
        let mut items = Vec::new();
        let mut seen = FnvHashSet::default();
        let mut current = Arc::clone(self);

        loop {
            match current.take_window(offset, end, unique, &mut seen, &mut items)?
            {
                Step::Done(has_more) => return Ok(Page { items, has_more }),
                Step::Continue { successor, loaded } => {
                    offset = offset.saturating_sub(loaded);
                    end -= loaded;
                    current = successor;
                }
            }
        }
    }

    /// Finds the first loaded item ordered at or after `token`, looking
    /// through this fragment and then its successors.
    ///
    /// Lookups cross into a merged successor freely. An unmerged one is
    /// only entered when `token` is at or past its first item; anything
    /// earlier may fall in pages of this fragment that are not loaded
    /// yet, and is reported as not found.
    pub fn find_item_token_point(
        self: &Arc<Self>,
        token: &S::Token,
    ) -> Option<TokenPoint<S>> {
        let mut seen = FnvHashSet::default();
        let mut current = Arc::clone(self);
        loop {
            let (successor, merged) = {
                let st = current.state.lock();
                let found = st.items.iter().position(|item| {
                    self.source.compare(&item.token, token) != Ordering::Less
                });
                if let Some(index) = found {
                    let positions = st.unique_positions(&seen);
                    let unique_index = positions.partition_point(|p| *p < index);
                    let is_unique = positions.get(unique_index) == Some(&index);
                    drop(positions);
                    drop(st);
                    return Some(TokenPoint {
                        fragment: current,
                        index,
                        unique_index,
                        is_unique,
                        seen,
                    });
                }
                st.mark_seen(&mut seen);
                (st.successor.clone()?, st.merged)
            };
            if !merged {
                let reachable = successor.first_token().is_some_and(|first| {
                    self.source.compare(token, &first) != Ordering::Less
                });
                if !reachable {
                    log::trace!(
                        "token falls in pages not loaded before an unmerged \
                         successor"
                    );
                    return None;
                }
            }
            current = successor;
        }
    }

    /// Splices merged successors into this fragment, for as long as
    /// neither side has a load in flight. Returns the number of
    /// fragments absorbed.
    ///
    /// Absorbed fragments are emptied and marked detached; reading
    /// through a stale handle to one fails with [`Error::Detached`].
    pub fn combine_fragments_if_able(&self) -> usize {
        let mut st = self.state.lock();
        if st.loading.is_some() || st.detached {
            return 0;
        }

        let mut absorbed = 0;
        while let Some(successor) = st.merged_successor().cloned() {
            let mut ss = successor.state.lock();
            if ss.loading.is_some() {
                log::trace!("successor is loading, deferring merge");
                break;
            }

            let base = st.items.len();
            let items = mem::take(&mut ss.items);
            let unique = mem::take(&mut ss.unique);
            for position in unique.positions {
                st.unique.record(&items[position].id, base + position);
            }
            st.items.extend(items);
            st.next_page = ss.next_page.take();
            st.successor = ss.successor.take();
            st.merged = mem::take(&mut ss.merged);
            ss.detached = true;

            absorbed += 1;
        }

        if absorbed > 0 {
            self.metrics.absorbed(absorbed);
            log::debug!(
                "absorbed {} fragments, now holding {} items",
                absorbed,
                st.items.len()
            );
        }
        absorbed
    }

    /// `true` if raw items follow this fragment's loaded data.
    pub fn has_more_items(&self) -> bool {
        has_more_after(&self.state.lock(), false, &FnvHashSet::default())
    }

    /// `true` if distinct-id items follow this fragment's loaded data.
    pub fn has_more_unique_items(&self) -> bool {
        has_more_after(&self.state.lock(), true, &FnvHashSet::default())
    }

    /// Number of raw items loaded into this fragment.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns `true` if this fragment holds no items.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Number of distinct ids loaded into this fragment.
    pub fn unique_len(&self) -> usize {
        self.state.lock().unique.len()
    }

    /// `true` while a next-page load is in flight.
    pub fn is_loading(&self) -> bool {
        self.state.lock().loading.is_some()
    }

    /// `true` once this fragment is known to connect to its successor.
    pub fn is_merged(&self) -> bool {
        self.state.lock().merged
    }

    /// `true` once this fragment has been absorbed by its predecessor.
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// The older fragment following this one, merged or not.
    pub fn successor(&self) -> Option<Arc<Fragment<S>>> {
        self.state.lock().successor.clone()
    }

    /// The continuation token of the next page to load, if any.
    pub fn next_page(&self) -> Option<S::PageToken> {
        self.state.lock().next_page.clone()
    }

    pub(crate) fn first_token(&self) -> Option<S::Token> {
        self.state.lock().items.first().map(|item| item.token.clone())
    }

    /// Sums item counts over this fragment and all of its successors,
    /// or `None` if any of them still has pages to load. Distinct ids are
    /// counted once across the whole chain.
    pub(crate) fn chain_total(self: &Arc<Self>, unique: bool) -> Option<usize> {
        let mut total = 0;
        let mut seen = FnvHashSet::default();
        let mut current = Arc::clone(self);
        loop {
            let successor = {
                let st = current.state.lock();
                if st.next_page.is_some() {
                    return None;
                }
                total += st.visible_len(unique, &seen);
                if unique {
                    st.mark_seen(&mut seen);
                }
                st.successor.clone()
            };
            match successor {
                Some(successor) => current = successor,
                None => return Some(total),
            }
        }
    }

    pub(crate) fn chain_len(self: &Arc<Self>) -> usize {
        let mut fragments = 1;
        let mut current = Arc::clone(self);
        while let Some(successor) = current.successor() {
            fragments += 1;
            current = successor;
        }
        fragments
    }

    // Waits until `end` items of the requested view are loaded, or until
    // nothing more can be loaded into this fragment.
    async fn load_through(
        self: &Arc<Self>,
        end: usize,
        unique: bool,
        seen: &FnvHashSet<String>,
    ) -> Result<()> {
        loop {
            let flight = {
                let mut st = self.state.lock();
                if st.detached {
                    return Err(Error::Detached);
                }
                if st.visible_len(unique, seen) >= end || st.merged {
                    return Ok(());
                }
                let page = match &st.next_page {
                    Some(page) => page.clone(),
                    None => return Ok(()),
                };
                if let Some(flight) = st.loading.clone() {
                    log::trace!("joining next page load in flight");
                    flight
                } else {
                    self.start_load(&mut st, page)
                }
            };

            flight.await?;
        }
    }

    fn start_load(
        self: &Arc<Self>,
        st: &mut State<S>,
        page: S::PageToken,
    ) -> PageFlight {
        self.metrics.page_fetched();
        log::trace!("loading next page");

        // `Source::load` is only called once the flight is first polled,
        // after the state lock is released
        let this = Arc::clone(self);
        let flight = async move {
            let loaded = this.source.load(Some(page)).await;
            this.settle_load(loaded)
        }
        .boxed()
        .shared();

        st.loading = Some(flight.clone());
        flight
    }

    // Commits a settled next-page load and clears the in-flight slot in
    // one critical section.
    fn settle_load(&self, loaded: Result<SourceChunk<S>>) -> Result<()> {
        let mut st = self.state.lock();
        st.loading = None;

        let mut chunk = match loaded {
            Ok(chunk) => chunk,
            Err(e) => {
                self.metrics.fetch_failed();
                log::warn!("next page load failed, nothing committed: {}", e);
                return Err(e);
            }
        };

        if let Some(successor) = &st.successor {
            let successor_first = successor.first_token();
            if splice_onto(&*self.source, &mut chunk, successor_first.as_ref())
            {
                log::debug!("loaded page reconnects with the older chain");
                st.merged = true;
            }
        }

        st.next_page = chunk.next_page;
        st.append(chunk.items);
        Ok(())
    }

    // Copies the part of `offset..end` held here. In the unique view, ids
    // in `seen` were already handed out by earlier fragments of the walk
    // and are skipped; this fragment's ids are added before moving on.
    fn take_window(
        &self,
        offset: usize,
        end: usize,
        unique: bool,
        seen: &mut FnvHashSet<String>,
        out: &mut Vec<SourceItem<S>>,
    ) -> Result<Step<S>> {
        let st = self.state.lock();
        if st.detached {
            return Err(Error::Detached);
        }

        let loaded = st.visible_len(unique, seen);
        st.copy_window(offset, end, unique, seen, out);

        let step = match end.cmp(&loaded) {
            Ordering::Less => Step::Done(true),
            Ordering::Equal => Step::Done(has_more_after(&st, unique, seen)),
            Ordering::Greater => match st.merged_successor() {
                Some(successor) => {
                    let successor = Arc::clone(successor);
                    if unique {
                        st.mark_seen(seen);
                    }
                    Step::Continue { successor, loaded }
                }
                None => Step::Done(st.next_page.is_some()),
            },
        };
        Ok(step)
    }
}

fn window_end(offset: usize, count: usize) -> Result<usize> {
    offset.checked_add(count).ok_or_else(|| {
        Error::InvalidInput(format!(
            "window of {} items at offset {} overflows",
            count, offset
        ))
    })
}

// Skips fragments that are empty, idle and exhausted; they can never
// contribute anything to a chain.
fn skip_vacuous<S: Source>(
    candidate: Arc<Fragment<S>>,
) -> Option<Arc<Fragment<S>>> {
    let mut current = candidate;
    loop {
        let successor = {
            let st = current.state.lock();
            let vacuous = st.items.is_empty()
                && st.loading.is_none()
                && st.next_page.is_none();
            if !vacuous {
                break;
            }
            st.successor.clone()
        };
        current = successor?;
    }
    Some(current)
}
