//! `feedlist` keeps incrementally fetched views over cursor-paginated
//! upstream feeds.
//!
//! A [`List`] pulls pages from a [`Source`] only when a reader asks for
//! data past what is loaded, refetches its head page on a configurable
//! interval without throwing away older pages, and splices the new head
//! back onto the older chain once the two are found to connect. Reads can
//! address the raw item sequence or a view deduplicated by item id, and
//! concurrent readers never cause more than one upstream load per
//! position.
//!
//! [`SingleFlightCache`] is the keyed counterpart: a memoizing map over
//! asynchronous lookups where concurrent callers for the same key share
//! one fetch.
//!
//! ```
//! use std::cmp::Ordering;
//!
//! use feedlist::{Chunk, Config, Item, List, RefreshInterval, Source};
//! use futures::future::{BoxFuture, FutureExt};
//!
//! struct Numbers;
//!
//! impl Source for Numbers {
//!     type Value = ();
//!     type Token = u32;
//!     type PageToken = u32;
//!
//!     fn load(
//!         &self,
//!         page: Option<u32>,
//!     ) -> BoxFuture<'static, feedlist::Result<Chunk<(), u32, u32>>> {
//!         let start = page.unwrap_or(0);
//!         let items = (start..start + 3)
//!             .map(|n| Item::new(n.to_string(), n, ()))
//!             .collect();
//!         let next_page = if start < 6 { Some(start + 3) } else { None };
//!         async move { Ok(Chunk { items, next_page }) }.boxed()
//!     }
//!
//!     fn compare(&self, a: &u32, b: &u32) -> Ordering {
//!         a.cmp(b)
//!     }
//! }
//!
//! let list = List::new(
//!     Numbers,
//!     Config::new().refresh_interval(RefreshInterval::Never),
//! );
//!
//! futures::executor::block_on(async {
//!     let page = list.get_or_fetch_items(None, 0, 5, false).await.unwrap();
//!     assert_eq!(page.items.len(), 5);
//!     assert!(page.has_more);
//!
//!     let rest = list
//!         .get_or_fetch_items(page.last_token(), 1, 10, false)
//!         .await
//!         .unwrap();
//!     assert_eq!(rest.items.len(), 4);
//!     assert!(!rest.has_more);
//!     assert_eq!(list.total_item_count(), Some(9));
//! });
//! ```
#![deny(missing_docs)]
#![deny(unsafe_code)]

use std::cmp::Ordering;

use futures::future::BoxFuture;
use serde::Serialize;

mod cache;
mod config;
mod fragment;
mod list;
mod metrics;
mod result;

pub use self::{
    cache::{EntryTimes, Flight, Lookup, SingleFlightCache},
    config::{Config, RefreshInterval},
    fragment::{Fragment, TokenPoint},
    list::List,
    metrics::{CacheStats, ListStats},
    result::{Error, Result},
};

/// One element of an upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item<T, K> {
    /// Stable identity of the item across overlapping fetches.
    pub id: String,
    /// Ordering and addressing token, compared with [`Source::compare`].
    pub token: K,
    /// The payload handed back to readers.
    pub value: T,
}

impl<T, K> Item<T, K> {
    /// Create a new `Item`.
    pub fn new<I: Into<String>>(id: I, token: K, value: T) -> Item<T, K> {
        Item { id: id.into(), token, value }
    }
}

/// One page of items as returned by a [`Source`], plus the token that
/// continues the sequence. `next_page` is `None` on the final page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T, K, P> {
    /// Items in source emission order.
    pub items: Vec<Item<T, K>>,
    /// Continuation token for the following page.
    pub next_page: Option<P>,
}

impl<T, K, P> Chunk<T, K, P> {
    /// A final page with no items.
    pub fn empty() -> Chunk<T, K, P> {
        Chunk { items: vec![], next_page: None }
    }
}

/// The result of a read: a window of items and whether anything is
/// known or suspected to follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T, K> {
    /// The items of the requested window, possibly fewer than asked for.
    pub items: Vec<Item<T, K>>,
    /// `true` if more items follow this window or may still be fetched.
    pub has_more: bool,
}

impl<T, K> Page<T, K> {
    /// An empty page with nothing after it.
    pub fn empty() -> Page<T, K> {
        Page { items: vec![], has_more: false }
    }

    /// The token of the last item, for continuing the read with a
    /// token-addressed call.
    pub fn last_token(&self) -> Option<&K> {
        self.items.last().map(|item| &item.token)
    }
}

/// The upstream a list pulls its pages from.
///
/// `load(None)` fetches the first page of a fresh sequence and
/// `load(Some(token))` continues from a `next_page` token previously
/// returned. Items must come back in the order `compare` defines, both
/// within a page and across pages; the lists rely on this to detect
/// where a refetched head reconnects with older data.
pub trait Source: Send + Sync + 'static {
    /// Payload of each item.
    type Value: Clone + Send + Sync + 'static;
    /// Ordering token of each item.
    type Token: Clone + Send + Sync + 'static;
    /// Opaque continuation token.
    type PageToken: Clone + Send + Sync + 'static;

    /// Fetch one page. Timeouts, if wanted, belong here; the list never
    /// cancels a load once started.
    ///
    /// Called with no list or fragment lock held, so implementations may
    /// inspect the list they feed.
    fn load(
        &self,
        page: Option<Self::PageToken>,
    ) -> BoxFuture<
        'static,
        Result<Chunk<Self::Value, Self::Token, Self::PageToken>>,
    >;

    /// Total order over tokens, consistent with emission order.
    fn compare(&self, a: &Self::Token, b: &Self::Token) -> Ordering;
}

/// The item type produced by a [`Source`].
pub type SourceItem<S> = Item<<S as Source>::Value, <S as Source>::Token>;

/// The chunk type produced by a [`Source`].
pub type SourceChunk<S> = Chunk<
    <S as Source>::Value,
    <S as Source>::Token,
    <S as Source>::PageToken,
>;

/// The page type handed out for a [`Source`].
pub type SourcePage<S> = Page<<S as Source>::Value, <S as Source>::Token>;
