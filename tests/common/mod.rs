#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::future::Future;
use std::task::{Context, Poll};

use fnv::{FnvHashMap, FnvHashSet};
use futures::future::{poll_fn, BoxFuture, FutureExt};
use futures::task::noop_waker_ref;
use parking_lot::Mutex;

use feedlist::{Chunk, Error, Item, Page, Result, Source};

pub type TestItem = Item<(), u64>;
pub type TestChunk = Chunk<(), u64, String>;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

pub fn item(id: &str, token: u64) -> TestItem {
    Item::new(id, token, ())
}

pub fn ids<T, K>(page: &Page<T, K>) -> Vec<&str> {
    page.items.iter().map(|item| item.id.as_str()).collect()
}

pub fn chunk(items: Vec<TestItem>, next_page: Option<&str>) -> TestChunk {
    Chunk { items, next_page: next_page.map(str::to_owned) }
}

/// Returns `Pending` once, waking itself, so that other futures polled
/// by the same executor get a turn.
pub async fn yield_now() {
    let mut yielded = false;
    poll_fn(|cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}

/// Polls `future` once with a waker that does nothing. Whatever the future
/// was waiting on stays parked until it is polled again.
pub fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
    let mut cx = Context::from_waker(noop_waker_ref());
    future.poll_unpin(&mut cx)
}

/// A source answering from canned pages.
///
/// First pages are served from a queue: every `load(None)` takes the next
/// one, and the last one is repeated once the queue runs dry. Continuation
/// pages are looked up by their page token.
pub struct ScriptedSource {
    heads: Mutex<VecDeque<TestChunk>>,
    pages: Mutex<FnvHashMap<String, TestChunk>>,
    // `None` stands for the first page
    failing: Mutex<FnvHashSet<Option<String>>>,
    yields: usize,
    pub head_loads: AtomicUsize,
    pub page_loads: AtomicUsize,
}

impl Default for ScriptedSource {
    fn default() -> ScriptedSource {
        ScriptedSource::new()
    }
}

impl ScriptedSource {
    pub fn new() -> ScriptedSource {
        ScriptedSource {
            heads: Mutex::new(VecDeque::new()),
            pages: Mutex::new(FnvHashMap::default()),
            failing: Mutex::new(FnvHashSet::default()),
            yields: 0,
            head_loads: AtomicUsize::new(0),
            page_loads: AtomicUsize::new(0),
        }
    }

    /// Every load suspends `yields` times before answering.
    pub fn yielding(mut self, yields: usize) -> ScriptedSource {
        self.yields = yields;
        self
    }

    pub fn head(self, items: Vec<TestItem>, next_page: Option<&str>) -> Self {
        self.push_head(items, next_page);
        self
    }

    pub fn page(
        self,
        token: &str,
        items: Vec<TestItem>,
        next_page: Option<&str>,
    ) -> Self {
        self.set_page(token, items, next_page);
        self
    }

    pub fn push_head(&self, items: Vec<TestItem>, next_page: Option<&str>) {
        self.heads.lock().push_back(chunk(items, next_page));
    }

    pub fn set_page(
        &self,
        token: &str,
        items: Vec<TestItem>,
        next_page: Option<&str>,
    ) {
        self.pages.lock().insert(token.to_owned(), chunk(items, next_page));
    }

    /// Makes the next load of `page` fail.
    pub fn fail_once(&self, page: Option<&str>) {
        self.failing.lock().insert(page.map(str::to_owned));
    }

    pub fn head_loads(&self) -> usize {
        self.head_loads.load(SeqCst)
    }

    pub fn page_loads(&self) -> usize {
        self.page_loads.load(SeqCst)
    }

    fn answer(&self, page: &Option<String>) -> Result<TestChunk> {
        if self.failing.lock().remove(page) {
            return Err(Error::upstream(io::Error::other(format!(
                "scripted failure loading {:?}",
                page
            ))));
        }
        match page {
            None => {
                let mut heads = self.heads.lock();
                if heads.len() > 1 {
                    Ok(heads.pop_front().unwrap())
                } else {
                    Ok(heads.front().cloned().unwrap_or_else(Chunk::empty))
                }
            }
            Some(token) => self.pages.lock().get(token).cloned().ok_or_else(
                || Error::InvalidInput(format!("no page scripted for {}", token)),
            ),
        }
    }
}

impl Source for ScriptedSource {
    type Value = ();
    type Token = u64;
    type PageToken = String;

    fn load(&self, page: Option<String>) -> BoxFuture<'static, Result<TestChunk>> {
        if page.is_none() {
            self.head_loads.fetch_add(1, SeqCst);
        } else {
            self.page_loads.fetch_add(1, SeqCst);
        }
        let answer = self.answer(&page);
        let yields = self.yields;
        async move {
            for _ in 0..yields {
                yield_now().await;
            }
            answer
        }
        .boxed()
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }
}
