//! Paginated Library View.
//!
//! Windows are served from fixed-size pages of `(library, sort, filter)`
//! listings. Pages are cached up to `max_cached_pages` (least recently used
//! pages go first), and a window that ends within `prefetch_threshold` rows
//! of the last loaded page loads the next page in the background.
//!
//! Every invalidation bumps a generation counter; a page load that started
//! before the bump is returned to its caller but never cached, so a commit
//! followed by `invalidate` is always visible to the next `window` call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rk_core::config::ViewConfig;
use rk_core::{Deadline, Error, LibraryId, Result, SortKey};
use rk_db::models::{Item, ItemFilter};
use rk_db::{get_conn_within, queries, DbPool};

use crate::metrics::{Counter, Metrics, Op};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    library: LibraryId,
    sort: SortKey,
    filter: ItemFilter,
}

type PageKey = (QueryKey, usize);
type Page = Arc<Vec<Item>>;

#[derive(Default)]
struct ViewState {
    generation: u64,
    pages: HashMap<PageKey, Page>,
    /// Least recently used first.
    order: VecDeque<PageKey>,
    inflight: HashSet<PageKey>,
}

impl ViewState {
    fn touch(&mut self, key: &PageKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    fn drop_where(&mut self, pred: impl Fn(&PageKey) -> bool) {
        self.pages.retain(|k, _| !pred(k));
        self.order.retain(|k| !pred(k));
        self.generation += 1;
    }
}

struct ViewInner {
    db: DbPool,
    page_size: usize,
    prefetch_threshold: usize,
    max_cached_pages: usize,
    timeout: Duration,
    metrics: Arc<Metrics>,
    state: Mutex<ViewState>,
}

/// Cheaply cloneable handle to the shared page cache.
#[derive(Clone)]
pub struct LibraryView {
    inner: Arc<ViewInner>,
}

impl LibraryView {
    pub fn new(db: DbPool, config: &ViewConfig, timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                db,
                page_size: config.page_size.max(1),
                prefetch_threshold: config.prefetch_threshold,
                max_cached_pages: config.max_cached_pages.max(1),
                timeout,
                metrics,
                state: Mutex::new(ViewState::default()),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Items `offset..offset + length` of a library in `sort` order.
    pub async fn window(
        &self,
        library: LibraryId,
        offset: usize,
        length: usize,
        sort: SortKey,
    ) -> Result<Vec<Item>> {
        self.window_filtered(library, &ItemFilter::default(), sort, offset, length)
            .await
    }

    /// Like [`window`](Self::window), restricted to items matching `filter`.
    pub async fn window_filtered(
        &self,
        library: LibraryId,
        filter: &ItemFilter,
        sort: SortKey,
        offset: usize,
        length: usize,
    ) -> Result<Vec<Item>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let key = QueryKey {
            library,
            sort,
            filter: filter.clone(),
        };
        let ps = self.inner.page_size;
        let end = offset
            .checked_add(length)
            .filter(|end| i64::try_from(*end).is_ok())
            .ok_or_else(|| {
                Error::Validation(format!("window of {length} at {offset} is out of range"))
            })?;
        let first = offset / ps;
        let last = (end - 1) / ps;

        let mut items = Vec::with_capacity(length.min(ps * 4));
        let mut materialized_end = 0;
        let mut exhausted = false;

        for index in first..=last {
            let page = self.page(&key, index).await?;
            let page_start = index * ps;
            let from = offset.saturating_sub(page_start).min(page.len());
            let to = (end - page_start).min(page.len());
            items.extend_from_slice(&page[from..to]);
            materialized_end = page_start + page.len();
            if page.len() < ps {
                exhausted = true;
                break;
            }
        }

        if !exhausted && materialized_end.saturating_sub(end) <= self.inner.prefetch_threshold {
            self.prefetch(key, last + 1);
        }

        Ok(items)
    }

    /// Number of items in a library matching `filter`, straight from the
    /// database.
    pub async fn count(&self, library: LibraryId, filter: &ItemFilter) -> Result<u64> {
        let db = self.inner.db.clone();
        let deadline = Deadline::after(self.inner.timeout);
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let conn = get_conn_within(&db, deadline)?;
            queries::items::count_items(&conn, library, &filter)
        })
        .await
        .map_err(|e| Error::Internal(format!("count task failed: {e}")))?
    }

    /// Forget every cached page.
    pub fn invalidate(&self) {
        let mut state = self.inner.state.lock();
        state.drop_where(|_| true);
        tracing::debug!(generation = state.generation, "Library view invalidated");
    }

    /// Forget cached pages of one library.
    pub fn invalidate_library(&self, library: LibraryId) {
        let mut state = self.inner.state.lock();
        state.drop_where(|(k, _)| k.library == library);
        tracing::debug!(library_id = %library, generation = state.generation, "Library view invalidated");
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    async fn page(&self, key: &QueryKey, index: usize) -> Result<Page> {
        let page_key = (key.clone(), index);
        let generation = {
            let mut state = self.inner.state.lock();
            if let Some(page) = state.pages.get(&page_key).cloned() {
                state.touch(&page_key);
                self.inner.metrics.incr(Counter::PageHits);
                return Ok(page);
            }
            state.generation
        };

        let page = Arc::new(self.load(key.clone(), index).await?);
        self.store(page_key, generation, Arc::clone(&page));
        Ok(page)
    }

    fn prefetch(&self, key: QueryKey, index: usize) {
        let page_key = (key, index);
        let generation = {
            let mut state = self.inner.state.lock();
            if state.pages.contains_key(&page_key) || !state.inflight.insert(page_key.clone()) {
                return;
            }
            state.generation
        };

        let view = self.clone();
        tokio::spawn(async move {
            let (key, index) = page_key.clone();
            match view.load(key, index).await {
                Ok(items) => {
                    view.inner.metrics.incr(Counter::PagesPrefetched);
                    view.store(page_key, generation, Arc::new(items));
                }
                Err(e) => {
                    view.inner.state.lock().inflight.remove(&page_key);
                    tracing::warn!(page = index, error = %e, "Page prefetch failed");
                }
            }
        });
    }

    async fn load(&self, key: QueryKey, index: usize) -> Result<Vec<Item>> {
        let inner = Arc::clone(&self.inner);
        let deadline = Deadline::after(inner.timeout);
        tokio::task::spawn_blocking(move || {
            let _t = inner.metrics.timer(Op::PageLoad);
            let conn = get_conn_within(&inner.db, deadline)?;
            let limit = i64::try_from(inner.page_size)
                .map_err(|_| Error::Validation("page size out of range".into()))?;
            let offset = i64::try_from(index)
                .ok()
                .and_then(|i| i.checked_mul(limit))
                .ok_or_else(|| Error::Validation(format!("page {index} is out of range")))?;
            queries::items::list_window(&conn, key.library, key.sort, &key.filter, offset, limit)
        })
        .await
        .map_err(|e| Error::Internal(format!("page load task failed: {e}")))?
    }

    /// Cache a loaded page unless the view was invalidated since the load
    /// started.
    fn store(&self, key: PageKey, generation: u64, page: Page) {
        let mut state = self.inner.state.lock();
        state.inflight.remove(&key);
        if state.generation != generation {
            return;
        }
        state.pages.insert(key.clone(), page);
        state.touch(&key);
        while state.pages.len() > self.inner.max_cached_pages {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.pages.remove(&oldest);
        }
    }
}
