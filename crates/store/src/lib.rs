//! Huddle list store: a per-view controller task that keeps the displayed
//! page consistent with the query state and the remote collection.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::{AbortHandle, Abortable};
use huddle_api::CollectionApi;
use huddle_core::resources::ResourceSpec;
use huddle_core::{ApiResult, CollectionResult, Entity, FilterValue, RequestToken};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

mod controller;
mod options;

pub use controller::{Applied, Display, FetchPlan, ListView, Next, Phase, QueryController};
pub use options::{load_filter_options, FilterOption, FilterOptions};

/// Runtime knobs for list controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub page_size: u32,
    pub debounce: Duration,
    pub queue_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self { Self { page_size: 20, debounce: Duration::from_millis(300), queue_cap: 64 } }
}

impl ControllerConfig {
    /// Read `HUDDLE_PAGE_SIZE`, `HUDDLE_SEARCH_DEBOUNCE_MS` and `HUDDLE_QUEUE_CAP`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let page_size = std::env::var("HUDDLE_PAGE_SIZE").ok().and_then(|s| s.parse::<u32>().ok()).filter(|n| *n > 0).unwrap_or(d.page_size);
        let debounce = std::env::var("HUDDLE_SEARCH_DEBOUNCE_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.debounce);
        let queue_cap = std::env::var("HUDDLE_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.queue_cap);
        Self { page_size, debounce, queue_cap }
    }
}

#[derive(Debug)]
enum Command {
    SetFilter(String, FilterValue),
    SetSearch(String),
    SetMany(Vec<(String, FilterValue)>, Option<String>),
    ClearAll,
    SetPage(u32),
    Refresh,
    Shutdown,
}

/// Something that can re-sync a list with the server.
#[async_trait::async_trait]
pub trait Refresh: Send + Sync {
    async fn refresh(&self);
}

/// Handle for a running list controller. Clones share the same controller;
/// it stops when `shutdown` is called or every handle is dropped.
pub struct ListHandle<E> {
    tx: mpsc::Sender<(u64, Command)>,
    seq: Arc<AtomicU64>,
    snap: Arc<ArcSwap<ListView<E>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<E> Clone for ListHandle<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), seq: Arc::clone(&self.seq), snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<E: Entity> ListHandle<E> {
    pub fn current(&self) -> Arc<ListView<E>> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    async fn send(&self, cmd: Command) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send((seq, cmd)).await.is_err() {
            debug!("list controller already stopped; command dropped");
        }
    }

    pub async fn set_filter(&self, key: &str, value: FilterValue) {
        self.send(Command::SetFilter(key.to_string(), value)).await;
    }

    pub async fn set_search(&self, text: &str) { self.send(Command::SetSearch(text.to_string())).await; }

    /// Set several filters (and the search text, if given) as one change.
    pub async fn set_many(&self, filters: Vec<(String, FilterValue)>, search: Option<&str>) {
        self.send(Command::SetMany(filters, search.map(str::to_string))).await;
    }

    pub async fn clear_all(&self) { self.send(Command::ClearAll).await; }

    pub async fn set_page(&self, page: u32) { self.send(Command::SetPage(page)).await; }

    pub async fn refresh(&self) { self.send(Command::Refresh).await; }

    /// Stop the controller. In-flight fetches are aborted and never applied.
    pub async fn shutdown(&self) { self.send(Command::Shutdown).await; }

    /// Wait until every command sent so far was processed, no fetch is
    /// running and no debounced change is waiting.
    pub async fn settled(&self) -> Arc<ListView<E>> {
        let want = self.seq.load(Ordering::SeqCst);
        let mut rx = self.epoch_rx.clone();
        loop {
            let v = self.current();
            if v.seq >= want && v.is_settled() {
                return v;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

#[async_trait::async_trait]
impl<E: Entity> Refresh for ListHandle<E> {
    async fn refresh(&self) { ListHandle::refresh(self).await; }
}

/// Spawn a controller for `resource` and issue its initial fetch.
///
/// Commands are processed in order on one task. Fetches run as separate
/// abortable tasks that report back `(token, result)`; only the response
/// for the latest token is applied, and a superseded fetch is aborted.
/// Snapshots are published through `ArcSwap` with an epoch `watch`.
pub fn spawn_controller<E: Entity>(
    api: Arc<dyn CollectionApi<E>>,
    resource: ResourceSpec,
    config: ControllerConfig,
) -> ListHandle<E> {
    let (tx, mut rx) = mpsc::channel::<(u64, Command)>(config.queue_cap.max(1));
    let mut ctl: QueryController<E> = QueryController::new(resource, config.page_size);
    let first = ctl.mount();
    let initial = ctl.view();
    let (epoch_tx, epoch_rx) = watch::channel(initial.epoch);
    let snap = Arc::new(ArcSwap::from_pointee(initial));
    let snap_clone = Arc::clone(&snap);
    let debounce = config.debounce;

    tokio::spawn(async move {
        let key = ctl.resource().key.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(RequestToken, ApiResult<CollectionResult<E>>)>();
        let mut inflight: Option<AbortHandle> = None;
        let mut deadline: Option<tokio::time::Instant> = None;
        info!(resource = %key, "list controller started");

        let start = |plan: FetchPlan, inflight: &mut Option<AbortHandle>| {
            if let Some(prev) = inflight.take() {
                prev.abort();
            }
            let (handle, reg) = AbortHandle::new_pair();
            *inflight = Some(handle);
            let api = Arc::clone(&api);
            let done = done_tx.clone();
            let key = key.clone();
            counter!("list_fetch_total", 1u64, "resource" => key.clone());
            tokio::spawn(async move {
                let t0 = Instant::now();
                let work = async { api.list(&plan.request).await };
                if let Ok(res) = Abortable::new(work, reg).await {
                    histogram!("list_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0, "resource" => key.clone());
                    match &res {
                        Ok(r) => debug!(resource = %key, token = plan.token.0, items = r.items.len(), total = r.total, took_ms = %t0.elapsed().as_millis(), "list: fetch ok"),
                        Err(e) => warn!(resource = %key, token = plan.token.0, error = %e, "list: fetch failed"),
                    }
                    let _ = done.send((plan.token, res));
                }
            });
        };

        start(first, &mut inflight);
        loop {
            let wake = deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                maybe = rx.recv() => {
                    let Some((seq, cmd)) = maybe else {
                        debug!(resource = %key, "all list handles dropped");
                        break;
                    };
                    let next = match cmd {
                        Command::Shutdown => { ctl.mark_seq(seq); break; }
                        Command::SetFilter(k, v) => ctl.set_filter(&k, v),
                        Command::SetSearch(text) => ctl.set_search(&text),
                        Command::SetMany(filters, search) => ctl.set_many(filters, search.as_deref()),
                        Command::ClearAll => ctl.clear_all(),
                        Command::SetPage(n) => ctl.set_page(n),
                        Command::Refresh => Next::Fetch(ctl.refresh()),
                    };
                    ctl.mark_seq(seq);
                    match next {
                        Next::Idle => { deadline = None; }
                        Next::Unchanged => {}
                        Next::Debounce => { deadline = Some(tokio::time::Instant::now() + debounce); }
                        Next::Fetch(plan) => { deadline = None; start(plan, &mut inflight); }
                    }
                }
                Some((token, res)) = done_rx.recv() => {
                    match ctl.apply(token, res) {
                        Applied::Stale => { counter!("list_stale_discarded_total", 1u64, "resource" => key.clone()); }
                        Applied::Updated => { inflight = None; }
                        Applied::Refetch(plan) => start(plan, &mut inflight),
                    }
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    deadline = None;
                    if let Some(plan) = ctl.flush_debounce() {
                        start(plan, &mut inflight);
                    }
                }
            }
            let view = ctl.view();
            let epoch = view.epoch;
            snap_clone.store(Arc::new(view));
            let _ = epoch_tx.send(epoch);
        }
        if let Some(h) = inflight.take() {
            h.abort();
        }
        // Publish the processed sequence so pending `settled` callers wake up.
        let view = ctl.view();
        let epoch = view.epoch;
        snap_clone.store(Arc::new(view));
        let _ = epoch_tx.send(epoch);
        info!(resource = %key, "list controller stopped");
    });

    ListHandle { tx, seq: Arc::new(AtomicU64::new(0)), snap, epoch_rx }
}
