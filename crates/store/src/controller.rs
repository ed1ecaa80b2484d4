//! Synchronous list-view state machine.
//!
//! `QueryController` owns the query state and the last good page. It never
//! performs I/O: operations return what to do next (`Next`), fetches are
//! described by a `FetchPlan`, and responses come back through `apply`.
//! The async driver in the crate root turns those instructions into tasks.

#![forbid(unsafe_code)]

use huddle_api::ListRequest;
use huddle_core::resources::{Pagination, ResourceSpec};
use huddle_core::{
    page_count, ApiError, ApiResult, CollectionResult, FilterTrigger, FilterValue, QueryState, RequestToken,
    SEARCH_KEY,
};
use serde::Serialize;
use tracing::debug;

/// Fetch lifecycle. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Loading,
    Success,
    Error,
}

/// What a list view should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Display {
    /// First load still running; nothing to show yet.
    Loading,
    Rows,
    /// Successful fetch with zero matches.
    Empty,
    /// No data was ever loaded and the last fetch failed.
    Failed { message: String, retryable: bool },
}

/// A single fetch to issue.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub token: RequestToken,
    pub request: ListRequest,
}

/// Instruction returned by a state change.
#[derive(Debug, Clone)]
pub enum Next {
    /// Nothing to fetch and nothing waiting.
    Idle,
    /// Nothing changed; a running debounce window keeps its deadline.
    Unchanged,
    /// (Re)start the debounce window, then call `flush_debounce`.
    Debounce,
    Fetch(FetchPlan),
}

/// Result of applying a response.
#[derive(Debug, Clone)]
pub enum Applied {
    /// Token was superseded; state untouched.
    Stale,
    Updated,
    /// The page fell past the end (rows removed meanwhile); re-issued on the last page.
    Refetch(FetchPlan),
}

/// Immutable snapshot handed to renderers.
#[derive(Debug, Clone)]
pub struct ListView<E> {
    pub phase: Phase,
    pub query: QueryState,
    pub items: Vec<E>,
    pub total: u64,
    pub page_count: u32,
    pub error: Option<ApiError>,
    /// Human-readable form of `error`.
    pub error_message: Option<String>,
    /// At least one fetch has succeeded.
    pub loaded: bool,
    pub debounce_pending: bool,
    pub token: RequestToken,
    pub epoch: u64,
    /// Sequence number of the last command the controller processed.
    pub seq: u64,
}

impl<E> ListView<E> {
    pub fn display(&self) -> Display {
        if self.loaded {
            if self.items.is_empty() && self.phase != Phase::Loading {
                return Display::Empty;
            }
            return Display::Rows;
        }
        match (&self.phase, &self.error) {
            (Phase::Error, Some(e)) => Display::Failed {
                message: self.error_message.clone().unwrap_or_else(|| e.to_string()),
                retryable: e.is_retryable(),
            },
            _ => Display::Loading,
        }
    }

    /// Error to show as a transient notice while older rows stay visible.
    pub fn stale_error(&self) -> Option<&str> {
        if self.loaded && self.phase == Phase::Error { self.error_message.as_deref() } else { None }
    }

    /// No fetch running and no debounced change waiting.
    pub fn is_settled(&self) -> bool {
        !matches!(self.phase, Phase::Loading | Phase::Idle) && !self.debounce_pending
    }
}

pub struct QueryController<E> {
    resource: ResourceSpec,
    query: QueryState,
    result: Option<CollectionResult<E>>,
    phase: Phase,
    error: Option<ApiError>,
    latest: RequestToken,
    issued: Option<QueryState>,
    debounce_pending: bool,
    epoch: u64,
    seq: u64,
}

impl<E: Clone> QueryController<E> {
    pub fn new(resource: ResourceSpec, page_size: u32) -> Self {
        Self {
            resource,
            query: QueryState::new(page_size),
            result: None,
            phase: Phase::Idle,
            error: None,
            latest: RequestToken::default(),
            issued: None,
            debounce_pending: false,
            epoch: 0,
            seq: 0,
        }
    }

    pub fn resource(&self) -> &ResourceSpec { &self.resource }

    pub fn query(&self) -> &QueryState { &self.query }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn latest_token(&self) -> RequestToken { self.latest }

    pub fn mark_seq(&mut self, seq: u64) { self.seq = self.seq.max(seq); }

    fn pagination(&self) -> Pagination { self.resource.pagination }

    fn trigger_for(&self, key: &str) -> FilterTrigger {
        match self.resource.filter_field(key) {
            Some(f) => f.trigger,
            None if key == SEARCH_KEY => FilterTrigger::Debounced,
            None => FilterTrigger::Immediate,
        }
    }

    fn page_count(&self) -> u32 {
        match &self.result {
            Some(r) => page_count(r.total, self.query.page_size),
            None => 1,
        }
    }

    /// Initial load on mount.
    pub fn mount(&mut self) -> FetchPlan { self.begin_fetch() }

    pub fn set_filter(&mut self, key: &str, value: FilterValue) -> Next {
        let changed = if key == SEARCH_KEY {
            self.query.set_search(value.to_param().as_deref().unwrap_or(""))
        } else {
            self.query.set_filter(key, value)
        };
        self.after_change(changed, self.trigger_for(key))
    }

    pub fn set_search(&mut self, text: &str) -> Next {
        let changed = self.query.set_search(text);
        self.after_change(changed, self.trigger_for(SEARCH_KEY))
    }

    /// Apply several filters and optionally the search text as one change.
    /// The batch is a committed edit, so it fetches right away (absorbing any
    /// pending debounce) and issues at most one fetch.
    pub fn set_many<I>(&mut self, filters: I, search: Option<&str>) -> Next
    where
        I: IntoIterator<Item = (String, FilterValue)>,
    {
        let mut changed = false;
        for (key, value) in filters {
            changed |= self.query.set_filter(&key, value);
        }
        if let Some(text) = search {
            changed |= self.query.set_search(text);
        }
        if changed || (self.debounce_pending && self.differs_from_issued()) {
            return Next::Fetch(self.begin_fetch());
        }
        self.hold()
    }

    /// Reset all filters and the search text: one update, at most one fetch.
    pub fn clear_all(&mut self) -> Next {
        let changed = self.query.clear_all();
        if !changed && !self.differs_from_issued() {
            self.debounce_pending = false;
            self.epoch += 1;
            return Next::Idle;
        }
        Next::Fetch(self.begin_fetch())
    }

    /// Move to page `n`, clamped into the valid range. A clamp that lands on
    /// the current page issues nothing.
    pub fn set_page(&mut self, n: u32) -> Next {
        let pages = self.page_count();
        if self.query.set_page(n, pages) || (!self.debounce_pending && self.differs_from_issued()) {
            Next::Fetch(self.begin_fetch())
        } else {
            self.hold()
        }
    }

    fn hold(&self) -> Next {
        if self.debounce_pending { Next::Unchanged } else { Next::Idle }
    }

    /// Re-issue the current query without resetting the page.
    pub fn refresh(&mut self) -> FetchPlan { self.begin_fetch() }

    /// Debounce window elapsed. Skips the fetch when the text settled back
    /// to what was last requested.
    pub fn flush_debounce(&mut self) -> Option<FetchPlan> {
        if !self.debounce_pending { return None; }
        if !self.differs_from_issued() && self.phase != Phase::Error {
            self.debounce_pending = false;
            self.epoch += 1;
            return None;
        }
        Some(self.begin_fetch())
    }

    fn differs_from_issued(&self) -> bool {
        match &self.issued {
            Some(q) => !q.same_request(&self.query),
            None => true,
        }
    }

    fn after_change(&mut self, changed: bool, trigger: FilterTrigger) -> Next {
        if !changed {
            return self.hold();
        }
        match trigger {
            FilterTrigger::Debounced => {
                self.debounce_pending = true;
                self.epoch += 1;
                Next::Debounce
            }
            FilterTrigger::Immediate => Next::Fetch(self.begin_fetch()),
        }
    }

    fn begin_fetch(&mut self) -> FetchPlan {
        self.latest = self.latest.next();
        self.phase = Phase::Loading;
        self.debounce_pending = false;
        self.issued = Some(self.query.clone());
        self.epoch += 1;
        debug!(resource = %self.resource.key, token = self.latest.0, page = self.query.page, "list: fetch planned");
        FetchPlan { token: self.latest, request: ListRequest::new(self.query.clone(), self.pagination()) }
    }

    /// Apply a fetch outcome. Only the latest token may change state.
    pub fn apply(&mut self, token: RequestToken, outcome: ApiResult<CollectionResult<E>>) -> Applied {
        if token != self.latest {
            debug!(resource = %self.resource.key, token = token.0, latest = self.latest.0, "list: stale response discarded");
            return Applied::Stale;
        }
        self.epoch += 1;
        match outcome {
            Ok(result) => {
                let pages = page_count(result.total, self.query.page_size);
                if result.items.is_empty() && self.query.page > pages {
                    self.query.page = pages;
                    return Applied::Refetch(self.begin_fetch());
                }
                self.result = Some(result);
                self.error = None;
                self.phase = Phase::Success;
            }
            Err(e) => {
                self.error = Some(e);
                self.phase = Phase::Error;
            }
        }
        Applied::Updated
    }

    pub fn view(&self) -> ListView<E> {
        let (items, total) = match &self.result {
            Some(r) => (r.items.clone(), r.total),
            None => (Vec::new(), 0),
        };
        let action = format!("load {}", self.resource.label.to_lowercase());
        ListView {
            phase: self.phase,
            query: self.query.clone(),
            items,
            total,
            page_count: self.page_count(),
            error_message: self.error.as_ref().map(|e| e.user_message(&action)),
            error: self.error.clone(),
            loaded: self.result.is_some(),
            debounce_pending: self.debounce_pending,
            token: self.latest,
            epoch: self.epoch,
            seq: self.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::resources::resource_for;
    use huddle_core::Record;
    use serde_json::json;

    fn ctl() -> QueryController<Record> { QueryController::new(resource_for("classes").unwrap(), 2) }

    fn page(ids: &[u64], total: u64) -> CollectionResult<Record> {
        CollectionResult { items: ids.iter().map(|i| Record(json!({"id": i}))).collect(), total, page: 1, page_size: 2 }
    }

    fn fetch(next: Next) -> FetchPlan {
        match next {
            Next::Fetch(p) => p,
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    #[test]
    fn mount_enters_loading() {
        let mut c = ctl();
        assert_eq!(c.view().display(), Display::Loading);
        let p = c.mount();
        assert_eq!(c.phase(), Phase::Loading);
        assert_eq!(p.token, RequestToken(1));
        assert_eq!(c.view().display(), Display::Loading);
    }

    #[test]
    fn only_latest_token_applies() {
        let mut c = ctl();
        let first = c.mount();
        let second = fetch(c.set_filter("status", FilterValue::Tag("active".into())));
        assert!(matches!(c.apply(second.token, Ok(page(&[2], 1))), Applied::Updated));
        // the slow "show all" response arrives after the filtered one
        assert!(matches!(c.apply(first.token, Ok(page(&[1, 2], 3))), Applied::Stale));
        let v = c.view();
        assert_eq!(v.total, 1);
        assert_eq!(v.items.len(), 1);
    }

    #[test]
    fn search_debounces_and_discrete_filters_do_not() {
        let mut c = ctl();
        c.mount();
        assert!(matches!(c.set_search("bo"), Next::Debounce));
        assert!(matches!(c.set_search("bob"), Next::Debounce));
        assert!(c.view().debounce_pending);
        let p = c.flush_debounce().expect("fetch after window");
        assert_eq!(p.request.query.effective_search(), Some("bob"));
        assert!(c.flush_debounce().is_none());
        assert!(matches!(c.set_filter("status", FilterValue::Tag("active".into())), Next::Fetch(_)));
    }

    #[test]
    fn immediate_filter_absorbs_pending_search() {
        let mut c = ctl();
        c.mount();
        c.set_search("ann");
        let p = fetch(c.set_filter("status", FilterValue::Tag("active".into())));
        assert_eq!(p.request.query.effective_search(), Some("ann"));
        assert!(!c.view().debounce_pending);
        assert!(c.flush_debounce().is_none());
    }

    #[test]
    fn search_typed_back_to_issued_text_skips_fetch() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1], 1)));
        c.set_search("x");
        c.set_search("");
        assert!(c.flush_debounce().is_none());
        assert!(c.view().is_settled());
    }

    #[test]
    fn no_op_commands_leave_pending_debounce_alone() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1], 1)));
        assert!(matches!(c.set_search("bob"), Next::Debounce));
        assert!(matches!(c.set_filter("status", FilterValue::None), Next::Unchanged));
        assert!(matches!(c.set_page(1), Next::Unchanged));
        assert!(c.view().debounce_pending);
        assert_eq!(c.flush_debounce().unwrap().request.query.effective_search(), Some("bob"));
        assert!(matches!(c.set_page(1), Next::Idle));
    }

    #[test]
    fn set_page_while_text_settled_back_waits_for_window() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1], 1)));
        c.set_search("x");
        c.set_search("");
        assert!(matches!(c.set_page(1), Next::Unchanged));
        assert!(c.flush_debounce().is_none());
        assert!(c.view().is_settled());
    }

    #[test]
    fn set_many_is_one_fetch_with_every_field() {
        let mut c = ctl();
        c.mount();
        let filters = vec![
            ("status".to_string(), FilterValue::Tag("active".into())),
            ("program_id".to_string(), FilterValue::Tag("7".into())),
        ];
        let p = fetch(c.set_many(filters.clone(), Some("soccer")));
        assert_eq!(p.request.query.effective_filters().count(), 2);
        assert_eq!(p.request.query.effective_search(), Some("soccer"));
        assert!(!c.view().debounce_pending);
        assert!(matches!(c.set_many(filters, Some("soccer")), Next::Idle));
    }

    #[test]
    fn clear_all_is_one_fetch_without_filters() {
        let mut c = ctl();
        c.mount();
        c.set_filter("status", FilterValue::Tag("active".into()));
        c.set_filter("program_id", FilterValue::Tag("7".into()));
        let p = fetch(c.clear_all());
        assert_eq!(p.request.query.effective_filters().count(), 0);
        assert!(matches!(c.clear_all(), Next::Idle));
    }

    #[test]
    fn set_page_is_clamped_to_known_total() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1, 2], 5)));
        let p = fetch(c.set_page(99));
        assert_eq!(p.request.query.page, 3);
        c.apply(p.token, Ok(page(&[5], 5)));
        assert!(matches!(c.set_page(7), Next::Idle));
        assert_eq!(c.query().page, 3);
        assert_eq!(fetch(c.set_page(0)).request.query.page, 1);
    }

    #[test]
    fn error_keeps_previous_rows() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1, 2], 2)));
        let p = c.refresh();
        c.apply(p.token, Err(ApiError::Server { status: 500, message: String::new() }));
        let v = c.view();
        assert_eq!(v.items.len(), 2);
        assert_eq!(v.display(), Display::Rows);
        assert_eq!(v.stale_error(), Some("Something went wrong while trying to load classes. Please try again."));
    }

    #[test]
    fn first_fetch_error_is_distinct_from_empty() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Err(ApiError::Transport("connection refused".into())));
        assert!(matches!(c.view().display(), Display::Failed { retryable: true, .. }));

        let mut ok = ctl();
        let p = ok.mount();
        ok.apply(p.token, Ok(page(&[], 0)));
        assert_eq!(ok.view().display(), Display::Empty);

        // A failed refresh of an empty page still renders as empty.
        let p = ok.refresh();
        ok.apply(p.token, Err(ApiError::Transport("reset".into())));
        let v = ok.view();
        assert_eq!(v.display(), Display::Empty);
        assert!(v.stale_error().is_some());
    }

    #[test]
    fn page_past_end_is_reissued_on_last_page() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1, 2], 6)));
        let p = fetch(c.set_page(3));
        // rows were deleted elsewhere; only 3 remain
        match c.apply(p.token, Ok(CollectionResult { items: vec![], total: 3, page: 3, page_size: 2 })) {
            Applied::Refetch(next) => assert_eq!(next.request.query.page, 2),
            other => panic!("expected refetch, got {:?}", other),
        }
    }

    #[test]
    fn refresh_keeps_page() {
        let mut c = ctl();
        let p = c.mount();
        c.apply(p.token, Ok(page(&[1, 2], 6)));
        let p = fetch(c.set_page(2));
        c.apply(p.token, Ok(page(&[3, 4], 6)));
        assert_eq!(c.refresh().request.query.page, 2);
    }
}
