//! Huddle collection API façade.
//!
//! This crate defines the trait list views and mutation flows depend on.
//! Implementations are a REST client (`HttpCollection`) and an in-memory
//! backend (`MockCollection`) used by tests and demos.

#![forbid(unsafe_code)]

use std::time::Duration;

use huddle_core::resources::Pagination;
use huddle_core::{ApiError, ApiResult, CollectionResult, Entity, EntityId, QueryState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod http;
mod mock;

pub use http::HttpCollection;
pub use mock::{MockCall, MockCollection, MockOp};

/// Parameters of one list fetch: the query it was built from and the
/// pagination style of the target endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRequest {
    pub query: QueryState,
    pub pagination: Pagination,
}

impl ListRequest {
    pub fn new(query: QueryState, pagination: Pagination) -> Self { Self { query, pagination } }

    /// Query parameters in a stable order. Unconstrained filters are omitted.
    pub fn params(&self) -> SmallVec<[(String, String); 8]> {
        let mut out: SmallVec<[(String, String); 8]> = SmallVec::new();
        let q = &self.query;
        match self.pagination {
            Pagination::SkipLimit => {
                out.push(("skip".into(), q.skip().to_string()));
                out.push(("limit".into(), q.page_size.to_string()));
            }
            Pagination::PagePageSize => {
                out.push(("page".into(), q.page.to_string()));
                out.push(("page_size".into(), q.page_size.to_string()));
            }
        }
        if let Some(s) = q.effective_search() {
            out.push((huddle_core::SEARCH_KEY.into(), s.to_string()));
        }
        for (k, v) in q.effective_filters() {
            out.push((k.to_string(), v));
        }
        out
    }
}

/// The list response shapes seen across endpoints.
///
/// A bare array, an `{items, total}` page, or either of those wrapped in
/// `{data: ...}` (optionally with a sibling `total`). All of them normalize
/// into a `CollectionResult`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListPayload<E> {
    Bare(Vec<E>),
    Paged {
        items: Vec<E>,
        #[serde(default)]
        total: Option<u64>,
    },
    Wrapped {
        data: Box<ListPayload<E>>,
        #[serde(default)]
        total: Option<u64>,
    },
}

impl<E> ListPayload<E> {
    /// Normalize into the current page for `query`.
    ///
    /// A bare array counts as the full collection (`total = len`); when it is
    /// longer than a page, the current page is sliced out locally.
    pub fn normalize(self, query: &QueryState) -> CollectionResult<E> {
        let page_size = query.page_size.max(1);
        match self {
            ListPayload::Bare(items) => {
                let total = items.len() as u64;
                let items = if items.len() > page_size as usize {
                    let skip = usize::try_from(query.skip()).unwrap_or(usize::MAX);
                    items.into_iter().skip(skip).take(page_size as usize).collect()
                } else {
                    items
                };
                CollectionResult { items, total, page: query.page, page_size }
            }
            ListPayload::Paged { mut items, total } => {
                items.truncate(page_size as usize);
                let total = total.unwrap_or(items.len() as u64).max(items.len() as u64);
                CollectionResult { items, total, page: query.page, page_size }
            }
            ListPayload::Wrapped { data, total } => match (*data, total) {
                // A sibling total means the server already paged the array.
                (ListPayload::Bare(items), Some(t)) => ListPayload::Paged { items, total: Some(t) }.normalize(query),
                (ListPayload::Paged { items, total: inner }, outer) => {
                    ListPayload::Paged { items, total: inner.or(outer) }.normalize(query)
                }
                (inner, _) => inner.normalize(query),
            },
        }
    }
}

/// Parse and normalize a raw list response body.
pub fn decode_list<E: DeserializeOwned>(body: &[u8], query: &QueryState) -> ApiResult<CollectionResult<E>> {
    let payload: ListPayload<E> = serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(payload.normalize(query))
}

/// What a mutation endpoint answered: the updated entity or a status envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationAck<E> {
    Entity(E),
    Message(Option<String>),
}

impl<E> MutationAck<E> {
    pub fn message(&self) -> Option<&str> {
        match self {
            MutationAck::Message(m) => m.as_deref(),
            MutationAck::Entity(_) => None,
        }
    }
}

const ENVELOPE_KEYS: [&str; 5] = ["message", "detail", "status", "success", "ok"];

/// Parse a mutation response body: empty, `{message}`-style envelope, `{data: entity}` or an entity.
pub fn decode_ack<E: DeserializeOwned>(body: &[u8]) -> ApiResult<MutationAck<E>> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(MutationAck::Message(None));
    }
    let v: serde_json::Value = serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    if let Some(obj) = v.as_object() {
        if !obj.is_empty() && obj.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str())) {
            let msg = obj.get("message").or_else(|| obj.get("detail")).and_then(|m| m.as_str()).map(str::to_string);
            return Ok(MutationAck::Message(msg));
        }
        if let Some(data) = obj.get("data").filter(|_| obj.len() == 1) {
            return serde_json::from_value(data.clone()).map(MutationAck::Entity).map_err(|e| ApiError::Decode(e.to_string()));
        }
    }
    serde_json::from_value(v).map(MutationAck::Entity).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Remote collection of entities of one resource.
#[async_trait::async_trait]
pub trait CollectionApi<E: Entity>: Send + Sync {
    /// Fetch one page for the given query.
    async fn list(&self, request: &ListRequest) -> ApiResult<CollectionResult<E>>;

    async fn create(&self, payload: serde_json::Value) -> ApiResult<MutationAck<E>>;

    async fn update(&self, id: &EntityId, payload: serde_json::Value) -> ApiResult<MutationAck<E>>;

    async fn delete(&self, id: &EntityId) -> ApiResult<MutationAck<E>>;

    /// Named status transition, `POST {item}/{action}`.
    async fn transition(
        &self,
        id: &EntityId,
        action: &str,
        payload: Option<serde_json::Value>,
    ) -> ApiResult<MutationAck<E>>;
}

/// Session capability injected into clients; the core only needs a bearer token.
pub trait Session: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    fn is_valid(&self) -> bool { self.bearer_token().is_some() }
}

/// Fixed token, typically from configuration.
#[derive(Debug, Clone)]
pub struct StaticSession(pub String);

impl Session for StaticSession {
    fn bearer_token(&self) -> Option<String> {
        if self.0.trim().is_empty() { None } else { Some(self.0.clone()) }
    }
}

/// No credentials; requests go out unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl Session for NoSession {
    fn bearer_token(&self) -> Option<String> { None }
}

/// Connection settings for the REST backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:8000/api/v1".to_string(), token: None, timeout: Duration::from_secs(15) }
    }
}

impl ApiConfig {
    /// Read `HUDDLE_API_URL`, `HUDDLE_API_TOKEN` and `HUDDLE_HTTP_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let base_url = std::env::var("HUDDLE_API_URL").ok().filter(|s| !s.trim().is_empty()).unwrap_or(d.base_url);
        let token = std::env::var("HUDDLE_API_TOKEN").ok().filter(|s| !s.trim().is_empty());
        let timeout = std::env::var("HUDDLE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.timeout);
        Self { base_url, token, timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{FilterValue, Record};
    use serde_json::json;

    fn query(page: u32, size: u32) -> QueryState {
        let mut q = QueryState::new(size);
        q.page = page;
        q
    }

    #[test]
    fn params_skip_limit_omit_null_filters() {
        let mut q = QueryState::new(20);
        q.set_filter("status", FilterValue::Tag("active".into()));
        q.set_filter("category", FilterValue::None);
        q.set_search("  bob ");
        q.page = 3;
        let req = ListRequest::new(q, Pagination::SkipLimit);
        let p: Vec<_> = req.params().into_iter().collect();
        assert_eq!(
            p,
            vec![
                ("skip".to_string(), "40".to_string()),
                ("limit".to_string(), "20".to_string()),
                ("search".to_string(), "bob".to_string()),
                ("status".to_string(), "active".to_string()),
            ]
        );
    }

    #[test]
    fn params_page_style() {
        let req = ListRequest::new(query(2, 10), Pagination::PagePageSize);
        let p: Vec<_> = req.params().into_iter().collect();
        assert_eq!(p[0], ("page".to_string(), "2".to_string()));
        assert_eq!(p[1], ("page_size".to_string(), "10".to_string()));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn bare_array_counts_as_full_collection() {
        let body = br#"[{"id":1},{"id":2},{"id":3}]"#;
        let r: CollectionResult<Record> = decode_list(body, &query(1, 20)).unwrap();
        assert_eq!(r.total, 3);
        assert_eq!(r.items.len(), 3);
    }

    #[test]
    fn bare_array_longer_than_page_is_sliced() {
        let body = br#"[{"id":1},{"id":2},{"id":3},{"id":4},{"id":5}]"#;
        let r: CollectionResult<Record> = decode_list(body, &query(2, 2)).unwrap();
        assert_eq!(r.total, 5);
        let ids: Vec<_> = r.items.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["3", "4"]);
    }

    #[test]
    fn paged_and_wrapped_shapes() {
        let paged = br#"{"items":[{"id":1}],"total":41,"skip":0,"limit":20}"#;
        let r: CollectionResult<Record> = decode_list(paged, &query(1, 20)).unwrap();
        assert_eq!((r.items.len(), r.total), (1, 41));

        let wrapped = br#"{"data":{"items":[{"id":1},{"id":2}],"total":2}}"#;
        let r: CollectionResult<Record> = decode_list(wrapped, &query(1, 20)).unwrap();
        assert_eq!(r.total, 2);

        let wrapped_bare = br#"{"data":[{"id":7}]}"#;
        let r: CollectionResult<Record> = decode_list(wrapped_bare, &query(1, 20)).unwrap();
        assert_eq!(r.items[0].id().as_str(), "7");
    }

    #[test]
    fn wrapped_sibling_total_is_kept() {
        let body = br#"{"data":[{"id":21},{"id":22}],"total":42}"#;
        let r: CollectionResult<Record> = decode_list(body, &query(11, 2)).unwrap();
        assert_eq!(r.total, 42);
        let ids: Vec<_> = r.items.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["21", "22"]);

        let nested = br#"{"data":{"items":[{"id":1}]},"total":9}"#;
        let r: CollectionResult<Record> = decode_list(nested, &query(1, 20)).unwrap();
        assert_eq!(r.total, 9);
    }

    #[test]
    fn total_never_below_item_count() {
        let body = br#"{"items":[{"id":1},{"id":2}],"total":0}"#;
        let r: CollectionResult<Record> = decode_list(body, &query(1, 20)).unwrap();
        assert_eq!(r.total, 2);
    }

    #[test]
    fn ack_shapes() {
        let m: MutationAck<Record> = decode_ack(br#"{"message":"Enrollment cancelled"}"#).unwrap();
        assert_eq!(m.message(), Some("Enrollment cancelled"));
        let empty: MutationAck<Record> = decode_ack(b"").unwrap();
        assert_eq!(empty, MutationAck::Message(None));
        let e: MutationAck<Record> = decode_ack(br#"{"data":{"id":5,"name":"x"}}"#).unwrap();
        assert_eq!(e, MutationAck::Entity(Record(json!({"id":5,"name":"x"}))));
        let raw: MutationAck<Record> = decode_ack(br#"{"id":6,"status":"active"}"#).unwrap();
        assert!(matches!(raw, MutationAck::Entity(_)));
    }

    #[test]
    fn garbage_list_is_decode_error() {
        let r: ApiResult<CollectionResult<Record>> = decode_list(b"{\"oops\":1}", &query(1, 20));
        assert!(matches!(r, Err(ApiError::Decode(_))));
    }
}
