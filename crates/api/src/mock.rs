#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use huddle_core::{ApiError, ApiResult, CollectionResult, Entity, EntityId, QueryState};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{CollectionApi, ListRequest, MutationAck};

/// Operation selector for scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Create,
    Update,
    Delete,
    Transition,
}

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    List(QueryState),
    Create(Value),
    Update(EntityId, Value),
    Delete(EntityId),
    Transition(EntityId, String, Option<Value>),
}

type ListDelay = Arc<dyn Fn(&QueryState) -> Duration + Send + Sync>;

#[derive(Default)]
struct Inner {
    rows: Vec<Value>,
    next_id: u64,
    failures: FxHashMap<MockOp, VecDeque<ApiError>>,
    calls: Vec<MockCall>,
}

/// In-memory collection with server-assigned ids and timestamps.
///
/// Search is a case-insensitive substring match over string fields; filters
/// match a field's rendered value exactly. Failures and per-call latency can
/// be scripted, and every call is recorded for assertions.
pub struct MockCollection<E> {
    inner: Mutex<Inner>,
    list_delay: Option<ListDelay>,
    mutation_delay: Duration,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Default for MockCollection<E> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { next_id: 1, ..Inner::default() }), list_delay: None, mutation_delay: Duration::ZERO, _entity: PhantomData }
    }
}

impl<E> MockCollection<E> {
    pub fn new() -> Self { Self::default() }

    /// Seed rows. Rows without an `id` get one assigned.
    pub fn with_rows(rows: impl IntoIterator<Item = Value>) -> Self {
        let me = Self::default();
        {
            let mut g = me.lock();
            for mut row in rows {
                assign_id(&mut g, &mut row);
                g.rows.push(row);
            }
        }
        me
    }

    /// Delay each list response by `f(query)`; lets tests reorder overlapping responses.
    pub fn with_list_delay(mut self, f: impl Fn(&QueryState) -> Duration + Send + Sync + 'static) -> Self {
        self.list_delay = Some(Arc::new(f));
        self
    }

    pub fn with_mutation_delay(mut self, d: Duration) -> Self {
        self.mutation_delay = d;
        self
    }

    /// Make the next call of `op` fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, err: ApiError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<MockCall> { self.lock().calls.clone() }

    pub fn list_calls(&self) -> Vec<QueryState> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::List(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn rows(&self) -> Vec<Value> { self.lock().rows.clone() }

    /// Insert or replace a row behind the controller's back (another admin's edit).
    pub fn upsert_row(&self, mut row: Value) {
        let mut g = self.lock();
        assign_id(&mut g, &mut row);
        let id = row.get("id").and_then(EntityId::from_json);
        match g.rows.iter().position(|r| r.get("id").and_then(EntityId::from_json) == id) {
            Some(idx) => g.rows[idx] = row,
            None => g.rows.push(row),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: MockOp, call: MockCall) -> ApiResult<()> {
        let mut g = self.lock();
        g.calls.push(call);
        match g.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn position(g: &Inner, id: &EntityId) -> ApiResult<usize> {
        g.rows
            .iter()
            .position(|r| r.get("id").and_then(EntityId::from_json).as_ref() == Some(id))
            .ok_or_else(|| ApiError::NotFound(format!("{} not found", id)))
    }
}

fn assign_id(g: &mut Inner, row: &mut Value) {
    let Some(obj) = row.as_object_mut() else { return };
    match obj.get("id").and_then(|v| v.as_u64()) {
        Some(n) => g.next_id = g.next_id.max(n + 1),
        None if obj.get("id").and_then(EntityId::from_json).is_some() => {}
        None => {
            obj.insert("id".into(), Value::from(g.next_id));
            g.next_id += 1;
        }
    }
}

fn render(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn matches(row: &Value, q: &QueryState) -> bool {
    for (key, want) in q.effective_filters() {
        match row.get(key).and_then(render) {
            Some(have) if have.eq_ignore_ascii_case(&want) => {}
            _ => return false,
        }
    }
    if let Some(needle) = q.effective_search() {
        let needle = needle.to_lowercase();
        let hit = row
            .as_object()
            .map(|o| o.values().any(|v| v.as_str().map(|s| s.to_lowercase().contains(&needle)).unwrap_or(false)))
            .unwrap_or(false);
        if !hit { return false; }
    }
    true
}

fn transition_status(action: &str) -> String {
    match action {
        "activate" => "active".into(),
        "deactivate" => "inactive".into(),
        "archive" => "archived".into(),
        "cancel" => "cancelled".into(),
        "approve" => "approved".into(),
        "reject" => "rejected".into(),
        "publish" => "published".into(),
        "void" => "void".into(),
        other => other.to_string(),
    }
}

impl<E> MockCollection<E>
where
    E: Entity + DeserializeOwned,
{
    fn to_entity(v: Value) -> ApiResult<E> {
        serde_json::from_value(v).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn mutation_pause(&self) {
        if !self.mutation_delay.is_zero() {
            tokio::time::sleep(self.mutation_delay).await;
        }
    }
}

#[async_trait::async_trait]
impl<E> CollectionApi<E> for MockCollection<E>
where
    E: Entity + DeserializeOwned,
{
    async fn list(&self, request: &ListRequest) -> ApiResult<CollectionResult<E>> {
        let q = request.query.clone();
        let delay = self.list_delay.as_ref().map(|f| f(&q)).unwrap_or(Duration::ZERO);
        self.record(MockOp::List, MockCall::List(q.clone()))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // Evaluate at response time so data changed while "in flight" is visible.
        let (page, total) = {
            let g = self.lock();
            let hits: Vec<Value> = g.rows.iter().filter(|r| matches(r, &q)).cloned().collect();
            let total = hits.len() as u64;
            let skip = usize::try_from(q.skip()).unwrap_or(usize::MAX);
            let page: Vec<Value> = hits.into_iter().skip(skip).take(q.page_size as usize).collect();
            (page, total)
        };
        debug!(page = q.page, items = page.len(), total, "mock: list");
        let items = page.into_iter().map(Self::to_entity).collect::<ApiResult<Vec<E>>>()?;
        Ok(CollectionResult { items, total, page: q.page, page_size: q.page_size })
    }

    async fn create(&self, payload: Value) -> ApiResult<MutationAck<E>> {
        self.record(MockOp::Create, MockCall::Create(payload.clone()))?;
        self.mutation_pause().await;
        let mut row = match payload {
            Value::Object(o) => Value::Object(o),
            _ => {
                return Err(ApiError::Validation { message: "payload must be an object".into(), fields: Vec::new() })
            }
        };
        let row = {
            let mut g = self.lock();
            if let Some(obj) = row.as_object_mut() {
                obj.remove("id");
                obj.insert("created_at".into(), Value::String(chrono::Utc::now().to_rfc3339()));
            }
            assign_id(&mut g, &mut row);
            g.rows.push(row.clone());
            row
        };
        Ok(MutationAck::Entity(Self::to_entity(row)?))
    }

    async fn update(&self, id: &EntityId, payload: Value) -> ApiResult<MutationAck<E>> {
        self.record(MockOp::Update, MockCall::Update(id.clone(), payload.clone()))?;
        self.mutation_pause().await;
        let row = {
            let mut g = self.lock();
            let idx = Self::position(&g, id)?;
            if let (Some(dst), Value::Object(src)) = (g.rows[idx].as_object_mut(), payload) {
                for (k, v) in src {
                    if k != "id" { dst.insert(k, v); }
                }
                dst.insert("updated_at".into(), Value::String(chrono::Utc::now().to_rfc3339()));
            }
            g.rows[idx].clone()
        };
        Ok(MutationAck::Entity(Self::to_entity(row)?))
    }

    async fn delete(&self, id: &EntityId) -> ApiResult<MutationAck<E>> {
        self.record(MockOp::Delete, MockCall::Delete(id.clone()))?;
        self.mutation_pause().await;
        let mut g = self.lock();
        let idx = Self::position(&g, id)?;
        g.rows.remove(idx);
        Ok(MutationAck::Message(Some(format!("{} deleted", id))))
    }

    async fn transition(&self, id: &EntityId, action: &str, payload: Option<Value>) -> ApiResult<MutationAck<E>> {
        self.record(MockOp::Transition, MockCall::Transition(id.clone(), action.to_string(), payload.clone()))?;
        self.mutation_pause().await;
        let row = {
            let mut g = self.lock();
            let idx = Self::position(&g, id)?;
            if let Some(dst) = g.rows[idx].as_object_mut() {
                dst.insert("status".into(), Value::String(transition_status(action)));
                if let Some(reason) = payload.as_ref().and_then(|p| p.get("reason")).cloned() {
                    dst.insert("status_reason".into(), reason);
                }
            }
            g.rows[idx].clone()
        };
        Ok(MutationAck::Entity(Self::to_entity(row)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::resources::Pagination;
    use huddle_core::{FilterValue, Record};
    use serde_json::json;

    fn req(q: QueryState) -> ListRequest { ListRequest::new(q, Pagination::SkipLimit) }

    fn seeded() -> MockCollection<Record> {
        MockCollection::with_rows(vec![
            json!({"name": "Alpha", "status": "active", "category": "sports"}),
            json!({"name": "Bravo", "status": "inactive", "category": "arts"}),
            json!({"name": "Charlie", "status": "active", "category": "arts"}),
        ])
    }

    #[tokio::test]
    async fn list_filters_and_searches() {
        let m = seeded();
        let mut q = QueryState::new(10);
        q.set_filter("status", FilterValue::Tag("active".into()));
        let r = m.list(&req(q.clone())).await.unwrap();
        assert_eq!(r.total, 2);
        q.set_search("char");
        let r = m.list(&req(q)).await.unwrap();
        assert_eq!(r.total, 1);
        assert_eq!(r.items[0].get_str("name"), Some("Charlie"));
    }

    #[tokio::test]
    async fn list_paginates() {
        let m = seeded();
        let mut q = QueryState::new(2);
        q.page = 2;
        let r = m.list(&req(q)).await.unwrap();
        assert_eq!(r.total, 3);
        assert_eq!(r.items.len(), 1);
    }

    #[tokio::test]
    async fn create_assigns_id_and_timestamp() {
        let m = seeded();
        let ack = m.create(json!({"name": "Delta", "id": 999})).await.unwrap();
        let MutationAck::Entity(rec) = ack else { panic!("expected entity") };
        assert_eq!(rec.id().as_str(), "4");
        assert!(rec.get_str("created_at").is_some());
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let m = seeded();
        m.fail_next(MockOp::Delete, ApiError::Conflict("Cannot delete: active references".into()));
        let id = EntityId::new("1");
        assert!(matches!(m.delete(&id).await, Err(ApiError::Conflict(_))));
        assert_eq!(m.rows().len(), 3);
        assert!(m.delete(&id).await.is_ok());
        assert_eq!(m.rows().len(), 2);
        assert!(matches!(m.delete(&id).await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn transition_sets_status_and_reason() {
        let m = seeded();
        let ack = m.transition(&EntityId::new("2"), "reject", Some(json!({"reason": "duplicate"}))).await.unwrap();
        let MutationAck::Entity(rec) = ack else { panic!("expected entity") };
        assert_eq!(rec.get_str("status"), Some("rejected"));
        assert_eq!(rec.get_str("status_reason"), Some("duplicate"));
    }
}
