//! Huddle Ops: create/update/delete/transition flows over a collection.
//!
//! Every write is gated by an in-flight guard keyed by the target id, ends
//! with a list refresh on success, and reports through the `Notifier`. The
//! coordinator never patches the list itself; the refreshed page is the only
//! source of truth after a write.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use huddle_api::{CollectionApi, MutationAck};
use huddle_core::resources::ResourceSpec;
use huddle_core::{ApiError, ApiResult, Entity, EntityId, MutationKind, PendingMutation};
use huddle_store::Refresh;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

mod form;
mod notify;

pub use form::{FormState, TransitionForm};
pub use notify::{Notifier, Toast, ToastKind};

/// How a mutation attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<E> {
    /// Server accepted the write and the list was refreshed.
    Done(MutationAck<E>),
    /// Target no longer exists; the list was refreshed silently.
    AlreadyGone,
    /// Server rejected the write or it never reached the server.
    Failed(ApiError),
    /// Rejected client-side before any call, e.g. a missing reason.
    Invalid(String),
    /// Another mutation on the same target (or form) is still running.
    Ignored,
}

impl<E> MutationOutcome<E> {
    pub fn is_done(&self) -> bool { matches!(self, MutationOutcome::Done(_)) }
}

type Inflight = Arc<Mutex<FxHashMap<EntityId, PendingMutation>>>;

/// Removes the guard entry when the mutation resolves, whichever way.
struct Claim {
    map: Inflight,
    id: EntityId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
    }
}

pub struct MutationCoordinator<E: Entity> {
    api: Arc<dyn CollectionApi<E>>,
    list: Arc<dyn Refresh>,
    notifier: Notifier,
    resource: ResourceSpec,
    inflight: Inflight,
}

impl<E: Entity> MutationCoordinator<E> {
    pub fn new(api: Arc<dyn CollectionApi<E>>, list: Arc<dyn Refresh>, notifier: Notifier, resource: ResourceSpec) -> Self {
        Self { api, list, notifier, resource, inflight: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    pub fn notifier(&self) -> &Notifier { &self.notifier }

    pub fn resource(&self) -> &ResourceSpec { &self.resource }

    /// Whether a row's actions should render disabled.
    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    /// Mutations currently awaiting the server, for row overlays.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    fn claim(&self, m: &PendingMutation) -> Option<Claim> {
        let id = m.guard_key()?.clone();
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&id) {
            debug!(resource = %self.resource.key, id = %id, kind = %m.kind, "mutation ignored: target busy");
            return None;
        }
        map.insert(id.clone(), m.clone());
        Some(Claim { map: Arc::clone(&self.inflight), id })
    }

    async fn execute(&self, m: &PendingMutation) -> ApiResult<MutationAck<E>> {
        let kind = m.kind.to_string();
        counter!("mutation_total", 1u64, "resource" => self.resource.key.clone(), "kind" => kind.clone());
        let t0 = Instant::now();
        let target = m.target.clone().unwrap_or_default();
        let res = match &m.kind {
            MutationKind::Create => self.api.create(m.payload.clone().unwrap_or(Value::Null)).await,
            MutationKind::Update => self.api.update(&target, m.payload.clone().unwrap_or(Value::Null)).await,
            MutationKind::Delete => self.api.delete(&target).await,
            MutationKind::Transition(name) => self.api.transition(&target, name, m.payload.clone()).await,
        };
        histogram!("mutation_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.clone());
        match &res {
            Ok(_) => info!(resource = %self.resource.key, kind = %kind, id = %target, took_ms = %t0.elapsed().as_millis(), "mutation ok"),
            Err(e) => {
                counter!("mutation_failed_total", 1u64, "resource" => self.resource.key.clone(), "kind" => kind.clone(), "error" => error_kind(e));
                warn!(resource = %self.resource.key, kind = %kind, id = %target, error = %e, "mutation failed");
            }
        }
        res
    }

    async fn succeeded(&self, ack: &MutationAck<E>, verb: &str) {
        self.list.refresh().await;
        let text = match ack {
            MutationAck::Entity(e) => format!("{} {}", e.describe(), verb),
            MutationAck::Message(Some(m)) if !m.trim().is_empty() => m.clone(),
            MutationAck::Message(_) => format!("{} successfully", capitalize(verb)),
        };
        self.notifier.success(text);
    }

    async fn gone(&self, id: &EntityId) -> MutationOutcome<E> {
        debug!(resource = %self.resource.key, id = %id, "target already gone; refreshing");
        self.list.refresh().await;
        MutationOutcome::AlreadyGone
    }

    /// Submit a create form. On failure the form stays open with its values.
    pub async fn create(&self, form: &mut FormState<Value>) -> MutationOutcome<E> {
        if !form.begin_submit() {
            return MutationOutcome::Ignored;
        }
        let m = PendingMutation::create(form.values.clone());
        match self.execute(&m).await {
            Ok(ack) => {
                form.succeed();
                self.succeeded(&ack, "created").await;
                MutationOutcome::Done(ack)
            }
            Err(e) => self.form_failed(form, e, "create the record"),
        }
    }

    /// Submit an edit form for `id`.
    pub async fn update(&self, id: &EntityId, form: &mut FormState<Value>) -> MutationOutcome<E> {
        let m = PendingMutation::update(id.clone(), form.values.clone()).with_local_patch(form.values.clone());
        let Some(_claim) = self.claim(&m) else { return MutationOutcome::Ignored };
        if !form.begin_submit() {
            return MutationOutcome::Ignored;
        }
        match self.execute(&m).await {
            Ok(ack) => {
                form.succeed();
                self.succeeded(&ack, "updated").await;
                MutationOutcome::Done(ack)
            }
            Err(ApiError::NotFound(_)) => {
                form.close();
                form.release();
                self.gone(id).await
            }
            Err(e) => self.form_failed(form, e, &format!("update record #{}", id)),
        }
    }

    fn form_failed<V>(&self, form: &mut FormState<V>, e: ApiError, action: &str) -> MutationOutcome<E> {
        let message = e.user_message(action);
        form.fail(message.clone(), e.field_errors().to_vec());
        self.notifier.error(message);
        MutationOutcome::Failed(e)
    }

    /// First step of a delete. Nothing is sent until the returned
    /// confirmation is consumed with `confirm`.
    pub fn request_delete(&self, entity: &E) -> DeleteConfirmation<'_, E> {
        DeleteConfirmation { coordinator: self, id: entity.id(), description: entity.describe() }
    }

    async fn delete_confirmed(&self, id: &EntityId, description: &str) -> MutationOutcome<E> {
        let m = PendingMutation::delete(id.clone());
        let Some(_claim) = self.claim(&m) else { return MutationOutcome::Ignored };
        match self.execute(&m).await {
            Ok(ack) => {
                self.succeeded(&ack, "deleted").await;
                MutationOutcome::Done(ack)
            }
            Err(ApiError::NotFound(_)) => self.gone(id).await,
            Err(e) => {
                self.notifier.error(e.user_message(&format!("delete {}", description)));
                MutationOutcome::Failed(e)
            }
        }
    }

    /// Run the transition held by a modal form, with the same success and
    /// failure handling as `update`. A transition that needs a reason is
    /// refused locally until one is given; the form stays open with the error.
    pub async fn transition(&self, id: &EntityId, form: &mut FormState<TransitionForm>) -> MutationOutcome<E> {
        let name = form.values.name.clone();
        let Some(spec) = self.resource.transition_spec(&name) else {
            let message = format!("{} cannot be {}", self.resource.label, past_tense(&name));
            form.fail(message.clone(), Vec::new());
            return MutationOutcome::Invalid(message);
        };
        if !form.values.can_submit(spec) {
            let message = format!("A reason is required to {}.", name);
            form.fail(message.clone(), Vec::new());
            return MutationOutcome::Invalid(message);
        }
        let m = PendingMutation::transition(id.clone(), name.clone(), form.values.payload());
        let Some(_claim) = self.claim(&m) else { return MutationOutcome::Ignored };
        if !form.begin_submit() {
            return MutationOutcome::Ignored;
        }
        match self.execute(&m).await {
            Ok(ack) => {
                form.succeed();
                self.succeeded(&ack, &past_tense(&name)).await;
                MutationOutcome::Done(ack)
            }
            Err(ApiError::NotFound(_)) => {
                form.close();
                form.release();
                self.gone(id).await
            }
            Err(e) => self.form_failed(form, e, &format!("{} record #{}", name, id)),
        }
    }
}

/// Pending delete awaiting the user's explicit answer.
#[must_use = "a delete only happens once the confirmation is confirmed"]
pub struct DeleteConfirmation<'a, E: Entity> {
    coordinator: &'a MutationCoordinator<E>,
    id: EntityId,
    description: String,
}

impl<'a, E: Entity> DeleteConfirmation<'a, E> {
    pub fn target(&self) -> &EntityId { &self.id }

    pub fn description(&self) -> &str { &self.description }

    /// Dialog text naming the target.
    pub fn prompt(&self) -> String { format!("Delete {}? This cannot be undone.", self.description) }

    pub async fn confirm(self) -> MutationOutcome<E> {
        self.coordinator.delete_confirmed(&self.id, &self.description).await
    }

    pub fn cancel(self) {
        debug!(id = %self.id, "delete cancelled");
    }
}

fn error_kind(e: &ApiError) -> &'static str {
    match e {
        ApiError::Transport(_) => "transport",
        ApiError::Validation { .. } => "validation",
        ApiError::Conflict(_) => "conflict",
        ApiError::NotFound(_) => "not_found",
        ApiError::Unauthorized(_) => "unauthorized",
        ApiError::Server { .. } => "server",
        ApiError::Decode(_) => "decode",
    }
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        Some(first) => first.to_uppercase().chain(c).collect(),
        None => String::new(),
    }
}

fn past_tense(verb: &str) -> String {
    match verb {
        "void" => "voided".to_string(),
        "cancel" => "cancelled".to_string(),
        v if v.ends_with('e') => format!("{v}d"),
        v => format!("{v}ed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_api::{MockCall, MockCollection, MockOp};
    use huddle_core::resources::resource_for;
    use huddle_core::Record;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRefresh(AtomicUsize);

    #[async_trait::async_trait]
    impl Refresh for CountingRefresh {
        async fn refresh(&self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    fn setup(key: &str, rows: Vec<Value>) -> (Arc<MockCollection<Record>>, Arc<CountingRefresh>, MutationCoordinator<Record>) {
        let mock = Arc::new(MockCollection::with_rows(rows));
        let refresh = Arc::new(CountingRefresh::default());
        let c = MutationCoordinator::new(mock.clone(), refresh.clone(), Notifier::new(8), resource_for(key).unwrap());
        (mock, refresh, c)
    }

    #[tokio::test]
    async fn create_success_refreshes_and_closes_form() {
        let (mock, refresh, c) = setup("classes", vec![]);
        let mut form = FormState::open(json!({"name": "U8 Soccer", "id": 999}));
        let out = c.create(&mut form).await;
        assert!(out.is_done());
        assert!(!form.open);
        assert_eq!(refresh.0.load(Ordering::SeqCst), 1);
        let toast = c.notifier().last().unwrap();
        assert_eq!(toast.kind, ToastKind::Success);
        assert_eq!(toast.text, "U8 Soccer (#1) created");
        assert_eq!(mock.rows()[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn create_validation_failure_keeps_values_and_field_errors() {
        let (mock, refresh, c) = setup("classes", vec![]);
        mock.fail_next(
            MockOp::Create,
            ApiError::Validation {
                message: String::new(),
                fields: vec![huddle_core::FieldError { field: "name".into(), message: "field required".into() }],
            },
        );
        let mut form = FormState::open(json!({"capacity": 12}));
        let out = c.create(&mut form).await;
        assert!(matches!(out, MutationOutcome::Failed(ApiError::Validation { .. })));
        assert!(form.open);
        assert!(!form.submitting);
        assert_eq!(form.values, json!({"capacity": 12}));
        assert_eq!(form.field_error("name"), Some("field required"));
        assert_eq!(form.error.as_deref(), Some("Please correct the highlighted fields."));
        assert_eq!(refresh.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_not_found_is_silent_refresh() {
        let (_mock, refresh, c) = setup("classes", vec![]);
        let mut form = FormState::open(json!({"name": "x"}));
        let out = c.update(&EntityId::from(41u64), &mut form).await;
        assert_eq!(out, MutationOutcome::AlreadyGone);
        assert_eq!(refresh.0.load(Ordering::SeqCst), 1);
        assert!(c.notifier().recent().is_empty());
        assert!(!c.is_pending(&EntityId::from(41u64)));
    }

    #[tokio::test]
    async fn delete_conflict_surfaces_server_text_verbatim() {
        let (mock, refresh, c) = setup("classes", vec![json!({"name": "Spring Soccer"})]);
        mock.fail_next(MockOp::Delete, ApiError::Conflict("Cannot delete: active references".into()));
        let row = Record(mock.rows()[0].clone());
        let confirm = c.request_delete(&row);
        assert_eq!(confirm.prompt(), "Delete Spring Soccer (#1)? This cannot be undone.");
        assert!(mock.calls().is_empty(), "nothing is sent before confirmation");
        let out = confirm.confirm().await;
        assert!(matches!(out, MutationOutcome::Failed(ApiError::Conflict(_))));
        assert_eq!(c.notifier().last().unwrap().text, "Cannot delete: active references");
        assert_eq!(mock.rows().len(), 1);
        assert_eq!(refresh.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_generic_failure_message() {
        let (mock, _refresh, c) = setup("classes", vec![json!({"name": "Spring Soccer"})]);
        mock.fail_next(MockOp::Delete, ApiError::Conflict(String::new()));
        let row = Record(mock.rows()[0].clone());
        c.request_delete(&row).confirm().await;
        assert_eq!(c.notifier().last().unwrap().text, "Failed to delete Spring Soccer (#1).");
    }

    #[tokio::test]
    async fn cancelled_delete_sends_nothing() {
        let (mock, _refresh, c) = setup("classes", vec![json!({"name": "Spring Soccer"})]);
        let row = Record(mock.rows()[0].clone());
        c.request_delete(&row).cancel();
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn transition_requires_reason_before_any_call() {
        let (mock, _refresh, c) = setup("refunds", vec![json!({"amount": 10, "status": "pending"})]);
        let id = EntityId::from(1u64);
        let mut form = FormState::open(TransitionForm::new("reject"));
        let out = c.transition(&id, &mut form).await;
        assert_eq!(out, MutationOutcome::Invalid("A reason is required to reject.".into()));
        assert!(form.open);
        assert_eq!(form.error.as_deref(), Some("A reason is required to reject."));
        assert!(mock.calls().is_empty());

        form.values.reason = "duplicate charge".into();
        let out = c.transition(&id, &mut form).await;
        assert!(out.is_done());
        assert!(!form.open);
        assert_eq!(
            mock.calls(),
            vec![MockCall::Transition(id.clone(), "reject".into(), Some(json!({"reason": "duplicate charge"})))]
        );
        assert_eq!(mock.rows()[0]["status"], json!("rejected"));
    }

    #[tokio::test]
    async fn unknown_transition_is_invalid() {
        let (mock, _refresh, c) = setup("badges", vec![json!({"name": "Gold"})]);
        let mut form = FormState::open(TransitionForm::new("approve"));
        let out = c.transition(&EntityId::from(1u64), &mut form).await;
        assert!(matches!(out, MutationOutcome::Invalid(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_asks_to_sign_in() {
        let (mock, _refresh, c) = setup("classes", vec![json!({"name": "A"})]);
        mock.fail_next(MockOp::Update, ApiError::Unauthorized("token expired".into()));
        let mut form = FormState::open(json!({"name": "B"}));
        c.update(&EntityId::from(1u64), &mut form).await;
        assert_eq!(form.error.as_deref(), Some("Your session has expired. Please sign in again."));
    }

    #[tokio::test]
    async fn failed_transition_keeps_modal_open_with_inline_error() {
        let (mock, refresh, c) = setup("refunds", vec![json!({"amount": 10, "status": "pending"})]);
        mock.fail_next(MockOp::Transition, ApiError::Conflict("Refund already processed".into()));
        let mut form = FormState::open(TransitionForm::new("approve"));
        let out = c.transition(&EntityId::from(1u64), &mut form).await;
        assert!(matches!(out, MutationOutcome::Failed(ApiError::Conflict(_))));
        assert!(form.open);
        assert!(!form.submitting);
        assert_eq!(form.error.as_deref(), Some("Refund already processed"));
        assert_eq!(form.values.name, "approve");
        assert_eq!(c.notifier().last().unwrap().kind, ToastKind::Error);
        assert_eq!(refresh.0.load(Ordering::SeqCst), 0);
        assert_eq!(mock.rows()[0]["status"], json!("pending"));
    }

    #[tokio::test]
    async fn transition_on_vanished_row_closes_form_and_refreshes() {
        let (_mock, refresh, c) = setup("refunds", vec![]);
        let mut form = FormState::open(TransitionForm::new("reject").with_reason("duplicate"));
        let out = c.transition(&EntityId::from(9u64), &mut form).await;
        assert_eq!(out, MutationOutcome::AlreadyGone);
        assert!(!form.open);
        assert!(!form.submitting);
        assert!(form.error.is_none());
        assert_eq!(refresh.0.load(Ordering::SeqCst), 1);
        assert!(c.notifier().recent().is_empty());
    }

    #[test]
    fn past_tense_of_transitions() {
        assert_eq!(past_tense("approve"), "approved");
        assert_eq!(past_tense("reject"), "rejected");
        assert_eq!(past_tense("cancel"), "cancelled");
        assert_eq!(past_tense("void"), "voided");
        assert_eq!(past_tense("publish"), "published");
    }
}
