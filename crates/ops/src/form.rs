#![forbid(unsafe_code)]

use huddle_core::resources::TransitionSpec;
use huddle_core::FieldError;
use serde::Serialize;
use serde_json::{Map, Value};

/// State of a create/edit modal. Values survive failed submissions; only a
/// successful one closes the form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormState<V> {
    pub values: V,
    pub open: bool,
    pub submitting: bool,
    /// Inline error shown above the fields.
    pub error: Option<String>,
    pub field_errors: Vec<FieldError>,
}

impl<V> FormState<V> {
    pub fn open(values: V) -> Self {
        Self { values, open: true, submitting: false, error: None, field_errors: Vec::new() }
    }

    /// Claim the form for a submission. False while one is already running
    /// or once the form was closed.
    pub fn begin_submit(&mut self) -> bool {
        if self.submitting || !self.open {
            return false;
        }
        self.submitting = true;
        self.error = None;
        self.field_errors.clear();
        true
    }

    pub(crate) fn succeed(&mut self) {
        self.submitting = false;
        self.open = false;
        self.error = None;
        self.field_errors.clear();
    }

    pub(crate) fn fail(&mut self, message: String, fields: Vec<FieldError>) {
        self.submitting = false;
        self.error = Some(message);
        self.field_errors = fields;
    }

    /// Release the submit flag without changing anything else.
    pub(crate) fn release(&mut self) { self.submitting = false; }

    pub fn close(&mut self) { self.open = false; }

    pub fn field_error(&self, field: &str) -> Option<&str> {
        self.field_errors.iter().find(|f| f.field == field).map(|f| f.message.as_str())
    }
}

/// Input for a named status transition such as `approve` or `cancel`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionForm {
    pub name: String,
    pub reason: String,
    /// Extra body fields sent along with the reason.
    pub extra: Option<Value>,
}

impl TransitionForm {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Self::default() } }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Submit stays disabled until a required reason is non-blank.
    pub fn can_submit(&self, spec: &TransitionSpec) -> bool {
        !spec.requires_reason || !self.reason.trim().is_empty()
    }

    /// Request body: `extra` with `reason` merged in, or `None` when both are empty.
    pub fn payload(&self) -> Option<Value> {
        let reason = self.reason.trim();
        let mut body = match &self.extra {
            Some(Value::Object(o)) => o.clone(),
            Some(other) if reason.is_empty() => return Some(other.clone()),
            _ => Map::new(),
        };
        if !reason.is_empty() {
            body.insert("reason".into(), Value::String(reason.to_string()));
        }
        if body.is_empty() { None } else { Some(Value::Object(body)) }
    }
}
