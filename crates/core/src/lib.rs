//! Huddle core types: entities, collection pages, request tokens, pending mutations.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod query;
pub mod resources;

pub use error::{ApiError, ApiResult, FieldError};
pub use query::{FilterField, FilterTrigger, FilterValue, QueryState, SEARCH_KEY};

/// Opaque resource identifier. Numeric server ids are kept in their decimal form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Read an id out of a JSON scalar (`7` and `"7"` are the same id).
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self { Self(n.to_string()) }
}

/// A single resource record shown in a list view.
///
/// The controller never looks inside an entity beyond its id and a
/// human-readable description used by destructive confirmations.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> EntityId;
    fn describe(&self) -> String;
}

/// Dynamic entity backed by a JSON object, for resources without a typed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub serde_json::Value);

const LABEL_FIELDS: [&str; 5] = ["name", "title", "full_name", "email", "code"];

impl Record {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> { self.0.get(key) }

    pub fn get_str(&self, key: &str) -> Option<&str> { self.0.get(key).and_then(|v| v.as_str()) }
}

impl Entity for Record {
    fn id(&self) -> EntityId {
        self.0.get("id").and_then(EntityId::from_json).unwrap_or_else(|| EntityId::new(""))
    }

    fn describe(&self) -> String {
        let id = self.id();
        for key in LABEL_FIELDS {
            if let Some(label) = self.get_str(key).filter(|s| !s.trim().is_empty()) {
                return format!("{} (#{})", label.trim(), id);
            }
        }
        format!("#{}", id)
    }
}

/// Marker stamped on each list fetch. Only the latest token may update displayed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

impl RequestToken {
    pub fn next(self) -> Self { Self(self.0.saturating_add(1)) }
}

/// Materialized page of entities plus the total matching count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult<E> {
    pub items: Vec<E>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<E> CollectionResult<E> {
    pub fn empty(page_size: u32) -> Self {
        Self { items: Vec::new(), total: 0, page: 1, page_size: page_size.max(1) }
    }

    /// Number of pages for `total` (at least one, so page 1 is always valid).
    pub fn page_count(&self) -> u32 { page_count(self.total, self.page_size) }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// `max(1, ceil(total / page_size))`.
pub fn page_count(total: u64, page_size: u32) -> u32 {
    let size = u64::from(page_size.max(1));
    let pages = total.div_ceil(size).max(1);
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Kind of write a user confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    /// Named status transition, e.g. `approve`, `cancel`.
    Transition(String),
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => f.write_str("create"),
            MutationKind::Update => f.write_str("update"),
            MutationKind::Delete => f.write_str("delete"),
            MutationKind::Transition(name) => write!(f, "transition:{}", name),
        }
    }
}

/// A write between user confirmation and server resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub kind: MutationKind,
    pub target: Option<EntityId>,
    pub payload: Option<serde_json::Value>,
    /// Fields a view may overlay on the target row until the refresh lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_patch: Option<serde_json::Value>,
}

impl PendingMutation {
    pub fn create(payload: serde_json::Value) -> Self {
        Self { kind: MutationKind::Create, target: None, payload: Some(payload), local_patch: None }
    }

    pub fn update(id: EntityId, payload: serde_json::Value) -> Self {
        Self { kind: MutationKind::Update, target: Some(id), payload: Some(payload), local_patch: None }
    }

    pub fn delete(id: EntityId) -> Self {
        Self { kind: MutationKind::Delete, target: Some(id), payload: None, local_patch: None }
    }

    pub fn transition(id: EntityId, name: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self { kind: MutationKind::Transition(name.into()), target: Some(id), payload, local_patch: None }
    }

    pub fn with_local_patch(mut self, patch: serde_json::Value) -> Self {
        self.local_patch = Some(patch);
        self
    }

    /// Key used by the in-flight guard: the target id, or `None` for creates.
    pub fn guard_key(&self) -> Option<&EntityId> { self.target.as_ref() }
}

pub mod prelude {
    pub use super::{
        ApiError, ApiResult, CollectionResult, Entity, EntityId, FilterField, FilterTrigger,
        FilterValue, MutationKind, PendingMutation, QueryState, Record, RequestToken,
    };
}
