//! Built-in catalog of the managed resources and their list/transition endpoints.
//!
//! This module provides:
//! - REST path and pagination style per resource
//! - Filter fields with their fetch trigger (debounced vs immediate)
//! - Named status transitions and whether they need a reason

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::query::FilterField;

/// How a list endpoint expects pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pagination {
    /// `?skip=40&limit=20`
    SkipLimit,
    /// `?page=3&page_size=20`
    PagePageSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub name: String,
    /// Submit stays disabled until a non-empty reason is entered.
    pub requires_reason: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub key: String,
    pub label: String,
    pub path: String,
    pub pagination: Pagination,
    pub filters: Vec<FilterField>,
    pub transitions: Vec<TransitionSpec>,
}

impl ResourceSpec {
    pub fn new(key: &str, label: &str, path: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            path: path.to_string(),
            pagination: Pagination::SkipLimit,
            filters: vec![FilterField::search()],
            transitions: Vec::new(),
        }
    }

    pub fn paged(mut self) -> Self {
        self.pagination = Pagination::PagePageSize;
        self
    }

    pub fn filter(mut self, key: &str) -> Self {
        self.filters.push(FilterField::discrete(key));
        self
    }

    pub fn transition(mut self, name: &str, requires_reason: bool) -> Self {
        self.transitions.push(TransitionSpec { name: name.to_string(), requires_reason });
        self
    }

    pub fn filter_field(&self, key: &str) -> Option<&FilterField> {
        self.filters.iter().find(|f| f.key == key)
    }

    pub fn transition_spec(&self, name: &str) -> Option<&TransitionSpec> {
        self.transitions.iter().find(|t| t.name == name)
    }
}

/// All resources managed from the console.
pub fn builtin_resources() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new("badges", "Badges", "/badges").filter("category"),
        ResourceSpec::new("classes", "Classes", "/classes")
            .filter("program_id")
            .filter("area_id")
            .filter("status")
            .filter("start_date")
            .transition("activate", false)
            .transition("archive", false),
        ResourceSpec::new("clients", "Clients", "/clients").filter("status"),
        ResourceSpec::new("enrollments", "Enrollments", "/enrollments")
            .filter("class_id")
            .filter("status")
            .transition("activate", false)
            .transition("cancel", true),
        ResourceSpec::new("events", "Events", "/events")
            .filter("class_id")
            .filter("start_date")
            .filter("end_date"),
        ResourceSpec::new("users", "Users", "/users")
            .filter("role")
            .filter("is_active")
            .transition("activate", false)
            .transition("deactivate", false),
        ResourceSpec::new("waivers", "Waivers", "/waivers").filter("waiver_type").filter("is_active"),
        ResourceSpec::new("refunds", "Refunds", "/refunds")
            .paged()
            .filter("status")
            .transition("approve", false)
            .transition("reject", true),
        ResourceSpec::new("cancellations", "Cancellation requests", "/cancellation-requests")
            .paged()
            .filter("status")
            .transition("approve", false)
            .transition("reject", true),
        ResourceSpec::new("invoices", "Invoices", "/invoices")
            .filter("status")
            .filter("start_date")
            .filter("end_date")
            .transition("void", true),
        ResourceSpec::new("photos", "Photos", "/photos").filter("category_id"),
        ResourceSpec::new("announcements", "Announcements", "/announcements")
            .filter("type")
            .filter("is_active")
            .transition("publish", false)
            .transition("archive", false),
    ]
}

pub fn resource_for(key: &str) -> Option<ResourceSpec> {
    builtin_resources().into_iter().find(|r| r.key == key)
}
