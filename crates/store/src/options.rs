//! Dropdown options loaded from a secondary collection (e.g. classes for an
//! enrollment filter). A failed load degrades to the lone "All" option.

#![forbid(unsafe_code)]

use huddle_api::{CollectionApi, ListRequest};
use huddle_core::resources::Pagination;
use huddle_core::{ApiError, Entity, FilterValue, QueryState};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOption {
    pub value: FilterValue,
    pub label: String,
}

impl FilterOption {
    pub fn all() -> Self { Self { value: FilterValue::None, label: "All".to_string() } }
}

#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub field: String,
    /// Always starts with "All".
    pub options: Vec<FilterOption>,
    pub error: Option<ApiError>,
}

impl FilterOptions {
    pub fn is_degraded(&self) -> bool { self.error.is_some() }
}

/// Load up to `limit` entities of a secondary resource as filter options.
pub async fn load_filter_options<E, F>(
    api: &dyn CollectionApi<E>,
    field: &str,
    pagination: Pagination,
    limit: u32,
    label_of: F,
) -> FilterOptions
where
    E: Entity,
    F: Fn(&E) -> String,
{
    let request = ListRequest::new(QueryState::new(limit.max(1)), pagination);
    let mut options = vec![FilterOption::all()];
    match api.list(&request).await {
        Ok(page) => {
            options.extend(page.items.iter().map(|e| FilterOption {
                value: FilterValue::Tag(e.id().to_string()),
                label: label_of(e),
            }));
            info!(field = %field, options = options.len() - 1, "filter options loaded");
            FilterOptions { field: field.to_string(), options, error: None }
        }
        Err(e) => {
            warn!(field = %field, error = %e, "filter options unavailable; showing All only");
            FilterOptions { field: field.to_string(), options, error: Some(e) }
        }
    }
}
