//! Filter, search and pagination state for a list view.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Filter key reserved for the free-text search box.
pub const SEARCH_KEY: &str = "search";

/// A single filter constraint. `None` means "no constraint" and is never sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterValue {
    #[default]
    None,
    Text(String),
    /// Enum-like tag such as a status or category.
    Tag(String),
    Date(NaiveDate),
}

impl FilterValue {
    pub fn is_none(&self) -> bool {
        match self {
            FilterValue::None => true,
            FilterValue::Text(s) | FilterValue::Tag(s) => s.trim().is_empty(),
            FilterValue::Date(_) => false,
        }
    }

    /// Query-parameter rendering; `None` for unconstrained values.
    pub fn to_param(&self) -> Option<String> {
        if self.is_none() { return None; }
        match self {
            FilterValue::None => None,
            FilterValue::Text(s) | FilterValue::Tag(s) => Some(s.trim().to_string()),
            FilterValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Parse a `key=value` style CLI value: ISO dates become `Date`, the rest `Tag`.
    pub fn parse_loose(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") { return FilterValue::None; }
        match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => FilterValue::Date(d),
            Err(_) => FilterValue::Tag(raw.to_string()),
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_param() {
            Some(p) => f.write_str(&p),
            None => f.write_str("All"),
        }
    }
}

/// Whether a change to a field fetches immediately or after a quiet period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterTrigger {
    Debounced,
    Immediate,
}

/// Per-field fetch policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterField {
    pub key: String,
    pub trigger: FilterTrigger,
}

impl FilterField {
    pub fn search() -> Self { Self { key: SEARCH_KEY.to_string(), trigger: FilterTrigger::Debounced } }

    pub fn discrete(key: impl Into<String>) -> Self { Self { key: key.into(), trigger: FilterTrigger::Immediate } }

    pub fn debounced(key: impl Into<String>) -> Self { Self { key: key.into(), trigger: FilterTrigger::Debounced } }
}

/// Current filters, search text and page of one list view.
///
/// `page` is 1-based and reset to 1 whenever a filter or the search text
/// changes. Two states request the same data when their effective filters
/// (ignoring unconstrained entries), trimmed search, page and page size agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    pub filters: BTreeMap<String, FilterValue>,
    pub search: String,
    pub page: u32,
    pub page_size: u32,
}

impl Default for QueryState {
    fn default() -> Self { Self::new(20) }
}

impl QueryState {
    pub fn new(page_size: u32) -> Self {
        Self { filters: BTreeMap::new(), search: String::new(), page: 1, page_size: page_size.max(1) }
    }

    /// Filters that actually constrain the query, in key order.
    pub fn effective_filters(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.filters.iter().filter_map(|(k, v)| v.to_param().map(|p| (k.as_str(), p)))
    }

    pub fn effective_search(&self) -> Option<&str> {
        let s = self.search.trim();
        if s.is_empty() { None } else { Some(s) }
    }

    /// True when both states would issue an identical request.
    pub fn same_request(&self, other: &QueryState) -> bool {
        self.page == other.page && self.page_size == other.page_size && self.same_constraints(other)
    }

    /// Same effective filters and search text, regardless of page.
    pub fn same_constraints(&self, other: &QueryState) -> bool {
        self.effective_search() == other.effective_search()
            && self.effective_filters().eq(other.effective_filters())
    }

    /// Set (or clear with `FilterValue::None`) one filter. The search key is
    /// routed to the search text. Returns whether the constraints changed;
    /// only then is the page reset to 1.
    pub fn set_filter(&mut self, key: &str, value: FilterValue) -> bool {
        if key == SEARCH_KEY {
            let text = value.to_param().unwrap_or_default();
            return self.set_search(&text);
        }
        let before = self.clone();
        if value.is_none() {
            self.filters.remove(key);
        } else {
            self.filters.insert(key.to_string(), value);
        }
        self.reset_page_if_changed(&before)
    }

    pub fn set_search(&mut self, text: &str) -> bool {
        let before = self.clone();
        self.search = text.to_string();
        self.reset_page_if_changed(&before)
    }

    /// Reset every filter and the search text in a single update.
    pub fn clear_all(&mut self) -> bool {
        let before = self.clone();
        self.filters.clear();
        self.search.clear();
        self.reset_page_if_changed(&before)
    }

    fn reset_page_if_changed(&mut self, before: &QueryState) -> bool {
        if self.same_constraints(before) { return false; }
        self.page = 1;
        true
    }

    /// Clamp `n` into `1..=page_count` and move there. Returns whether the page changed.
    pub fn set_page(&mut self, n: u32, page_count: u32) -> bool {
        let target = n.clamp(1, page_count.max(1));
        if target == self.page { return false; }
        self.page = target;
        true
    }

    /// Zero-based offset of the first row on the current page.
    pub fn skip(&self) -> u64 { u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> FilterValue { FilterValue::Tag(s.to_string()) }

    #[test]
    fn filter_change_resets_page() {
        let mut q = QueryState::new(10);
        q.page = 4;
        assert!(q.set_filter("status", tag("active")));
        assert_eq!(q.page, 1);
    }

    #[test]
    fn setting_same_value_is_not_a_change() {
        let mut q = QueryState::new(10);
        assert!(q.set_filter("status", tag("active")));
        q.page = 3;
        assert!(!q.set_filter("status", tag("active")));
        assert_eq!(q.page, 3);
        // blank tag is the same as no constraint
        let mut r = QueryState::new(10);
        assert!(!r.set_filter("category", tag("  ")));
    }

    #[test]
    fn filters_are_independent() {
        let mut q = QueryState::new(10);
        q.set_filter("status", tag("active"));
        q.set_filter("category", tag("sports"));
        q.set_filter("status", FilterValue::None);
        let eff: Vec<_> = q.effective_filters().collect();
        assert_eq!(eff, vec![("category", "sports".to_string())]);
    }

    #[test]
    fn search_key_routes_to_search_text() {
        let mut q = QueryState::new(10);
        assert!(q.set_filter(SEARCH_KEY, FilterValue::Text("bob".into())));
        assert_eq!(q.effective_search(), Some("bob"));
        assert!(q.filters.is_empty());
    }

    #[test]
    fn clear_all_drops_everything_at_once() {
        let mut q = QueryState::new(10);
        q.set_filter("status", tag("active"));
        q.set_filter("category", tag("sports"));
        q.set_search("ann");
        assert!(q.clear_all());
        assert_eq!(q.effective_filters().count(), 0);
        assert_eq!(q.effective_search(), None);
        assert!(!q.clear_all());
    }

    #[test]
    fn set_page_clamps() {
        let mut q = QueryState::new(10);
        assert!(q.set_page(9, 3));
        assert_eq!(q.page, 3);
        assert!(!q.set_page(50, 3));
        assert!(q.set_page(0, 3));
        assert_eq!(q.page, 1);
        assert_eq!(q.skip(), 0);
    }

    #[test]
    fn parse_loose_detects_dates() {
        assert_eq!(
            FilterValue::parse_loose("2024-03-01"),
            FilterValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert_eq!(FilterValue::parse_loose("All"), FilterValue::None);
        assert_eq!(FilterValue::parse_loose("pending"), tag("pending"));
    }
}
