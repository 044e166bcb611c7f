use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which logical view of the collection a store handle serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoughtFilter {
    #[default]
    Unfiltered,
    OnlyBought,
    OnlyUnbought,
}

impl BoughtFilter {
    /// The `bought` value documents must carry to be visible, if any.
    pub fn bound_value(self) -> Option<bool> {
        match self {
            BoughtFilter::Unfiltered => None,
            BoughtFilter::OnlyBought => Some(true),
            BoughtFilter::OnlyUnbought => Some(false),
        }
    }

    pub fn admits(self, bought: bool) -> bool {
        self.bound_value().map_or(true, |v| v == bought)
    }

    /// Route label used by the list views: `to-buy`, `bought`, `all`.
    pub fn label(self) -> &'static str {
        match self {
            BoughtFilter::Unfiltered => "all",
            BoughtFilter::OnlyBought => "bought",
            BoughtFilter::OnlyUnbought => "to-buy",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "all" => Some(BoughtFilter::Unfiltered),
            "bought" => Some(BoughtFilter::OnlyBought),
            "to-buy" | "tobuy" => Some(BoughtFilter::OnlyUnbought),
            _ => None,
        }
    }
}

impl fmt::Display for BoughtFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sort direction for the requested sort field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Request descriptor for a paginated, optionally sorted and searched list.
///
/// `start`/`end` describe a zero-based row window. `start == 0` means no
/// offset and `end == 0` means no limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationQuery {
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub end: u64,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub search: Option<String>,
    /// Put bought rows after unbought ones, ahead of any other sort key.
    #[serde(default)]
    pub bought_last: bool,
}

impl PaginationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, start: u64, end: u64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some(field.into());
        self.order = order;
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn bought_last(mut self, bought_last: bool) -> Self {
        self.bought_last = bought_last;
        self
    }

    /// Search text with surrounding whitespace removed; blank counts as absent.
    pub fn search_text(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Sort field, ignoring blank values.
    pub fn sort_field(&self) -> Option<&str> {
        self.sort
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_bound_values() {
        assert_eq!(BoughtFilter::Unfiltered.bound_value(), None);
        assert_eq!(BoughtFilter::OnlyBought.bound_value(), Some(true));
        assert_eq!(BoughtFilter::OnlyUnbought.bound_value(), Some(false));

        assert!(BoughtFilter::Unfiltered.admits(true));
        assert!(BoughtFilter::OnlyUnbought.admits(false));
        assert!(!BoughtFilter::OnlyUnbought.admits(true));
    }

    #[test]
    fn filter_labels() {
        for filter in [
            BoughtFilter::Unfiltered,
            BoughtFilter::OnlyBought,
            BoughtFilter::OnlyUnbought,
        ] {
            assert_eq!(BoughtFilter::from_label(filter.label()), Some(filter));
        }
        assert_eq!(BoughtFilter::from_label("nope"), None);
    }

    #[test]
    fn sort_order_parsing() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert_eq!("".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    #[test]
    fn blank_search_is_absent() {
        assert_eq!(PaginationQuery::new().search("   ").search_text(), None);
        assert_eq!(
            PaginationQuery::new().search("  milk ").search_text(),
            Some("milk")
        );
        assert_eq!(PaginationQuery::new().search_text(), None);
    }

    #[test]
    fn query_deserializes_with_defaults() {
        let q: PaginationQuery =
            serde_json::from_str(r#"{"start":2,"end":5,"order":"DESC"}"#).unwrap();
        assert_eq!(q.start, 2);
        assert_eq!(q.end, 5);
        assert_eq!(q.order, SortOrder::Desc);
        assert!(q.sort.is_none());
        assert!(!q.bought_last);
    }
}
