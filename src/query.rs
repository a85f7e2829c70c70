//! Filtered, sorted views over the inventory

use crate::proxy::{ProxyRecord, ProxyStatus, Scheme};
use std::cmp::Ordering;

/// Group criterion of a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GroupFilter {
    #[default]
    All,
    /// Records without a manual group
    Ungrouped,
    /// Manual group or smart-group membership by name
    Named(String),
}

impl GroupFilter {
    /// `all` and `none` are reserved, anything else is a group name
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" => Self::All,
            v if v.eq_ignore_ascii_case("all") => Self::All,
            v if v.eq_ignore_ascii_case("none") => Self::Ungrouped,
            v => Self::Named(v.to_string()),
        }
    }

    fn accepts(&self, record: &ProxyRecord) -> bool {
        match self {
            Self::All => true,
            Self::Ungrouped => record.manual_group.is_none(),
            Self::Named(name) => record.in_group(name),
        }
    }
}

/// Conjunctive filters; `None` means "All"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub status: Option<ProxyStatus>,
    pub scheme: Option<Scheme>,
    pub group: GroupFilter,
    /// Case-insensitive substring of name or host
    pub search: String,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ProxyStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn with_group(mut self, group: GroupFilter) -> Self {
        self.group = group;
        self
    }

    pub fn with_search(mut self, search: &str) -> Self {
        self.search = search.to_string();
        self
    }

    pub fn matches(&self, record: &ProxyRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.scheme.is_some_and(|s| s != record.scheme) {
            return false;
        }
        if !self.group.accepts(record) {
            return false;
        }

        let needle = self.search.trim().to_lowercase();
        needle.is_empty()
            || record.name.to_lowercase().contains(&needle)
            || record.host.to_lowercase().contains(&needle)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Name,
    Latency,
    Country,
    Score,
    LastTestedAt,
    Speed,
    Group,
}

/// Sort key and direction; `None` in a query keeps inventory order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    pub descending: bool,
}

impl SortSpec {
    pub fn ascending(key: SortKey) -> Self {
        Self { key, descending: false }
    }

    pub fn descending(key: SortKey) -> Self {
        Self { key, descending: true }
    }

    fn compare(&self, a: &ProxyRecord, b: &ProxyRecord) -> Ordering {
        let ordering = match self.key {
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::Latency => latency_rank(a).cmp(&latency_rank(b)),
            SortKey::Country => country_key(a).cmp(&country_key(b)),
            SortKey::Score => a.score.cmp(&b.score),
            SortKey::LastTestedAt => a.last_tested_at.cmp(&b.last_tested_at),
            SortKey::Speed => a.speed_kbps.cmp(&b.speed_kbps),
            SortKey::Group => group_key(a).cmp(&group_key(b)),
        };

        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Unmeasured latency ranks as +infinity
fn latency_rank(record: &ProxyRecord) -> i64 {
    record.latency().unwrap_or(i64::MAX)
}

fn country_key(record: &ProxyRecord) -> String {
    record
        .country_name
        .as_deref()
        .or(record.country_code.as_deref())
        .unwrap_or("")
        .to_lowercase()
}

fn group_key(record: &ProxyRecord) -> String {
    record.manual_group.as_deref().unwrap_or("").to_lowercase()
}

/// Filter and order records; ties keep their input order
pub fn query<'a>(
    records: &'a [ProxyRecord],
    filter: &QueryFilter,
    sort: Option<SortSpec>,
) -> Vec<&'a ProxyRecord> {
    let mut view: Vec<&ProxyRecord> = records.iter().filter(|r| filter.matches(r)).collect();
    if let Some(sort) = sort {
        view.sort_by(|a, b| sort.compare(a, b));
    }
    view
}
