//! Owned store of proxy records
//!
//! Records are only ever updated in place by id, so edits from different
//! callers (the test scheduler, manual group assignment) never overwrite
//! each other.

use crate::proxy::{LinkCodec, ProxyRecord, RecordId};
use crate::rules::{classify, SmartGroup};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Inventory shared between the scheduler and its consumers
pub type SharedInventory = Arc<RwLock<Inventory>>;

/// Outcome of importing a batch of connection strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Ids of the records created, in input order
    pub added: Vec<RecordId>,
    /// Lines whose raw string was already present
    pub duplicates: usize,
    /// Blank lines
    pub skipped: usize,
}

/// `key: value` line placed before exported links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHeader {
    pub key: String,
    pub value: String,
}

impl ExportHeader {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn profile_title(title: &str) -> Self {
        Self::new("profile-title", title)
    }

    pub fn profile_update_interval(hours: u32) -> Self {
        Self::new("profile-update-interval", &hours.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    records: Vec<ProxyRecord>,
    raw_index: HashSet<String>,
    /// Position of each record in `records`
    id_index: HashMap<RecordId, usize>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the inventory for sharing with a scheduler
    pub fn into_shared(self) -> SharedInventory {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order
    pub fn records(&self) -> &[ProxyRecord] {
        &self.records
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    pub fn get(&self, id: RecordId) -> Option<&ProxyRecord> {
        self.id_index.get(&id).map(|&i| &self.records[i])
    }

    pub fn contains_raw(&self, raw: &str) -> bool {
        self.raw_index.contains(raw.trim())
    }

    /// Insert a record unless its raw string is already present
    ///
    /// The raw string is stored trimmed, the same form `contains_raw` checks.
    pub fn insert(&mut self, mut record: ProxyRecord) -> Option<RecordId> {
        let trimmed = record.raw.trim();
        if trimmed.len() != record.raw.len() {
            record.raw = trimmed.to_string();
        }
        if record.raw.is_empty() || self.id_index.contains_key(&record.id) {
            return None;
        }
        if !self.raw_index.insert(record.raw.clone()) {
            return None;
        }
        let id = record.id;
        self.id_index.insert(id, self.records.len());
        self.records.push(record);
        Some(id)
    }

    /// Decode and insert a single connection string
    pub fn add_link(&mut self, raw: &str) -> Option<RecordId> {
        let raw = raw.trim();
        if raw.is_empty() || self.contains_raw(raw) {
            return None;
        }
        self.insert(LinkCodec::to_record(raw))
    }

    /// Decode and insert a batch, dropping exact duplicates
    pub fn import<I, S>(&mut self, links: I) -> ImportSummary
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = ImportSummary::default();
        for link in links {
            let raw = link.as_ref().trim();
            if raw.is_empty() {
                summary.skipped += 1;
                continue;
            }
            match self.add_link(raw) {
                Some(id) => summary.added.push(id),
                None => summary.duplicates += 1,
            }
        }
        summary
    }

    /// Apply an edit to one record; returns false when the id is gone
    pub fn update<F>(&mut self, id: RecordId, edit: F) -> bool
    where
        F: FnOnce(&mut ProxyRecord),
    {
        match self.id_index.get(&id) {
            Some(&i) => {
                edit(&mut self.records[i]);
                true
            }
            None => false,
        }
    }

    /// Apply an edit to every listed record in one pass; returns how many existed
    pub fn update_many<F>(&mut self, ids: &HashSet<RecordId>, mut edit: F) -> usize
    where
        F: FnMut(&mut ProxyRecord),
    {
        let mut touched = 0;
        for record in self.records.iter_mut().filter(|r| ids.contains(&r.id)) {
            edit(record);
            touched += 1;
        }
        touched
    }

    pub fn set_manual_group(&mut self, id: RecordId, group: Option<String>) -> bool {
        let group = group.map(|g| g.trim().to_string()).filter(|g| !g.is_empty());
        self.update(id, |record| record.manual_group = group)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<ProxyRecord> {
        let index = self.id_index.remove(&id)?;
        let record = self.records.remove(index);
        self.raw_index.remove(&record.raw);
        self.reindex_from(index);
        Some(record)
    }

    /// Remove every listed record, returning how many existed
    pub fn remove_many(&mut self, ids: &[RecordId]) -> usize {
        let ids: HashSet<&RecordId> = ids.iter().collect();
        let before = self.records.len();
        let raw_index = &mut self.raw_index;
        self.records.retain(|record| {
            let keep = !ids.contains(&record.id);
            if !keep {
                raw_index.remove(&record.raw);
            }
            keep
        });
        self.id_index.clear();
        self.reindex_from(0);
        before - self.records.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.raw_index.clear();
        self.id_index.clear();
    }

    fn reindex_from(&mut self, start: usize) {
        for (i, record) in self.records.iter().enumerate().skip(start) {
            self.id_index.insert(record.id, i);
        }
    }

    /// Recompute smart-group membership for every record
    pub fn classify(&mut self, groups: &[SmartGroup]) {
        classify(&mut self.records, groups);
    }

    /// Export raw strings, newline-joined, after optional `#key: value` headers
    ///
    /// With `ids` set, only those records are exported, in inventory order.
    pub fn export(&self, ids: Option<&[RecordId]>, headers: &[ExportHeader]) -> String {
        let selected: Option<HashSet<&RecordId>> = ids.map(|ids| ids.iter().collect());

        let header_lines = headers.iter().map(|h| format!("#{}: {}", h.key, h.value));
        let link_lines = self
            .records
            .iter()
            .filter(|r| selected.as_ref().map_or(true, |s| s.contains(&r.id)))
            .map(|r| r.raw.clone());

        header_lines.chain(link_lines).collect::<Vec<_>>().join("\n")
    }
}
