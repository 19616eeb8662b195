//! Deduplicated, insertion-ordered collection of proxy records

use crate::error::ProxyError;
use crate::proxy::models::{Anonymity, Protocol, ProxyRecord, StoredRecord};
use crate::proxy::storage::ProxyStorage;
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Working set of proxies
///
/// Records are unique by `(ip, port, protocols)`. The first record seen for an
/// identity wins; later duplicates are dropped. The store never removes records.
#[derive(Debug, Clone, Default)]
pub struct ProxyStore {
    records: Vec<ProxyRecord>,
}

impl ProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from candidates, dropping duplicates
    pub fn from_records(records: impl IntoIterator<Item = ProxyRecord>) -> Self {
        let mut store = Self::new();
        store.extend(records);
        store
    }

    /// Append a record unless one with the same identity is already present.
    ///
    /// Returns whether the record was added.
    pub fn add(&mut self, record: ProxyRecord) -> bool {
        if self.contains(&record) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Add every record, returning how many were new
    pub fn extend(&mut self, records: impl IntoIterator<Item = ProxyRecord>) -> usize {
        records
            .into_iter()
            .map(|record| self.add(record))
            .filter(|added| *added)
            .count()
    }

    pub fn contains(&self, record: &ProxyRecord) -> bool {
        self.records.iter().any(|r| r.same_identity(record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProxyRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProxyRecord> {
        self.records.iter_mut()
    }

    /// Pull every persisted record from the storage backend.
    ///
    /// In-memory records win over persisted duplicates. Entries that no longer
    /// form a valid record are skipped. Returns how many records were new.
    pub async fn load_from_storage(&mut self, storage: &dyn ProxyStorage) -> Result<usize, ProxyError> {
        info!("Load proxies from storage...");
        let stored = storage.list_all().await?;
        let total = stored.len();

        let mut added = 0;
        for entry in stored {
            let endpoint = format!("{}:{}", entry.ip, entry.port);
            match ProxyRecord::try_from(entry) {
                Ok(record) => {
                    if self.add(record) {
                        added += 1;
                    }
                }
                Err(e) => warn!("Skip stored proxy {}: {}", endpoint, e),
            }
        }

        info!("Loaded {} of {} stored proxies", added, total);
        Ok(added)
    }

    /// Select records by anonymity level and protocol.
    ///
    /// Within a dimension any listed value matches; both dimensions must match
    /// when both are given. `None` or an empty slice means no constraint.
    pub fn filter(
        &self,
        anonymity: Option<&[Anonymity]>,
        protocols: Option<&[Protocol]>,
    ) -> Vec<&ProxyRecord> {
        let anonymity = anonymity.filter(|levels| !levels.is_empty());
        let protocols = protocols.filter(|protocols| !protocols.is_empty());

        self.records
            .iter()
            .filter(|record| anonymity.map_or(true, |levels| levels.contains(&record.anonymity())))
            .filter(|record| {
                protocols.map_or(true, |wanted| {
                    record.protocols().iter().any(|p| wanted.contains(p))
                })
            })
            .collect()
    }

    /// Same as [`ProxyStore::filter`], taking protocol names as typed by a user
    pub fn filter_by_names<S: AsRef<str>>(
        &self,
        anonymity: Option<&[Anonymity]>,
        protocols: Option<&[S]>,
    ) -> Result<Vec<&ProxyRecord>, ProxyError> {
        let protocols = protocols
            .map(|names| {
                names
                    .iter()
                    .map(|name| name.as_ref().parse())
                    .collect::<Result<Vec<Protocol>, _>>()
            })
            .transpose()?;
        Ok(self.filter(anonymity, protocols.as_deref()))
    }

    /// Write currently valid records to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, ProxyError> {
        let valid: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|record| record.is_valid())
            .map(ProxyRecord::to_stored)
            .collect();

        fs::write(path, serde_json::to_string(&valid)?)?;
        Ok(valid.len())
    }

    /// Add records from a file written by [`ProxyStore::save_to_file`]
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, ProxyError> {
        let content = fs::read_to_string(path)?;
        let stored: Vec<StoredRecord> = serde_json::from_str(&content)?;

        let mut added = 0;
        for entry in stored {
            if self.add(ProxyRecord::try_from(entry)?) {
                added += 1;
            }
        }
        Ok(added)
    }
}
