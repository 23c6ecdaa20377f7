//! Record store.
//!
//! Holds the administrator-defined records and persists them to the records
//! snapshot (`{"records": [...]}`). Readers get an atomic snapshot of the
//! whole set, so a lookup never sees a half-applied change. Writers are
//! serialised, and every change is written to disk before it becomes visible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;
use crate::persist::{read_json, write_json};
use crate::record::{encode_rdata, decode_rdata, DnsClass, DnsRecord, RecordType, QTYPE_ANY};
use crate::utils::{names_equal, normalize_name, reverse_to_ipv4};

/// On-disk shape of the records snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecordsFile {
    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

/// Result of looking a question up in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAnswer {
    /// Records answering the question.
    Found(Vec<DnsRecord>),
    /// The name exists but has no records of the requested type.
    NoData,
    /// The store knows nothing about the name.
    Missing,
}

/// The administrator's record set.
#[derive(Debug)]
pub struct RecordStore {
    records: ArcSwap<Vec<DnsRecord>>,
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

fn canonical_value(rtype: RecordType, value: &str) -> Result<String, RecordError> {
    let rdata = encode_rdata(rtype, value).map_err(|e| RecordError::Invalid(e.to_string()))?;
    decode_rdata(rtype, &rdata, 0, rdata.len()).map_err(|e| RecordError::Invalid(e.to_string()))
}

fn duplicate(record: &DnsRecord) -> RecordError {
    RecordError::Duplicate {
        name: record.name.clone(),
        rtype: record.rtype.to_string(),
        value: record.value.clone(),
    }
}

fn not_found(name: &str, rtype: RecordType) -> RecordError {
    RecordError::NotFound {
        name: name.to_string(),
        rtype: rtype.to_string(),
    }
}

/// Validate a batch of records.
///
/// With `strict`, the first invalid or duplicate record fails the batch;
/// otherwise such records are logged and skipped.
fn sanitize(records: Vec<DnsRecord>, strict: bool) -> Result<Vec<DnsRecord>, RecordError> {
    let mut out: Vec<DnsRecord> = Vec::with_capacity(records.len());
    for record in records {
        let label = format!("{} {} {}", record.name, record.rtype, record.value);
        let record = match record.normalized() {
            Ok(record) => record,
            Err(e) if strict => return Err(RecordError::Invalid(e.to_string())),
            Err(e) => {
                warn!("Skipping invalid record {}: {}", label, e);
                continue;
            }
        };
        if out.iter().any(|existing| existing.same_identity(&record)) {
            if strict {
                return Err(duplicate(&record));
            }
            warn!("Skipping duplicate record {}", label);
            continue;
        }
        out.push(record);
    }
    Ok(out)
}

impl RecordStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            records: ArcSwap::from_pointee(Vec::new()),
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// Open the store backed by the snapshot at `path`.
    ///
    /// A missing file gives an empty store. Invalid or duplicate entries in
    /// the file are skipped with a warning; an empty or unparsable file is
    /// an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecordError> {
        let path = path.into();
        let records = Self::read_snapshot(&path)?;
        info!("Loaded {} records from {}", records.len(), path.display());
        Ok(Self {
            records: ArcSwap::from_pointee(records),
            path: Some(path),
            writer: Mutex::new(()),
        })
    }

    fn read_snapshot(path: &Path) -> Result<Vec<DnsRecord>, RecordError> {
        let file: RecordsFile = read_json(path)?.unwrap_or_default();
        sanitize(file.records, false)
    }

    /// The snapshot file backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current records, in insertion order.
    pub fn list(&self) -> Vec<DnsRecord> {
        self.records.load().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.load().is_empty()
    }

    /// Persist `records` and then make them visible.
    fn commit(&self, records: Vec<DnsRecord>) -> Result<(), RecordError> {
        if let Some(path) = &self.path {
            let file = RecordsFile { records };
            write_json(path, &file)?;
            self.records.store(Arc::new(file.records));
        } else {
            self.records.store(Arc::new(records));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a record.
    ///
    /// # Arguments
    /// * `record` - The record; its name is normalised and its value validated.
    ///
    /// # Returns
    /// The stored record with `added_on`/`updated_on` set, or
    /// [`RecordError::Duplicate`] if `(name, type, value)` already exists.
    pub fn add(&self, record: DnsRecord) -> Result<DnsRecord, RecordError> {
        let mut record = record
            .normalized()
            .map_err(|e| RecordError::Invalid(e.to_string()))?;

        let _guard = self.lock();
        let current = self.records.load_full();
        if current.iter().any(|existing| existing.same_identity(&record)) {
            return Err(duplicate(&record));
        }

        let now = Utc::now();
        record.added_on = Some(now);
        record.updated_on = Some(now);

        let mut next = current.as_ref().clone();
        next.push(record.clone());
        self.commit(next)?;
        info!("Added record {} {} {}", record.name, record.rtype, record.value);
        Ok(record)
    }

    /// Remove records by name and type, optionally narrowed to one value.
    ///
    /// # Returns
    /// The removed records, or [`RecordError::NotFound`] if nothing matched.
    pub fn remove(
        &self,
        name: &str,
        rtype: RecordType,
        value: Option<&str>,
    ) -> Result<Vec<DnsRecord>, RecordError> {
        let value = value.map(|v| canonical_value(rtype, v)).transpose()?;

        let _guard = self.lock();
        let current = self.records.load_full();
        let (removed, kept): (Vec<DnsRecord>, Vec<DnsRecord>) =
            current.iter().cloned().partition(|r| {
                r.rtype == rtype
                    && names_equal(&r.name, name)
                    && value.as_ref().map_or(true, |v| &r.value == v)
            });
        if removed.is_empty() {
            return Err(not_found(name, rtype));
        }

        self.commit(kept)?;
        info!("Removed {} {} record(s) for {}", removed.len(), rtype, name);
        Ok(removed)
    }

    /// Change the value (and optionally TTL) of an existing record.
    ///
    /// # Returns
    /// The updated record. Fails with [`RecordError::NotFound`] if no record
    /// has `old_value`, and with [`RecordError::Duplicate`] if the new value
    /// collides with another record.
    pub fn update(
        &self,
        name: &str,
        rtype: RecordType,
        old_value: &str,
        new_value: &str,
        new_ttl: Option<u32>,
    ) -> Result<DnsRecord, RecordError> {
        let old_value = canonical_value(rtype, old_value)?;

        let _guard = self.lock();
        let current = self.records.load_full();
        let index = current
            .iter()
            .position(|r| r.rtype == rtype && names_equal(&r.name, name) && r.value == old_value)
            .ok_or_else(|| not_found(name, rtype))?;

        let mut updated = current[index].clone();
        updated.value = new_value.to_string();
        if let Some(ttl) = new_ttl {
            updated.ttl = ttl;
        }
        let mut updated = updated
            .normalized()
            .map_err(|e| RecordError::Invalid(e.to_string()))?;
        if current
            .iter()
            .enumerate()
            .any(|(i, r)| i != index && r.same_identity(&updated))
        {
            return Err(duplicate(&updated));
        }
        updated.updated_on = Some(Utc::now());

        let mut next = current.as_ref().clone();
        next[index] = updated.clone();
        self.commit(next)?;
        info!("Updated record {} {} {}", updated.name, updated.rtype, updated.value);
        Ok(updated)
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), RecordError> {
        let _guard = self.lock();
        self.commit(Vec::new())?;
        info!("Cleared all records");
        Ok(())
    }

    /// Replace the whole set. The batch must be valid and free of duplicates.
    pub fn replace_all(&self, records: Vec<DnsRecord>) -> Result<(), RecordError> {
        let now = Utc::now();
        let records = sanitize(records, true)?
            .into_iter()
            .map(|mut r| {
                r.added_on.get_or_insert(now);
                r.updated_on.get_or_insert(now);
                r
            })
            .collect();
        let _guard = self.lock();
        self.commit(records)
    }

    /// Replace the in-memory set with the contents of the snapshot at `path`.
    ///
    /// # Returns
    /// The number of records loaded.
    pub fn load(&self, path: &Path) -> Result<usize, RecordError> {
        let records = Self::read_snapshot(path)?;
        let count = records.len();
        let _guard = self.lock();
        if self.path.as_deref() == Some(path) {
            self.records.store(Arc::new(records));
        } else {
            self.commit(records)?;
        }
        info!("Loaded {} records from {}", count, path.display());
        Ok(count)
    }

    /// Write the current set to `path`.
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        let file = RecordsFile {
            records: self.list(),
        };
        write_json(path, &file)?;
        Ok(())
    }

    /// Look up the records answering `(name, qtype, class)`.
    ///
    /// A CNAME at the name answers any other type on its own; it is not
    /// followed.
    pub fn lookup(&self, name: &str, qtype: u16, class: DnsClass) -> LocalAnswer {
        let records = self.records.load();
        let at_name: Vec<&DnsRecord> = records
            .iter()
            .filter(|r| r.class == class && names_equal(&r.name, name))
            .collect();
        if at_name.is_empty() {
            return LocalAnswer::Missing;
        }

        if qtype == QTYPE_ANY {
            return LocalAnswer::Found(at_name.into_iter().cloned().collect());
        }

        let exact: Vec<DnsRecord> = at_name
            .iter()
            .filter(|r| r.rtype.code() == qtype)
            .map(|r| (*r).clone())
            .collect();
        if !exact.is_empty() {
            return LocalAnswer::Found(exact);
        }

        if qtype != RecordType::CNAME.code() {
            if let Some(cname) = at_name.iter().find(|r| r.rtype == RecordType::CNAME) {
                return LocalAnswer::Found(vec![(*cname).clone()]);
            }
        }
        LocalAnswer::NoData
    }

    /// Build a PTR answer for a reverse name from a matching A record.
    ///
    /// # Arguments
    /// * `qname` - An `in-addr.arpa.` name.
    ///
    /// # Returns
    /// A PTR owned by `qname` pointing at the A record's owner, with the A
    /// record's TTL.
    pub fn synthesize_ptr(&self, qname: &str) -> Option<DnsRecord> {
        let ip = reverse_to_ipv4(qname)?.to_string();
        let records = self.records.load();
        let a = records
            .iter()
            .find(|r| r.rtype == RecordType::A && r.class.is_in() && r.value == ip)?;
        Some(DnsRecord::new(
            &normalize_name(qname),
            RecordType::PTR,
            &a.name,
            a.ttl,
        ))
    }
}
