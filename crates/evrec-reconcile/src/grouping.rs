//! Duplicate discovery: bucketing by external key, the name split and canonical selection.

use std::collections::BTreeMap;

use evrec_core::{EventRecord, EventSource, ModelError};

/// Buckets records by the parsed item id of their `target` mapping.
///
/// Records not mapped to `target` are ignored. A mapping whose item id does not
/// parse fails the whole call. Buckets holding a single record are dropped;
/// records keep their encounter order inside a bucket.
pub fn locate_duplicates(
    records: Vec<EventRecord>,
    target: &EventSource,
) -> Result<BTreeMap<u64, Vec<EventRecord>>, ModelError> {
    let mut buckets: BTreeMap<u64, Vec<EventRecord>> = BTreeMap::new();
    for record in records {
        if let Some(key) = record.external_key(target)? {
            buckets.entry(key).or_default().push(record);
        }
    }
    buckets.retain(|_, members| members.len() > 1);
    Ok(buckets)
}

/// Records sharing one external key and one name.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub external_key: u64,
    pub name: String,
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NameSplit {
    /// Groups with more than one member, ordered by name.
    pub groups: Vec<DuplicateGroup>,
    /// Ids of records without a name; they are never merged.
    pub unnamed: Vec<u64>,
}

/// Splits one external-key bucket by exact name.
pub fn split_by_name(external_key: u64, records: Vec<EventRecord>) -> NameSplit {
    let mut by_name: BTreeMap<String, Vec<EventRecord>> = BTreeMap::new();
    let mut unnamed = Vec::new();
    for record in records {
        match record.name.clone() {
            Some(name) => by_name.entry(name).or_default().push(record),
            None => unnamed.extend(record.id),
        }
    }

    let groups = by_name
        .into_iter()
        .filter(|(_, records)| records.len() > 1)
        .map(|(name, records)| DuplicateGroup {
            external_key,
            name,
            records,
        })
        .collect();

    NameSplit { groups, unnamed }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub canonical: EventRecord,
    /// Remaining records in their original relative order.
    pub duplicates: Vec<EventRecord>,
}

/// First undeleted record wins; when every record is deleted, the first one does.
pub fn select_canonical(mut records: Vec<EventRecord>) -> Option<Selection> {
    if records.is_empty() {
        return None;
    }
    let index = records
        .iter()
        .position(|record| !record.is_deleted())
        .unwrap_or(0);
    let canonical = records.remove(index);
    Some(Selection {
        canonical,
        duplicates: records,
    })
}
