//! Event record model, marketplace mappings and the field-level merge primitive.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "evrec-core";

/// Identifies one external system a record is mapped to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventSource {
    pub name: String,
    pub marketplace_name: String,
}

impl EventSource {
    pub fn new(name: impl Into<String>, marketplace_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            marketplace_name: marketplace_name.into(),
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.marketplace_name)
    }
}

/// External item reference plus whatever source-specific keys were stored next to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketplaceInfo {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub item_id: Option<String>,
    #[serde(flatten)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl MarketplaceInfo {
    pub fn with_item_id(item_id: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id.into()),
            metadata: JsonMap::new(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "item_id must be a string or number, got {other}"
        ))),
    }
}

/// Persisted element of the `marketplaces` JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceEntry {
    pub name: String,
    pub marketplace_name: String,
    #[serde(flatten)]
    pub info: MarketplaceInfo,
}

/// Mapping from external source to the record's item there. Keys are unique per record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<MarketplaceEntry>", into = "Vec<MarketplaceEntry>")]
pub struct Marketplaces(BTreeMap<EventSource, MarketplaceInfo>);

impl Marketplaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &EventSource) -> Option<&MarketplaceInfo> {
        self.0.get(source)
    }

    /// Inserts unless the key is already mapped. Returns whether the entry was taken.
    pub fn insert(&mut self, source: EventSource, info: MarketplaceInfo) -> bool {
        if self.0.contains_key(&source) {
            return false;
        }
        self.0.insert(source, info);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventSource, &MarketplaceInfo)> {
        self.0.iter()
    }

    /// Key-wise union, first-wins per key. Returns the entries that were added.
    fn merge_from(&mut self, src: &Marketplaces, conflicted: &mut bool) -> Marketplaces {
        let mut added = Marketplaces::new();
        for (source, info) in &src.0 {
            match self.0.get(source) {
                Some(existing) => {
                    if existing != info {
                        *conflicted = true;
                    }
                }
                None => {
                    self.0.insert(source.clone(), info.clone());
                    added.0.insert(source.clone(), info.clone());
                }
            }
        }
        added
    }
}

impl From<Vec<MarketplaceEntry>> for Marketplaces {
    fn from(entries: Vec<MarketplaceEntry>) -> Self {
        let mut out = Marketplaces::new();
        for entry in entries {
            out.insert(EventSource::new(entry.name, entry.marketplace_name), entry.info);
        }
        out
    }
}

impl From<Marketplaces> for Vec<MarketplaceEntry> {
    fn from(marketplaces: Marketplaces) -> Self {
        marketplaces
            .0
            .into_iter()
            .map(|(source, info)| MarketplaceEntry {
                name: source.name,
                marketplace_name: source.marketplace_name,
                info,
            })
            .collect()
    }
}

impl FromIterator<(EventSource, MarketplaceInfo)> for Marketplaces {
    fn from_iter<I: IntoIterator<Item = (EventSource, MarketplaceInfo)>>(iter: I) -> Self {
        let mut out = Marketplaces::new();
        for (source, info) in iter {
            out.insert(source, info);
        }
        out
    }
}

/// Schema descriptor shared by the read query and the update builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Id,
    Name,
    StartDateUtc,
    StartDateEst,
    VenueId,
    VenueName,
    DelayedDelivery,
    AcceptedOffers,
    FailedOffers,
    Type,
    Active,
    Deleted,
    OnOffers,
    OnSnooze,
    PaymentMethod,
    OnSapiPricing,
    UsingSapiPricing,
    Marketplaces,
}

impl Column {
    pub const ALL: [Column; 18] = [
        Column::Id,
        Column::Name,
        Column::StartDateUtc,
        Column::StartDateEst,
        Column::VenueId,
        Column::VenueName,
        Column::DelayedDelivery,
        Column::AcceptedOffers,
        Column::FailedOffers,
        Column::Type,
        Column::Active,
        Column::Deleted,
        Column::OnOffers,
        Column::OnSnooze,
        Column::PaymentMethod,
        Column::OnSapiPricing,
        Column::UsingSapiPricing,
        Column::Marketplaces,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Name => "name",
            Column::StartDateUtc => "start_date_utc",
            Column::StartDateEst => "start_date_est",
            Column::VenueId => "venue_id",
            Column::VenueName => "venue_name",
            Column::DelayedDelivery => "delayed_delivery",
            Column::AcceptedOffers => "accepted_offers",
            Column::FailedOffers => "failed_offers",
            Column::Type => "type",
            Column::Active => "active",
            Column::Deleted => "deleted",
            Column::OnOffers => "on_offers",
            Column::OnSnooze => "on_snooze",
            Column::PaymentMethod => "payment_method",
            Column::OnSapiPricing => "on_sapi_pricing",
            Column::UsingSapiPricing => "using_sapi_pricing",
            Column::Marketplaces => "marketplaces",
        }
    }

    /// Identity and lifecycle columns never travel through a diff.
    pub const fn is_writable(self) -> bool {
        !matches!(self, Column::Id | Column::Deleted)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value of one set column, ready to be bound by a storage backend.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Identifier(u64),
    Text(String),
    Integer(i64),
    Flag(bool),
    Timestamp(DateTime<Utc>),
    LocalTimestamp(NaiveDateTime),
    Marketplaces(Marketplaces),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("record {record_id:?} has unparseable {source_key} item id {item_id:?}: {error}")]
    InvalidExternalKey {
        record_id: Option<u64>,
        source_key: EventSource,
        item_id: String,
        #[source]
        error: ParseIntError,
    },
    #[error("record {record_id:?} has a {source_key} mapping without an item id")]
    MissingExternalKey {
        record_id: Option<u64>,
        source_key: EventSource,
    },
}

/// One stored event row. Every attribute is optional; `None` means unset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_local: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_delivery: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_offers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_offers: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_offers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_snooze: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_sapi_pricing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub using_sapi_pricing: Option<bool>,
    #[serde(default, skip_serializing_if = "Marketplaces::is_empty")]
    pub marketplaces: Marketplaces,
}

/// Result of folding one record into another.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    /// Fields that were unset on the destination and got filled.
    pub diff: EventRecord,
    /// Columns set on both sides to different values; the destination kept its value.
    pub conflicts: Vec<Column>,
}

impl EventRecord {
    pub fn is_empty(&self) -> bool {
        *self == EventRecord::default()
    }

    /// Absent `deleted` reads as the column default.
    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    /// Clears `id` and `deleted` so the record can be folded into another one.
    pub fn without_identity(mut self) -> Self {
        self.id = None;
        self.deleted = None;
        self
    }

    /// Parsed item id of the mapping for `target`.
    ///
    /// `Ok(None)` when the record is not mapped to `target` at all. A mapping
    /// without an item id, or with one that is not an unsigned integer, is an error.
    pub fn external_key(&self, target: &EventSource) -> Result<Option<u64>, ModelError> {
        let Some(info) = self.marketplaces.get(target) else {
            return Ok(None);
        };
        let Some(item_id) = info.item_id.as_deref() else {
            return Err(ModelError::MissingExternalKey {
                record_id: self.id,
                source_key: target.clone(),
            });
        };
        item_id
            .parse::<u64>()
            .map(Some)
            .map_err(|error| ModelError::InvalidExternalKey {
                record_id: self.id,
                source_key: target.clone(),
                item_id: item_id.to_string(),
                error,
            })
    }

    /// Fills every unset field of `self` from `src`; set fields are never overwritten.
    pub fn merge(&mut self, src: &EventRecord) -> MergeOutcome {
        let mut diff = EventRecord::default();
        let mut conflicts = Vec::new();
        let c = &mut conflicts;

        fill(&mut self.id, &src.id, &mut diff.id, Column::Id, c);
        fill(&mut self.name, &src.name, &mut diff.name, Column::Name, c);
        fill(&mut self.start_date_utc, &src.start_date_utc, &mut diff.start_date_utc, Column::StartDateUtc, c);
        fill(&mut self.start_date_local, &src.start_date_local, &mut diff.start_date_local, Column::StartDateEst, c);
        fill(&mut self.venue_id, &src.venue_id, &mut diff.venue_id, Column::VenueId, c);
        fill(&mut self.venue_name, &src.venue_name, &mut diff.venue_name, Column::VenueName, c);
        fill(&mut self.delayed_delivery, &src.delayed_delivery, &mut diff.delayed_delivery, Column::DelayedDelivery, c);
        fill(&mut self.accepted_offers, &src.accepted_offers, &mut diff.accepted_offers, Column::AcceptedOffers, c);
        fill(&mut self.failed_offers, &src.failed_offers, &mut diff.failed_offers, Column::FailedOffers, c);
        fill(&mut self.event_type, &src.event_type, &mut diff.event_type, Column::Type, c);
        fill(&mut self.active, &src.active, &mut diff.active, Column::Active, c);
        fill(&mut self.deleted, &src.deleted, &mut diff.deleted, Column::Deleted, c);
        fill(&mut self.on_offers, &src.on_offers, &mut diff.on_offers, Column::OnOffers, c);
        fill(&mut self.on_snooze, &src.on_snooze, &mut diff.on_snooze, Column::OnSnooze, c);
        fill(&mut self.payment_method, &src.payment_method, &mut diff.payment_method, Column::PaymentMethod, c);
        fill(&mut self.on_sapi_pricing, &src.on_sapi_pricing, &mut diff.on_sapi_pricing, Column::OnSapiPricing, c);
        fill(&mut self.using_sapi_pricing, &src.using_sapi_pricing, &mut diff.using_sapi_pricing, Column::UsingSapiPricing, c);

        let mut marketplace_conflict = false;
        diff.marketplaces = self.marketplaces.merge_from(&src.marketplaces, &mut marketplace_conflict);
        if marketplace_conflict {
            conflicts.push(Column::Marketplaces);
        }

        MergeOutcome { diff, conflicts }
    }

    pub fn value_of(&self, column: Column) -> Option<FieldValue> {
        match column {
            Column::Id => self.id.map(FieldValue::Identifier),
            Column::Name => self.name.clone().map(FieldValue::Text),
            Column::StartDateUtc => self.start_date_utc.map(FieldValue::Timestamp),
            Column::StartDateEst => self.start_date_local.map(FieldValue::LocalTimestamp),
            Column::VenueId => self.venue_id.map(FieldValue::Integer),
            Column::VenueName => self.venue_name.clone().map(FieldValue::Text),
            Column::DelayedDelivery => self.delayed_delivery.map(FieldValue::Flag),
            Column::AcceptedOffers => self.accepted_offers.map(FieldValue::Integer),
            Column::FailedOffers => self.failed_offers.map(FieldValue::Integer),
            Column::Type => self.event_type.clone().map(FieldValue::Text),
            Column::Active => self.active.map(FieldValue::Flag),
            Column::Deleted => self.deleted.map(FieldValue::Flag),
            Column::OnOffers => self.on_offers.map(FieldValue::Flag),
            Column::OnSnooze => self.on_snooze.map(FieldValue::Flag),
            Column::PaymentMethod => self.payment_method.clone().map(FieldValue::Text),
            Column::OnSapiPricing => self.on_sapi_pricing.map(FieldValue::Flag),
            Column::UsingSapiPricing => self.using_sapi_pricing.map(FieldValue::Flag),
            Column::Marketplaces => {
                (!self.marketplaces.is_empty()).then(|| FieldValue::Marketplaces(self.marketplaces.clone()))
            }
        }
    }

    /// Set writable columns, in schema order. This is exactly what an update writes.
    pub fn assignments(&self) -> Vec<(Column, FieldValue)> {
        Column::ALL
            .iter()
            .copied()
            .filter(|column| column.is_writable())
            .filter_map(|column| self.value_of(column).map(|value| (column, value)))
            .collect()
    }

    /// Writes the set writable fields of `diff` over `self`, like an UPDATE of those columns.
    pub fn overlay(&mut self, diff: &EventRecord) {
        overwrite(&mut self.name, &diff.name);
        overwrite(&mut self.start_date_utc, &diff.start_date_utc);
        overwrite(&mut self.start_date_local, &diff.start_date_local);
        overwrite(&mut self.venue_id, &diff.venue_id);
        overwrite(&mut self.venue_name, &diff.venue_name);
        overwrite(&mut self.delayed_delivery, &diff.delayed_delivery);
        overwrite(&mut self.accepted_offers, &diff.accepted_offers);
        overwrite(&mut self.failed_offers, &diff.failed_offers);
        overwrite(&mut self.event_type, &diff.event_type);
        overwrite(&mut self.active, &diff.active);
        overwrite(&mut self.on_offers, &diff.on_offers);
        overwrite(&mut self.on_snooze, &diff.on_snooze);
        overwrite(&mut self.payment_method, &diff.payment_method);
        overwrite(&mut self.on_sapi_pricing, &diff.on_sapi_pricing);
        overwrite(&mut self.using_sapi_pricing, &diff.using_sapi_pricing);
        if !diff.marketplaces.is_empty() {
            self.marketplaces = diff.marketplaces.clone();
        }
    }
}

fn fill<T: Clone + PartialEq>(
    dst: &mut Option<T>,
    src: &Option<T>,
    diff: &mut Option<T>,
    column: Column,
    conflicts: &mut Vec<Column>,
) {
    let Some(value) = src else {
        return;
    };
    if let Some(current) = dst.as_ref() {
        if current != value {
            conflicts.push(column);
        }
        return;
    }
    *dst = Some(value.clone());
    *diff = Some(value.clone());
}

fn overwrite<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(value) = src {
        *dst = Some(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tradedesk() -> EventSource {
        EventSource::new("tradedesk", "ticketmaster")
    }

    fn mapped(item_id: &str) -> Marketplaces {
        [(tradedesk(), MarketplaceInfo::with_item_id(item_id))]
            .into_iter()
            .collect()
    }

    #[test]
    fn merge_fills_unset_fields_and_reports_them_in_diff() {
        let mut canonical = EventRecord {
            id: Some(1),
            name: Some("Concert A".into()),
            ..Default::default()
        };
        let dup = EventRecord {
            venue_name: Some("Arena".into()),
            accepted_offers: Some(3),
            ..Default::default()
        };

        let outcome = canonical.merge(&dup);

        assert_eq!(canonical.venue_name.as_deref(), Some("Arena"));
        assert_eq!(canonical.accepted_offers, Some(3));
        assert_eq!(outcome.diff.venue_name.as_deref(), Some("Arena"));
        assert_eq!(outcome.diff.accepted_offers, Some(3));
        assert_eq!(outcome.diff.name, None);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn merge_never_clobbers_set_fields() {
        let mut canonical = EventRecord {
            venue_id: Some(7),
            active: Some(false),
            ..Default::default()
        };
        let dup = EventRecord {
            venue_id: Some(9),
            active: Some(false),
            ..Default::default()
        };

        let outcome = canonical.merge(&dup);

        assert_eq!(canonical.venue_id, Some(7));
        assert!(outcome.diff.is_empty());
        assert_eq!(outcome.conflicts, vec![Column::VenueId]);
    }

    #[test]
    fn merge_unions_marketplaces_first_wins_per_key() {
        let stubhub = EventSource::new("stubhub", "stubhub");
        let mut canonical = EventRecord {
            marketplaces: mapped("42"),
            ..Default::default()
        };
        let mut dup_markets = mapped("43");
        dup_markets.insert(stubhub.clone(), MarketplaceInfo::with_item_id("s-1"));
        let dup = EventRecord {
            marketplaces: dup_markets,
            ..Default::default()
        };

        let outcome = canonical.merge(&dup);

        assert_eq!(canonical.marketplaces.len(), 2);
        assert_eq!(
            canonical.marketplaces.get(&tradedesk()).and_then(|i| i.item_id.as_deref()),
            Some("42")
        );
        assert_eq!(outcome.diff.marketplaces.len(), 1);
        assert!(outcome.diff.marketplaces.get(&stubhub).is_some());
        assert_eq!(outcome.conflicts, vec![Column::Marketplaces]);
    }

    #[test]
    fn without_identity_strips_id_and_deleted_only() {
        let record = EventRecord {
            id: Some(4),
            deleted: Some(true),
            venue_name: Some("Hall".into()),
            ..Default::default()
        }
        .without_identity();

        assert_eq!(record.id, None);
        assert_eq!(record.deleted, None);
        assert_eq!(record.venue_name.as_deref(), Some("Hall"));
    }

    #[test]
    fn external_key_parsing() {
        let ok = EventRecord {
            id: Some(1),
            marketplaces: mapped("42"),
            ..Default::default()
        };
        assert_eq!(ok.external_key(&tradedesk()).unwrap(), Some(42));

        let unmapped = EventRecord::default();
        assert_eq!(unmapped.external_key(&tradedesk()).unwrap(), None);

        let bad = EventRecord {
            id: Some(2),
            marketplaces: mapped("td-42"),
            ..Default::default()
        };
        assert!(matches!(
            bad.external_key(&tradedesk()),
            Err(ModelError::InvalidExternalKey { record_id: Some(2), .. })
        ));

        let mut no_item: Marketplaces = Marketplaces::new();
        no_item.insert(tradedesk(), MarketplaceInfo::default());
        let missing = EventRecord {
            id: Some(3),
            marketplaces: no_item,
            ..Default::default()
        };
        assert!(matches!(
            missing.external_key(&tradedesk()),
            Err(ModelError::MissingExternalKey { .. })
        ));
    }

    #[test]
    fn marketplaces_decode_from_json_array_keeping_metadata() {
        let raw = json!([
            {"name": "tradedesk", "marketplace_name": "ticketmaster", "item_id": 42, "section": "A"},
            {"name": "tradedesk", "marketplace_name": "ticketmaster", "item_id": "99"},
            {"name": "stubhub", "marketplace_name": "stubhub", "item_id": "s-1"}
        ]);

        let markets: Marketplaces = serde_json::from_value(raw).expect("decode");

        assert_eq!(markets.len(), 2);
        let td = markets.get(&tradedesk()).expect("tradedesk entry");
        assert_eq!(td.item_id.as_deref(), Some("42"));
        assert_eq!(td.metadata.get("section"), Some(&json!("A")));

        let encoded = serde_json::to_value(&markets).expect("encode");
        assert_eq!(encoded.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn assignments_follow_schema_order_and_skip_identity() {
        let record = EventRecord {
            id: Some(1),
            deleted: Some(true),
            venue_name: Some("Arena".into()),
            venue_id: Some(9),
            name: Some("Concert A".into()),
            ..Default::default()
        };

        let columns: Vec<Column> = record.assignments().into_iter().map(|(c, _)| c).collect();

        assert_eq!(columns, vec![Column::Name, Column::VenueId, Column::VenueName]);
    }

    #[test]
    fn overlay_writes_only_set_columns() {
        let mut stored = EventRecord {
            id: Some(1),
            name: Some("Concert A".into()),
            venue_id: Some(1),
            ..Default::default()
        };
        let diff = EventRecord {
            venue_id: Some(9),
            venue_name: Some("Arena".into()),
            ..Default::default()
        };

        stored.overlay(&diff);

        assert_eq!(stored.id, Some(1));
        assert_eq!(stored.name.as_deref(), Some("Concert A"));
        assert_eq!(stored.venue_id, Some(9));
        assert_eq!(stored.venue_name.as_deref(), Some("Arena"));
    }
}
