//! Folding duplicates into the canonical record and turning a group into a write plan.

use evrec_core::{Column, EventRecord, Marketplaces};
use evrec_storage::ApplyPlan;
use serde::Serialize;

use crate::grouping::{select_canonical, DuplicateGroup};
use crate::ReconcileError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Folded {
    pub accumulator: EventRecord,
    pub conflicts: Vec<Column>,
}

/// Combines candidates left to right into one record, starting from an empty one.
/// Earlier candidates win on fields they set.
pub fn fold(candidates: &[EventRecord]) -> Folded {
    let mut accumulator = EventRecord::default();
    let mut conflicts = Vec::new();
    for candidate in candidates {
        let outcome = accumulator.merge(candidate);
        conflicts.extend(outcome.conflicts);
    }
    Folded {
        accumulator,
        conflicts: descriptive(conflicts),
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    /// Columns that must be written on the canonical row.
    pub diff: EventRecord,
    pub conflicts: Vec<Column>,
    /// Marketplace entries carried by duplicates that the canonical did not adopt.
    pub discarded_marketplaces: usize,
}

/// Merges the accumulator into `canonical` and returns what changed.
///
/// The accumulator loses its `id` and `deleted` first. The canonical's
/// marketplace mapping is never extended: whatever a merge would have added is
/// dropped, so `canonical.marketplaces` is unchanged and the diff never carries it.
pub fn reconcile(canonical: &mut EventRecord, accumulator: EventRecord) -> Reconciliation {
    let accumulator = accumulator.without_identity();
    let original_marketplaces = canonical.marketplaces.clone();

    let mut outcome = canonical.merge(&accumulator);

    let mut discarded_marketplaces = 0;
    if !outcome.diff.marketplaces.is_empty() {
        discarded_marketplaces = outcome.diff.marketplaces.len();
        canonical.marketplaces = original_marketplaces;
        // Restored value equals the stored one; nothing to write.
        outcome.diff.marketplaces = Marketplaces::new();
    }

    Reconciliation {
        diff: outcome.diff,
        conflicts: descriptive(outcome.conflicts),
        discarded_marketplaces,
    }
}

fn descriptive(mut conflicts: Vec<Column>) -> Vec<Column> {
    conflicts.retain(|column| column.is_writable());
    conflicts.sort();
    conflicts.dedup();
    conflicts
}

/// Everything decided for one group before touching storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupPlan {
    pub external_key: u64,
    pub name: String,
    pub canonical_id: u64,
    pub retire_ids: Vec<u64>,
    pub diff: EventRecord,
    pub conflicts: Vec<Column>,
    pub discarded_marketplaces: usize,
    /// Nothing to fill and every duplicate already retired.
    pub already_reconciled: bool,
}

impl GroupPlan {
    pub fn apply_plan(&self) -> ApplyPlan {
        ApplyPlan {
            canonical_id: self.canonical_id,
            diff: self.diff.clone(),
            retire_ids: self.retire_ids.clone(),
        }
    }
}

pub fn plan_group(group: DuplicateGroup) -> Result<GroupPlan, ReconcileError> {
    let DuplicateGroup {
        external_key,
        name,
        records,
    } = group;

    let Some(selection) = select_canonical(records) else {
        return Err(ReconcileError::EmptyGroup { external_key, name });
    };
    let missing_id = || ReconcileError::MissingId {
        external_key,
        name: name.clone(),
    };
    let mut canonical = selection.canonical;
    let canonical_id = canonical.id.ok_or_else(missing_id)?;
    let retire_ids = selection
        .duplicates
        .iter()
        .map(|record| record.id.ok_or_else(missing_id))
        .collect::<Result<Vec<_>, _>>()?;
    let all_retired = selection.duplicates.iter().all(EventRecord::is_deleted);

    let folded = fold(&selection.duplicates);
    let reconciliation = reconcile(&mut canonical, folded.accumulator);

    let mut conflicts = folded.conflicts;
    conflicts.extend(reconciliation.conflicts);
    let conflicts = descriptive(conflicts);

    Ok(GroupPlan {
        external_key,
        canonical_id,
        already_reconciled: reconciliation.diff.is_empty() && all_retired,
        name,
        retire_ids,
        diff: reconciliation.diff,
        conflicts,
        discarded_marketplaces: reconciliation.discarded_marketplaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use evrec_core::{EventSource, MarketplaceInfo};

    fn tradedesk() -> EventSource {
        EventSource::new("tradedesk", "ticketmaster")
    }

    fn mapped(item_id: &str) -> Marketplaces {
        [(tradedesk(), MarketplaceInfo::with_item_id(item_id))]
            .into_iter()
            .collect()
    }

    #[test]
    fn fold_prefers_earlier_candidates_and_starts_empty() {
        let folded = fold(&[
            EventRecord {
                id: Some(2),
                venue_name: Some("Arena".into()),
                ..Default::default()
            },
            EventRecord {
                id: Some(3),
                venue_name: Some("Stadium".into()),
                venue_id: Some(9),
                ..Default::default()
            },
        ]);

        assert_eq!(folded.accumulator.venue_name.as_deref(), Some("Arena"));
        assert_eq!(folded.accumulator.venue_id, Some(9));
        assert_eq!(folded.conflicts, vec![Column::VenueName]);
        assert!(fold(&[]).accumulator.is_empty());
    }

    #[test]
    fn reconcile_never_writes_identity_or_lifecycle() {
        let mut canonical = EventRecord {
            id: Some(1),
            ..Default::default()
        };
        let accumulator = EventRecord {
            id: Some(2),
            deleted: Some(true),
            payment_method: Some("card".into()),
            ..Default::default()
        };

        let result = reconcile(&mut canonical, accumulator);

        assert_eq!(canonical.id, Some(1));
        assert_eq!(canonical.deleted, None);
        assert_eq!(result.diff.id, None);
        assert_eq!(result.diff.deleted, None);
        assert_eq!(result.diff.payment_method.as_deref(), Some("card"));
    }

    #[test]
    fn reconcile_keeps_canonical_marketplaces() {
        let original = mapped("42");
        let mut canonical = EventRecord {
            id: Some(1),
            marketplaces: original.clone(),
            ..Default::default()
        };
        let mut extra = mapped("42");
        extra.insert(
            EventSource::new("stubhub", "stubhub"),
            MarketplaceInfo::with_item_id("s-1"),
        );
        let accumulator = EventRecord {
            marketplaces: extra,
            on_snooze: Some(true),
            ..Default::default()
        };

        let result = reconcile(&mut canonical, accumulator);

        assert_eq!(canonical.marketplaces, original);
        assert!(result.diff.marketplaces.is_empty());
        assert_eq!(result.diff.on_snooze, Some(true));
        assert_eq!(result.discarded_marketplaces, 1);
    }

    #[test]
    fn plan_for_the_concert_scenario() {
        let group = DuplicateGroup {
            external_key: 42,
            name: "Concert A".into(),
            records: vec![
                EventRecord {
                    id: Some(1),
                    name: Some("Concert A".into()),
                    deleted: Some(false),
                    marketplaces: mapped("42"),
                    ..Default::default()
                },
                EventRecord {
                    id: Some(2),
                    name: Some("Concert A".into()),
                    deleted: Some(true),
                    venue_name: Some("Arena".into()),
                    marketplaces: mapped("42"),
                    ..Default::default()
                },
                EventRecord {
                    id: Some(3),
                    name: Some("Concert A".into()),
                    deleted: Some(false),
                    venue_id: Some(9),
                    marketplaces: mapped("42"),
                    ..Default::default()
                },
            ],
        };

        let plan = plan_group(group).unwrap();

        assert_eq!(plan.canonical_id, 1);
        assert_eq!(plan.retire_ids, vec![2, 3]);
        assert_eq!(
            plan.diff,
            EventRecord {
                venue_name: Some("Arena".into()),
                venue_id: Some(9),
                ..Default::default()
            }
        );
        assert!(plan.conflicts.is_empty());
        assert!(!plan.already_reconciled);
    }

    #[test]
    fn settled_group_is_already_reconciled() {
        let group = DuplicateGroup {
            external_key: 42,
            name: "Concert A".into(),
            records: vec![
                EventRecord {
                    id: Some(1),
                    name: Some("Concert A".into()),
                    venue_name: Some("Arena".into()),
                    deleted: Some(false),
                    ..Default::default()
                },
                EventRecord {
                    id: Some(2),
                    name: Some("Concert A".into()),
                    venue_name: Some("Arena".into()),
                    deleted: Some(true),
                    ..Default::default()
                },
            ],
        };

        let plan = plan_group(group).unwrap();

        assert!(plan.already_reconciled);
        assert!(plan.diff.is_empty());
    }

    #[test]
    fn record_without_id_cannot_be_planned() {
        let group = DuplicateGroup {
            external_key: 1,
            name: "A".into(),
            records: vec![
                EventRecord {
                    id: Some(1),
                    ..Default::default()
                },
                EventRecord::default(),
            ],
        };

        assert!(matches!(
            plan_group(group),
            Err(ReconcileError::MissingId { external_key: 1, .. })
        ));
    }
}
