//! In-process `EventStore` with the same all-or-nothing apply contract as Postgres.
//! Used for dry runs against fixtures and by the engine's tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use evrec_core::{EventRecord, EventSource};
use tokio::sync::Mutex;

use crate::{ApplyOutcome, ApplyPlan, EventStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    rows: Mutex<BTreeMap<u64, EventRecord>>,
    fail_retire: Mutex<BTreeSet<u64>>,
    statements: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new(records: impl IntoIterator<Item = EventRecord>) -> Result<Self, StoreError> {
        let mut rows = BTreeMap::new();
        for record in records {
            let id = record.id.ok_or(StoreError::MissingId)?;
            rows.insert(id, record);
        }
        Ok(Self {
            rows: Mutex::new(rows),
            ..Default::default()
        })
    }

    /// Makes any apply that retires `id` fail after its canonical update ran.
    pub async fn fail_retiring(&self, id: u64) {
        self.fail_retire.lock().await.insert(id);
    }

    pub async fn get(&self, id: u64) -> Option<EventRecord> {
        self.rows.lock().await.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<EventRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Write statements that reached a commit.
    pub fn committed_statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn load_duplicate_candidates(
        &self,
        target: &EventSource,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = self.rows.lock().await;

        let mut ids_by_item: BTreeMap<&str, BTreeSet<u64>> = BTreeMap::new();
        for (id, record) in rows.iter() {
            if let Some(item_id) = record
                .marketplaces
                .get(target)
                .and_then(|info| info.item_id.as_deref())
            {
                ids_by_item.entry(item_id).or_default().insert(*id);
            }
        }

        let wanted: BTreeSet<u64> = ids_by_item
            .into_values()
            .filter(|ids| ids.len() > 1)
            .flatten()
            .collect();

        Ok(wanted
            .into_iter()
            .filter_map(|id| rows.get(&id).cloned())
            .collect())
    }

    async fn apply(&self, plan: &ApplyPlan) -> Result<ApplyOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut working = rows.clone();
        let mut outcome = ApplyOutcome::default();
        let mut statements = 0;

        if !plan.diff.assignments().is_empty() {
            let canonical = working
                .get_mut(&plan.canonical_id)
                .ok_or(StoreError::CanonicalMissing(plan.canonical_id))?;
            canonical.overlay(&plan.diff);
            outcome.canonical_updated = true;
            statements += 1;
        }

        if !plan.retire_ids.is_empty() {
            let fail_retire = self.fail_retire.lock().await;
            for id in &plan.retire_ids {
                if fail_retire.contains(id) {
                    return Err(StoreError::Injected(*id));
                }
                if let Some(row) = working.get_mut(id) {
                    row.deleted = Some(true);
                    outcome.retired += 1;
                }
            }
            statements += 1;
        }

        *rows = working;
        self.statements.fetch_add(statements, Ordering::SeqCst);
        Ok(outcome)
    }
}
