use anyhow::{Context, Result};
use lcr_core::{CompanyRow, DimensionIds, NormalizedRecord};
use lcr_storage::{CompanyStore, UpsertOutcome};

/// Idempotent company writer keyed by the source `global_id`.
pub struct UpsertWriter<'a> {
    store: &'a dyn CompanyStore,
    require_coordinates: bool,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a dyn CompanyStore, require_coordinates: bool) -> Self {
        Self {
            store,
            require_coordinates,
        }
    }

    /// Ungeocoded records are skipped when coordinates are required.
    pub fn accepts(&self, record: &NormalizedRecord) -> bool {
        !self.require_coordinates || record.is_geocoded()
    }

    pub async fn write(&self, record: &NormalizedRecord, ids: DimensionIds) -> Result<UpsertOutcome> {
        let row = CompanyRow::from_canonical(record, ids);
        self.store
            .upsert_company(&row)
            .await
            .with_context(|| format!("upserting company global_id={}", record.global_id))
    }
}
