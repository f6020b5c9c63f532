//! Reference-table resolution with a per-run cache.

use std::collections::HashMap;

use anyhow::{Context, Result};
use lcr_core::{DimensionIds, DimensionKind, NormalizedRecord};
use lcr_storage::CompanyStore;
use tracing::{debug, warn};

type CacheKey = (DimensionKind, Option<i64>, String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub created: usize,
    pub lookups: usize,
    pub cache_hits: usize,
}

/// Maps natural keys (area name, district name within an area, license type
/// code, status label) to stored ids.
///
/// Open kinds are created on first sight. License types are looked up only;
/// an unknown code resolves to `None` and that answer is cached for the run.
pub struct DimensionResolver<'a> {
    store: &'a dyn CompanyStore,
    cache: HashMap<CacheKey, Option<i64>>,
    stats: ResolverStats,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(store: &'a dyn CompanyStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    pub async fn resolve_adm_area(&mut self, name: Option<&str>) -> Result<Option<i64>> {
        self.resolve(DimensionKind::AdmArea, None, name).await
    }

    /// A district is scoped to its administrative area; without one it stays unresolved.
    pub async fn resolve_district(
        &mut self,
        name: Option<&str>,
        adm_area_id: Option<i64>,
    ) -> Result<Option<i64>> {
        let Some(adm_area_id) = adm_area_id else {
            return Ok(None);
        };
        self.resolve(DimensionKind::District, Some(adm_area_id), name).await
    }

    pub async fn resolve_license_type(&mut self, code: Option<&str>) -> Result<Option<i64>> {
        self.resolve(DimensionKind::LicenseType, None, code).await
    }

    pub async fn resolve_license_status(&mut self, status: Option<&str>) -> Result<Option<i64>> {
        self.resolve(DimensionKind::LicenseStatus, None, status).await
    }

    pub async fn resolve_all(&mut self, record: &NormalizedRecord) -> Result<DimensionIds> {
        let adm_area_id = self.resolve_adm_area(record.adm_area.as_deref()).await?;
        let district_id = self
            .resolve_district(record.district.as_deref(), adm_area_id)
            .await?;
        let license_type_id = self
            .resolve_license_type(record.license_type_code.as_deref())
            .await?;
        let license_status_id = self
            .resolve_license_status(record.license_status.as_deref())
            .await?;
        Ok(DimensionIds {
            adm_area_id,
            district_id,
            license_type_id,
            license_status_id,
        })
    }

    async fn resolve(
        &mut self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: Option<&str>,
    ) -> Result<Option<i64>> {
        let Some(natural_key) = natural_key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let cache_key = (kind, parent_id, natural_key.to_string());
        if let Some(id) = self.cache.get(&cache_key) {
            self.stats.cache_hits += 1;
            return Ok(*id);
        }

        let id = self.lookup_or_create(kind, parent_id, natural_key).await?;
        self.cache.insert(cache_key, id);
        Ok(id)
    }

    async fn lookup_or_create(
        &mut self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>> {
        self.stats.lookups += 1;
        if let Some(id) = self
            .store
            .find_dimension(kind, parent_id, natural_key)
            .await
            .with_context(|| format!("looking up {} {natural_key:?}", kind.as_str()))?
        {
            return Ok(Some(id));
        }

        if !kind.is_open() {
            warn!(kind = kind.as_str(), key = natural_key, "unknown reference value left unresolved");
            return Ok(None);
        }

        let inserted = self
            .store
            .insert_dimension(kind, parent_id, natural_key)
            .await
            .with_context(|| format!("creating {} {natural_key:?}", kind.as_str()))?;
        if let Some(id) = inserted {
            self.stats.created += 1;
            debug!(kind = kind.as_str(), key = natural_key, id, "created reference row");
            return Ok(Some(id));
        }

        // Lost an insert race; the winning row is visible now.
        self.store
            .find_dimension(kind, parent_id, natural_key)
            .await
            .with_context(|| format!("re-reading {} {natural_key:?}", kind.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[tokio::test]
    async fn creates_open_kinds_once_per_run() {
        let store = MemoryStore::default();
        let mut resolver = DimensionResolver::new(&store);

        let first = resolver.resolve_adm_area(Some("CAO")).await.unwrap();
        let second = resolver.resolve_adm_area(Some(" CAO ")).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(resolver.stats().created, 1);
        assert_eq!(resolver.stats().cache_hits, 1);
        assert_eq!(store.dimension_count(DimensionKind::AdmArea), 1);
    }

    #[tokio::test]
    async fn districts_are_scoped_by_area() {
        let store = MemoryStore::default();
        let mut resolver = DimensionResolver::new(&store);
        let cao = resolver.resolve_adm_area(Some("CAO")).await.unwrap();
        let sao = resolver.resolve_adm_area(Some("SAO")).await.unwrap();

        let a = resolver.resolve_district(Some("Arbat"), cao).await.unwrap();
        let b = resolver.resolve_district(Some("Arbat"), sao).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(resolver.resolve_district(Some("Arbat"), None).await.unwrap(), None);
        assert_eq!(store.dimension_count(DimensionKind::District), 2);
    }

    #[tokio::test]
    async fn license_types_are_never_created() {
        let store = MemoryStore::with_license_types(&["ALC"]);
        let mut resolver = DimensionResolver::new(&store);

        assert!(resolver.resolve_license_type(Some("ALC")).await.unwrap().is_some());
        assert_eq!(resolver.resolve_license_type(Some("NEW")).await.unwrap(), None);
        assert_eq!(resolver.resolve_license_type(Some("NEW")).await.unwrap(), None);
        assert_eq!(resolver.stats().lookups, 2);
        assert_eq!(store.dimension_count(DimensionKind::LicenseType), 1);
    }

    #[tokio::test]
    async fn empty_keys_resolve_to_none_without_touching_the_store() {
        let store = MemoryStore::default();
        let mut resolver = DimensionResolver::new(&store);
        assert_eq!(resolver.resolve_license_status(Some("  ")).await.unwrap(), None);
        assert_eq!(resolver.resolve_adm_area(None).await.unwrap(), None);
        assert_eq!(resolver.stats().lookups, 0);
    }

    #[tokio::test]
    async fn conflicting_insert_falls_back_to_lookup() {
        let store = MemoryStore::default();
        store.lose_next_insert_race(DimensionKind::LicenseStatus, "active", 77);
        let mut resolver = DimensionResolver::new(&store);

        let id = resolver.resolve_license_status(Some("active")).await.unwrap();
        assert_eq!(id, Some(77));
        assert_eq!(resolver.stats().created, 0);
    }

    #[tokio::test]
    async fn resolve_all_fills_every_slot() {
        let store = MemoryStore::with_license_types(&["ALC"]);
        let mut resolver = DimensionResolver::new(&store);
        let mut record = NormalizedRecord::empty(1);
        record.adm_area = Some("CAO".into());
        record.district = Some("Arbat".into());
        record.license_type_code = Some("ALC".into());
        record.license_status = Some("active".into());

        let ids = resolver.resolve_all(&record).await.unwrap();
        assert!(ids.adm_area_id.is_some());
        assert!(ids.district_id.is_some());
        assert!(ids.license_type_id.is_some());
        assert!(ids.license_status_id.is_some());
    }
}
