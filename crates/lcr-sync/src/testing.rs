//! In-memory store and source used by the pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lcr_adapters::{page_from_json, RegistrySource, SourcePage};
use lcr_core::{CompanyRow, DimensionKind};
use lcr_storage::{CompanyStore, FetchError, UpsertOutcome};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

type DimensionKey = (DimensionKind, Option<i64>, String);

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    dimensions: HashMap<DimensionKey, i64>,
    companies: HashMap<i64, CompanyRow>,
    failing_writes: HashSet<i64>,
    racing_inserts: HashMap<DimensionKey, i64>,
    dimension_inserts: usize,
    upserts: usize,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_license_types(codes: &[&str]) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            for code in codes {
                state.next_id += 1;
                let id = state.next_id;
                state
                    .dimensions
                    .insert((DimensionKind::LicenseType, None, code.to_string()), id);
            }
        }
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn fail_writes_for(&self, global_id: i64) {
        self.state.lock().unwrap().failing_writes.insert(global_id);
    }

    /// The next insert of this key reports a conflict and another writer's row appears.
    pub fn lose_next_insert_race(&self, kind: DimensionKind, key: &str, winner_id: i64) {
        self.state
            .lock()
            .unwrap()
            .racing_inserts
            .insert((kind, None, key.to_string()), winner_id);
    }

    pub fn dimension_count(&self, kind: DimensionKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .dimensions
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    pub fn dimension_inserts(&self) -> usize {
        self.state.lock().unwrap().dimension_inserts
    }

    pub fn company(&self, global_id: i64) -> Option<CompanyRow> {
        self.state.lock().unwrap().companies.get(&global_id).cloned()
    }

    pub fn company_count(&self) -> usize {
        self.state.lock().unwrap().companies.len()
    }

    pub fn upserts(&self) -> usize {
        self.state.lock().unwrap().upserts
    }
}

#[async_trait]
impl CompanyStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unwrap().unavailable {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn find_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dimensions
            .get(&(kind, parent_id, natural_key.to_string()))
            .copied())
    }

    async fn insert_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>> {
        if !kind.is_open() {
            bail!("refusing to create {}", kind.as_str());
        }
        let mut state = self.state.lock().unwrap();
        let key = (kind, parent_id, natural_key.to_string());
        if let Some(winner) = state.racing_inserts.remove(&key) {
            state.dimensions.insert(key, winner);
            return Ok(None);
        }
        if state.dimensions.contains_key(&key) {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.dimensions.insert(key, id);
        state.dimension_inserts += 1;
        Ok(Some(id))
    }

    async fn upsert_company(&self, row: &CompanyRow) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.failing_writes.contains(&row.global_id) {
            return Err(anyhow!("value too long for column"));
        }
        state.upserts += 1;
        let outcome = match state.companies.insert(row.global_id, row.clone()) {
            None => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        };
        Ok(outcome)
    }
}

/// Serves a fixed row list in pages; optionally fails at one offset.
pub struct FakeSource {
    rows: Vec<JsonValue>,
    count: Option<u64>,
    fail_at_offset: Option<usize>,
    requests: Mutex<Vec<usize>>,
}

impl FakeSource {
    pub fn new(rows: Vec<JsonValue>) -> Self {
        let count = Some(rows.len() as u64);
        Self {
            rows,
            count,
            fail_at_offset: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    pub fn failing_at(mut self, offset: usize) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }

    pub fn requested_offsets(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrySource for FakeSource {
    async fn count(&self, _run_id: Uuid) -> Option<u64> {
        self.count
    }

    async fn fetch_page(
        &self,
        _run_id: Uuid,
        offset: usize,
        page_size: usize,
    ) -> Result<SourcePage, FetchError> {
        self.requests.lock().unwrap().push(offset);
        if self.fail_at_offset == Some(offset) {
            let body = b"{";
            let source = serde_json::from_slice::<JsonValue>(body).unwrap_err();
            return Err(FetchError::Decode {
                url: format!("fake://rows?$skip={offset}"),
                source,
            });
        }
        let page = self
            .rows
            .iter()
            .skip(offset)
            .take(page_size)
            .cloned()
            .collect::<Vec<_>>();
        Ok(page_from_json(JsonValue::Array(page)))
    }
}

/// A registry row in the portal's wire shape.
pub fn registry_row(global_id: i64, inn: &str, expire: &str) -> JsonValue {
    json!({
        "global_id": global_id,
        "Number": global_id,
        "Cells": {
            "global_id": global_id,
            "INN": inn,
            "Address": format!("Moscow, street {global_id}"),
            "AdmArea": "Central",
            "District": "Arbat",
            "JobType": "ALC",
            "CurrentLicenseState": "active",
            "LicenseExpire": expire,
            "geoData": { "type": "Point", "coordinates": [37.6, 55.75] }
        }
    })
}

pub fn ungeocoded_row(global_id: i64, inn: &str) -> JsonValue {
    json!({
        "global_id": global_id,
        "Cells": { "INN": inn, "LicenseExpire": "01.01.2030" }
    })
}
