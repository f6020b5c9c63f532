//! Core domain model for the licensed-company registry sync.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "lcr-core";

/// Days before expiry at which a license counts as expiring soon.
pub const EXPIRING_SOON_DAYS: i64 = 30;

/// One row exactly as the registry API delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub global_id: i64,
    pub row_number: Option<i64>,
    pub cells: Map<String, JsonValue>,
}

impl RawRecord {
    pub fn new(global_id: i64, row_number: Option<i64>, cells: Map<String, JsonValue>) -> Self {
        Self {
            global_id,
            row_number,
            cells,
        }
    }

    /// Cell by source column name; JSON `null` reads as absent.
    pub fn cell(&self, name: &str) -> Option<&JsonValue> {
        self.cells.get(name).filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Typed view of one registry row. Every field is independently optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub global_id: i64,
    pub row_number: Option<i64>,
    pub content_hash: String,
    pub object_name_on_doc: Option<String>,
    pub object_name: Option<String>,
    pub address: Option<String>,
    pub adm_area: Option<String>,
    pub district: Option<String>,
    pub subject_name: Option<String>,
    pub legal_address: Option<String>,
    pub email: Option<String>,
    pub inn: Option<String>,
    pub kpp: Option<String>,
    pub kpp_separate_division: Option<String>,
    pub license_type_code: Option<String>,
    pub license_number: Option<String>,
    pub license_number_in_registry: Option<String>,
    pub license_begin: Option<NaiveDate>,
    pub license_expire: Option<NaiveDate>,
    pub install_date: Option<NaiveDate>,
    pub decision_date: Option<NaiveDate>,
    pub license_status: Option<String>,
    pub licensing_authority: Option<String>,
    pub n_fias: Option<String>,
    pub cadastral_number: Option<String>,
    pub geo_data: Option<JsonValue>,
    pub geo_data_center: Option<JsonValue>,
    pub location: Option<GeoPoint>,
}

impl NormalizedRecord {
    /// Record with only the identifiers set; used as a base by builders and tests.
    pub fn empty(global_id: i64) -> Self {
        Self {
            global_id,
            row_number: None,
            content_hash: String::new(),
            object_name_on_doc: None,
            object_name: None,
            address: None,
            adm_area: None,
            district: None,
            subject_name: None,
            legal_address: None,
            email: None,
            inn: None,
            kpp: None,
            kpp_separate_division: None,
            license_type_code: None,
            license_number: None,
            license_number_in_registry: None,
            license_begin: None,
            license_expire: None,
            install_date: None,
            decision_date: None,
            license_status: None,
            licensing_authority: None,
            n_fias: None,
            cadastral_number: None,
            geo_data: None,
            geo_data_center: None,
            location: None,
        }
    }

    pub fn longitude(&self) -> Option<f64> {
        self.location.map(|p| p.longitude)
    }

    pub fn latitude(&self) -> Option<f64> {
        self.location.map(|p| p.latitude)
    }

    pub fn is_geocoded(&self) -> bool {
        self.location.is_some()
    }
}

/// Grouping key for records believed to describe the same company. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CompanyKey(String);

impl CompanyKey {
    pub fn tax(inn: &str) -> Self {
        Self(format!("TAX:{inn}"))
    }

    pub fn address(address: &str) -> Self {
        Self(format!("ADDR:{address}"))
    }

    pub fn record(global_id: i64) -> Self {
        Self(format!("RECORD:{global_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimensionKind {
    AdmArea,
    District,
    LicenseType,
    LicenseStatus,
}

impl DimensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::AdmArea => "adm_area",
            DimensionKind::District => "district",
            DimensionKind::LicenseType => "license_type",
            DimensionKind::LicenseStatus => "license_status",
        }
    }

    /// Whether the resolver may create rows for unseen natural keys.
    pub fn is_open(&self) -> bool {
        !matches!(self, DimensionKind::LicenseType)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionIds {
    pub adm_area_id: Option<i64>,
    pub district_id: Option<i64>,
    pub license_type_id: Option<i64>,
    pub license_status_id: Option<i64>,
}

/// Persisted company row, keyed by `global_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRow {
    pub global_id: i64,
    pub dataset_row_number: Option<i64>,
    pub object_name_on_doc: Option<String>,
    pub object_name: Option<String>,
    pub address: Option<String>,
    pub adm_area_id: Option<i64>,
    pub district_id: Option<i64>,
    pub subject_name: Option<String>,
    pub legal_address: Option<String>,
    pub email: Option<String>,
    pub inn: Option<String>,
    pub kpp: Option<String>,
    pub kpp_separate_division: Option<String>,
    pub license_type_id: Option<i64>,
    pub license_number: Option<String>,
    pub license_number_in_registry: Option<String>,
    pub license_begin: Option<NaiveDate>,
    pub license_expire: Option<NaiveDate>,
    pub install_date_of_current_state: Option<NaiveDate>,
    pub date_of_decision: Option<NaiveDate>,
    pub license_status_id: Option<i64>,
    pub licensing_authority: Option<String>,
    pub n_fias: Option<String>,
    pub cadastral_number: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub geo_data_json: Option<JsonValue>,
    pub geo_data_center_json: Option<JsonValue>,
}

impl CompanyRow {
    pub fn from_canonical(record: &NormalizedRecord, ids: DimensionIds) -> Self {
        Self {
            global_id: record.global_id,
            dataset_row_number: record.row_number,
            object_name_on_doc: record.object_name_on_doc.clone(),
            object_name: record.object_name.clone(),
            address: record.address.clone(),
            adm_area_id: ids.adm_area_id,
            district_id: ids.district_id,
            subject_name: record.subject_name.clone(),
            legal_address: record.legal_address.clone(),
            email: record.email.clone(),
            inn: record.inn.clone(),
            kpp: record.kpp.clone(),
            kpp_separate_division: record.kpp_separate_division.clone(),
            license_type_id: ids.license_type_id,
            license_number: record.license_number.clone(),
            license_number_in_registry: record.license_number_in_registry.clone(),
            license_begin: record.license_begin,
            license_expire: record.license_expire,
            install_date_of_current_state: record.install_date,
            date_of_decision: record.decision_date,
            license_status_id: ids.license_status_id,
            licensing_authority: record.licensing_authority.clone(),
            n_fias: record.n_fias.clone(),
            cadastral_number: record.cadastral_number.clone(),
            longitude: record.longitude(),
            latitude: record.latitude(),
            geo_data_json: record.geo_data.clone(),
            geo_data_center_json: record.geo_data_center.clone(),
        }
    }
}

/// Read-side classification of a license by its expiry date. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatusColor {
    Active,
    ExpiringSoon,
    Expired,
}

impl LicenseStatusColor {
    pub fn classify(expire: Option<NaiveDate>, today: NaiveDate) -> Self {
        match expire {
            None => LicenseStatusColor::Expired,
            Some(date) if date < today => LicenseStatusColor::Expired,
            Some(date) if (date - today).num_days() <= EXPIRING_SOON_DAYS => {
                LicenseStatusColor::ExpiringSoon
            }
            Some(_) => LicenseStatusColor::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatusColor::Active => "active",
            LicenseStatusColor::ExpiringSoon => "expiring_soon",
            LicenseStatusColor::Expired => "expired",
        }
    }
}
