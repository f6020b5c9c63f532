//! Raw registry row -> [`NormalizedRecord`].
//!
//! Normalization is total: every field degrades to `None` on its own when the
//! cell is missing or unusable, and no input makes the whole record fail.

use chrono::NaiveDate;
use lcr_core::{GeoPoint, NormalizedRecord, RawRecord};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Source column names.
pub mod columns {
    pub const OBJECT_NAME_ON_DOC: &str = "ObjectNameOnDoc";
    pub const OBJECT_NAME: &str = "ObjectName";
    pub const ADDRESS: &str = "Address";
    pub const ADM_AREA: &str = "AdmArea";
    pub const DISTRICT: &str = "District";
    pub const SUBJECT_NAME: &str = "SubjectName";
    pub const LEGAL_ADDRESS: &str = "LegalAddress";
    pub const EMAIL: &str = "Email";
    pub const INN: &str = "INN";
    pub const KPP: &str = "KPP";
    pub const KPP_SEPARATE_DIVISION: &str = "KPPSeparateDivision";
    pub const JOB_TYPE: &str = "JobType";
    pub const LICENSE_NUMBER: &str = "LicenseNumber";
    pub const LICENSE_NUMBER_IN_REGISTRY: &str = "LicenseNumberInRegistry";
    pub const LICENSE_BEGIN: &str = "LicenseBegin";
    pub const LICENSE_EXPIRE: &str = "LicenseExpire";
    pub const INSTALL_DATE: &str = "InstallDateOfCurrentLicenseState";
    pub const DATE_OF_DECISION: &str = "DateOfDecision";
    pub const CURRENT_LICENSE_STATE: &str = "CurrentLicenseState";
    pub const LICENSING_AUTHORITY: &str = "NameOfLicensingAuthority";
    pub const N_FIAS: &str = "N_FIAS";
    pub const CADASTRAL_NUMBER: &str = "CadastralNumber";
    pub const GEO_DATA: &str = "geoData";
    pub const GEO_DATA_CENTER: &str = "geodata_center";
}

/// Soft-delete marker carried by nested list items; never part of the text.
const IS_DELETED: &str = "is_deleted";

pub fn normalize(raw: &RawRecord) -> NormalizedRecord {
    let text = |name: &str| raw.cell(name).and_then(flatten_text);
    let date = |name: &str| raw.cell(name).and_then(parse_date);

    let geo_data = raw.cell(columns::GEO_DATA).cloned();
    let geo_data_center = raw.cell(columns::GEO_DATA_CENTER).cloned();
    let location = extract_location(geo_data.as_ref(), geo_data_center.as_ref());

    NormalizedRecord {
        global_id: raw.global_id,
        row_number: raw.row_number,
        content_hash: content_hash(&raw.cells),
        object_name_on_doc: text(columns::OBJECT_NAME_ON_DOC),
        object_name: text(columns::OBJECT_NAME),
        address: text(columns::ADDRESS),
        adm_area: text(columns::ADM_AREA),
        district: text(columns::DISTRICT),
        subject_name: text(columns::SUBJECT_NAME),
        legal_address: text(columns::LEGAL_ADDRESS),
        email: text(columns::EMAIL),
        inn: text(columns::INN),
        kpp: text(columns::KPP),
        kpp_separate_division: text(columns::KPP_SEPARATE_DIVISION),
        license_type_code: text(columns::JOB_TYPE),
        license_number: text(columns::LICENSE_NUMBER),
        license_number_in_registry: text(columns::LICENSE_NUMBER_IN_REGISTRY),
        license_begin: date(columns::LICENSE_BEGIN),
        license_expire: date(columns::LICENSE_EXPIRE),
        install_date: date(columns::INSTALL_DATE),
        decision_date: date(columns::DATE_OF_DECISION),
        license_status: text(columns::CURRENT_LICENSE_STATE),
        licensing_authority: text(columns::LICENSING_AUTHORITY),
        n_fias: text(columns::N_FIAS),
        cadastral_number: text(columns::CADASTRAL_NUMBER),
        geo_data,
        geo_data_center,
        location,
    }
}

/// Scalar text for a cell. Collections flatten to `", "`-joined text.
pub fn flatten_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => non_empty(s.trim()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => join_parts(items.iter().filter_map(flatten_text)),
        JsonValue::Object(map) => join_parts(
            map.iter()
                .filter(|(key, _)| key.as_str() != IS_DELETED)
                .filter_map(|(_, v)| flatten_text(v)),
        ),
    }
}

fn join_parts(parts: impl Iterator<Item = String>) -> Option<String> {
    let joined = parts.collect::<Vec<_>>().join(", ");
    non_empty(&joined)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn parse_date(value: &JsonValue) -> Option<NaiveDate> {
    value.as_str().and_then(parse_date_text)
}

/// `DD.MM.YYYY`, `YYYY-MM-DD`, or an ISO date-time (time of day dropped).
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    // Day first: the first dot closes a one- or two-digit day.
    if matches!(text.find('.'), Some(1 | 2)) {
        return NaiveDate::parse_from_str(text, "%d.%m.%Y").ok();
    }
    let date_part = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Primary geometry first, then the fallback.
pub fn extract_location(primary: Option<&JsonValue>, fallback: Option<&JsonValue>) -> Option<GeoPoint> {
    extract_coordinates(primary).or_else(|| extract_coordinates(fallback))
}

/// Accepts `{ "coordinates": [lon, lat, ..] }` or a bare `[lon, lat, ..]`.
/// A geometry serialized as a JSON string is decoded once first.
pub fn extract_coordinates(geo: Option<&JsonValue>) -> Option<GeoPoint> {
    match geo? {
        JsonValue::Object(obj) => obj.get("coordinates").and_then(coordinate_pair),
        JsonValue::Array(_) => coordinate_pair(geo?),
        JsonValue::String(s) => {
            let decoded: JsonValue = serde_json::from_str(s).ok()?;
            match decoded {
                JsonValue::String(_) => None,
                other => extract_coordinates(Some(&other)),
            }
        }
        _ => None,
    }
}

fn coordinate_pair(value: &JsonValue) -> Option<GeoPoint> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    let longitude = coordinate_number(&items[0])?;
    let latitude = coordinate_number(&items[1])?;
    Some(GeoPoint {
        longitude,
        latitude,
    })
}

fn coordinate_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// SHA-256 over the cells' JSON with object keys sorted at every level, so
/// equal cells hash equal regardless of delivery order.
pub fn content_hash(cells: &Map<String, JsonValue>) -> String {
    let canonical = sorted_keys(&JsonValue::Object(cells.clone()));
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn sorted_keys(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            JsonValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}
