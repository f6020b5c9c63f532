//! Registry API adapter: paginated source client + record normalizer.

use async_trait::async_trait;
use lcr_core::RawRecord;
use lcr_storage::{FetchError, HttpFetcher};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use uuid::Uuid;

mod normalize;

pub use normalize::{
    columns, content_hash, extract_coordinates, extract_location, flatten_text, normalize,
    parse_date, parse_date_text,
};

pub const CRATE_NAME: &str = "lcr-adapters";

/// One page of the registry, as far as it could be decoded.
///
/// `received` counts every element of the response array, including the
/// `malformed` ones that could not become a [`RawRecord`]; end-of-data is
/// decided on `received`, not on `records.len()`.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    pub received: usize,
    pub malformed: usize,
}

impl SourcePage {
    pub fn is_last(&self, page_size: usize) -> bool {
        self.received < page_size
    }
}

/// Read-only access to the external registry.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Best-effort total-count probe; any failure reads as `None`.
    async fn count(&self, run_id: Uuid) -> Option<u64>;

    async fn fetch_page(
        &self,
        run_id: Uuid,
        offset: usize,
        page_size: usize,
    ) -> Result<SourcePage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct OpenDataApiConfig {
    pub base_url: String,
    pub dataset_id: u32,
    pub api_key: String,
}

/// Client for the open-data portal's `count` and `rows` endpoints.
#[derive(Debug, Clone)]
pub struct OpenDataApiSource {
    config: OpenDataApiConfig,
    http: HttpFetcher,
}

impl OpenDataApiSource {
    pub fn new(config: OpenDataApiConfig, http: HttpFetcher) -> Self {
        Self { config, http }
    }

    pub fn count_url(&self) -> String {
        format!(
            "{}/datasets/{}/count?api_key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.dataset_id,
            self.config.api_key
        )
    }

    pub fn rows_url(&self, offset: usize, page_size: usize) -> String {
        format!(
            "{}/datasets/{}/rows?$skip={}&$top={}&api_key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.dataset_id,
            offset,
            page_size,
            self.config.api_key
        )
    }
}

#[async_trait]
impl RegistrySource for OpenDataApiSource {
    async fn count(&self, run_id: Uuid) -> Option<u64> {
        match self.http.fetch_bytes(run_id, &self.count_url()).await {
            Ok(resp) => {
                let text = String::from_utf8_lossy(&resp.body);
                let parsed = parse_count(&text);
                if parsed.is_none() {
                    warn!(body = %text.chars().take(200).collect::<String>(), "unparseable count response");
                }
                parsed
            }
            Err(err) => {
                warn!(error = %err, "count probe failed");
                None
            }
        }
    }

    async fn fetch_page(
        &self,
        run_id: Uuid,
        offset: usize,
        page_size: usize,
    ) -> Result<SourcePage, FetchError> {
        let url = self.rows_url(offset, page_size);
        let body: JsonValue = self.http.fetch_json(run_id, &url).await?;
        let page = page_from_json(body);
        debug!(offset, received = page.received, malformed = page.malformed, "page decoded");
        Ok(page)
    }
}

/// Count endpoint answers with a bare or quoted integer.
pub fn parse_count(body: &str) -> Option<u64> {
    body.trim().trim_matches('"').trim().parse().ok()
}

pub fn page_from_json(body: JsonValue) -> SourcePage {
    let JsonValue::Array(items) = body else {
        return SourcePage {
            records: Vec::new(),
            received: 0,
            malformed: 0,
        };
    };
    let received = items.len();
    let records = items
        .into_iter()
        .filter_map(raw_record_from_value)
        .collect::<Vec<_>>();
    SourcePage {
        malformed: received - records.len(),
        records,
        received,
    }
}

/// Build a [`RawRecord`] from one `rows` element. Elements without a usable
/// `global_id` (top level, else inside `Cells`) are rejected.
pub fn raw_record_from_value(value: JsonValue) -> Option<RawRecord> {
    let JsonValue::Object(mut obj) = value else {
        return None;
    };
    let cells = match obj.remove("Cells") {
        Some(JsonValue::Object(cells)) => cells,
        _ => Map::new(),
    };
    let global_id = obj
        .get("global_id")
        .and_then(json_i64)
        .or_else(|| cells.get("global_id").and_then(json_i64))?;
    let row_number = obj.get("Number").and_then(json_i64);
    Some(RawRecord::new(global_id, row_number, cells))
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_accepts_bare_and_quoted_numbers() {
        assert_eq!(parse_count("12345"), Some(12345));
        assert_eq!(parse_count("\"12345\"\n"), Some(12345));
        assert_eq!(parse_count("<html>"), None);
    }

    #[test]
    fn page_decoding_counts_malformed_elements() {
        let body = json!([
            {"global_id": 1, "Number": 1, "Cells": {"INN": "7701"}},
            {"Number": 2, "Cells": {"global_id": "2"}},
            {"Number": 3, "Cells": {"INN": "no id"}},
            "garbage"
        ]);
        let page = page_from_json(body);
        assert_eq!(page.received, 4);
        assert_eq!(page.malformed, 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].global_id, 1);
        assert_eq!(page.records[0].row_number, Some(1));
        assert_eq!(page.records[1].global_id, 2);
        assert!(page.is_last(1000));
        assert!(!page.is_last(4));
    }

    #[test]
    fn non_array_body_is_an_empty_page() {
        let page = page_from_json(json!({"error": "bad key"}));
        assert_eq!(page.received, 0);
        assert!(page.is_last(1));
    }

    #[test]
    fn urls_follow_the_portal_layout() {
        let http = HttpFetcher::new(Default::default()).expect("http");
        let source = OpenDataApiSource::new(
            OpenDataApiConfig {
                base_url: "https://apidata.mos.ru/v1/".into(),
                dataset_id: 586,
                api_key: "k".into(),
            },
            http,
        );
        assert_eq!(
            source.count_url(),
            "https://apidata.mos.ru/v1/datasets/586/count?api_key=k"
        );
        assert_eq!(
            source.rows_url(2000, 1000),
            "https://apidata.mos.ru/v1/datasets/586/rows?$skip=2000&$top=1000&api_key=k"
        );
    }
}
