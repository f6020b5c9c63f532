use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lcr_core::{CompanyRow, DimensionKind};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Persistence primitives the sync pipeline writes through.
///
/// `insert_dimension` returns `None` when a unique-constraint conflict swallowed
/// the insert; callers re-run `find_dimension` to pick up the winning row.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn find_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>>;

    async fn insert_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>>;

    async fn upsert_company(&self, row: &CompanyRow) -> Result<UpsertOutcome>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Lazily connected pool; connectivity problems surface on first use (`ping`).
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("applying schema.sql")?;
        info!("schema ready");
        Ok(())
    }

    pub async fn seed_license_types(&self, seeds: &[LicenseTypeSeed]) -> Result<usize> {
        let mut written = 0usize;
        for seed in seeds {
            sqlx::query(
                r#"
                INSERT INTO license_types (code, name)
                VALUES ($1, $2)
                ON CONFLICT (code) DO UPDATE
                   SET name = EXCLUDED.name
                "#,
            )
            .bind(seed.code.trim())
            .bind(seed.name.trim())
            .execute(&self.pool)
            .await
            .with_context(|| format!("seeding license type {}", seed.code))?;
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl CompanyStore for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("pinging target store")?;
        Ok(())
    }

    async fn find_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>> {
        let row = match kind {
            DimensionKind::AdmArea => {
                sqlx::query("SELECT id FROM adm_areas WHERE name = $1")
                    .bind(natural_key)
                    .fetch_optional(&self.pool)
                    .await?
            }
            DimensionKind::District => {
                sqlx::query("SELECT id FROM districts WHERE adm_area_id = $1 AND name = $2")
                    .bind(parent_id)
                    .bind(natural_key)
                    .fetch_optional(&self.pool)
                    .await?
            }
            DimensionKind::LicenseType => {
                sqlx::query("SELECT id FROM license_types WHERE code = $1")
                    .bind(natural_key)
                    .fetch_optional(&self.pool)
                    .await?
            }
            DimensionKind::LicenseStatus => {
                sqlx::query("SELECT id FROM license_statuses WHERE status = $1")
                    .bind(natural_key)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .with_context(|| format!("reading {} id", kind.as_str()))
    }

    async fn insert_dimension(
        &self,
        kind: DimensionKind,
        parent_id: Option<i64>,
        natural_key: &str,
    ) -> Result<Option<i64>> {
        let row = match kind {
            DimensionKind::AdmArea => {
                sqlx::query(
                    "INSERT INTO adm_areas (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id",
                )
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionKind::District => {
                let Some(parent_id) = parent_id else {
                    bail!("district {natural_key:?} requires an adm_area id");
                };
                sqlx::query(
                    r#"
                    INSERT INTO districts (adm_area_id, name)
                    VALUES ($1, $2)
                    ON CONFLICT (adm_area_id, name) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(parent_id)
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionKind::LicenseType => {
                bail!("license types are seeded, refusing to create {natural_key:?}");
            }
            DimensionKind::LicenseStatus => {
                sqlx::query(
                    "INSERT INTO license_statuses (status) VALUES ($1) ON CONFLICT (status) DO NOTHING RETURNING id",
                )
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .with_context(|| format!("reading inserted {} id", kind.as_str()))
    }

    async fn upsert_company(&self, row: &CompanyRow) -> Result<UpsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO companies (
                global_id, dataset_row_number, object_name_on_doc, object_name, address,
                adm_area_id, district_id, subject_name, legal_address, email,
                inn, kpp, kpp_separate_division, license_type_id, license_number,
                license_number_in_registry, license_begin, license_expire,
                install_date_of_current_state, date_of_decision, license_status_id,
                licensing_authority, n_fias, cadastral_number,
                longitude, latitude, geo_data_json, geo_data_center_json
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27, $28
            )
            ON CONFLICT (global_id) DO UPDATE SET
                dataset_row_number = EXCLUDED.dataset_row_number,
                object_name_on_doc = EXCLUDED.object_name_on_doc,
                object_name = EXCLUDED.object_name,
                address = EXCLUDED.address,
                adm_area_id = EXCLUDED.adm_area_id,
                district_id = EXCLUDED.district_id,
                subject_name = EXCLUDED.subject_name,
                legal_address = EXCLUDED.legal_address,
                email = EXCLUDED.email,
                inn = EXCLUDED.inn,
                kpp = EXCLUDED.kpp,
                kpp_separate_division = EXCLUDED.kpp_separate_division,
                license_type_id = EXCLUDED.license_type_id,
                license_number = EXCLUDED.license_number,
                license_number_in_registry = EXCLUDED.license_number_in_registry,
                license_begin = EXCLUDED.license_begin,
                license_expire = EXCLUDED.license_expire,
                install_date_of_current_state = EXCLUDED.install_date_of_current_state,
                date_of_decision = EXCLUDED.date_of_decision,
                license_status_id = EXCLUDED.license_status_id,
                licensing_authority = EXCLUDED.licensing_authority,
                n_fias = EXCLUDED.n_fias,
                cadastral_number = EXCLUDED.cadastral_number,
                longitude = EXCLUDED.longitude,
                latitude = EXCLUDED.latitude,
                geo_data_json = EXCLUDED.geo_data_json,
                geo_data_center_json = EXCLUDED.geo_data_center_json,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(row.global_id)
        .bind(row.dataset_row_number)
        .bind(&row.object_name_on_doc)
        .bind(&row.object_name)
        .bind(&row.address)
        .bind(row.adm_area_id)
        .bind(row.district_id)
        .bind(&row.subject_name)
        .bind(&row.legal_address)
        .bind(&row.email)
        .bind(&row.inn)
        .bind(&row.kpp)
        .bind(&row.kpp_separate_division)
        .bind(row.license_type_id)
        .bind(&row.license_number)
        .bind(&row.license_number_in_registry)
        .bind(row.license_begin)
        .bind(row.license_expire)
        .bind(row.install_date_of_current_state)
        .bind(row.date_of_decision)
        .bind(row.license_status_id)
        .bind(&row.licensing_authority)
        .bind(&row.n_fias)
        .bind(&row.cadastral_number)
        .bind(row.longitude)
        .bind(row.latitude)
        .bind(&row.geo_data_json)
        .bind(&row.geo_data_center_json)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting company global_id={}", row.global_id))?;

        let inserted: bool = result.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseTypeSeedFile {
    pub license_types: Vec<LicenseTypeSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseTypeSeed {
    pub code: String,
    pub name: String,
}

pub fn load_license_type_seeds(path: impl AsRef<Path>) -> Result<Vec<LicenseTypeSeed>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: LicenseTypeSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let seeds = parsed
        .license_types
        .into_iter()
        .filter(|s| !s.code.trim().is_empty())
        .collect();
    Ok(seeds)
}
