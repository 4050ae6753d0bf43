//! Postgres backend for entries, assessments, the maintenance queue and the
//! sync watermark.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;
use vpo_core::scoring::offer_total;
use vpo_core::{AssessmentAttributes, ContentMap, InspectionEntry, InspectionStatus};

use crate::entries::{
    external_id_of, AssessmentStore, EntryContext, EntryStore, EntryValidator, InspectionQueue,
    StoreError,
};
use crate::watermark::WatermarkStore;

const LEAD_SYNC_WATERMARK: &str = "lead_sync";

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    validator: EntryValidator,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            validator: EntryValidator::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn entry_from_row(row: &PgRow) -> anyhow::Result<InspectionEntry> {
    let status: String = row.try_get("status")?;
    let content: Json<ContentMap> = row.try_get("content")?;
    Ok(InspectionEntry {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        status: InspectionStatus::parse(&status)
            .with_context(|| format!("unknown inspection status '{status}'"))?,
        owner_id: row.try_get("owner_id")?,
        inspector_email: row.try_get("inspector_email")?,
        sales_consultant_email: row.try_get("sales_consultant_email")?,
        content: content.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl EntryStore for PgStore {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM inspection_entries WHERE external_id = $1)",
        )
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .context("checking inspection entry existence")?;
        Ok(exists)
    }

    async fn resolve_context(
        &self,
        owner_handle: &str,
        entry_type: &str,
    ) -> Result<EntryContext, StoreError> {
        let owner_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM system_users WHERE handle = $1")
                .bind(owner_handle)
                .fetch_optional(&self.pool)
                .await
                .context("resolving system owner")?;
        let owner_id = owner_id
            .with_context(|| format!("system owner '{owner_handle}' is not provisioned"))?;

        let known_type: Option<String> =
            sqlx::query_scalar("SELECT handle FROM entry_types WHERE handle = $1")
                .bind(entry_type)
                .fetch_optional(&self.pool)
                .await
                .context("resolving entry type")?;
        let entry_type =
            known_type.with_context(|| format!("entry type '{entry_type}' is not configured"))?;

        Ok(EntryContext {
            owner_id,
            entry_type,
        })
    }

    async fn create_entry(
        &self,
        ctx: &EntryContext,
        content: &ContentMap,
    ) -> Result<Uuid, StoreError> {
        let errors = self.validator.validate(content);
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        let external_id = external_id_of(content)
            .context("content has no external id")?
            .to_string();
        let text = |key: &str| content.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO inspection_entries
                (id, external_id, entry_type, owner_id, status,
                 inspector_email, sales_consultant_email, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&external_id)
        .bind(&ctx.entry_type)
        .bind(&ctx.owner_id)
        .bind(InspectionStatus::Unassigned.as_str())
        .bind(text("inspectorEmail"))
        .bind(text("salesConsultantEmail"))
        .bind(Json(content))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateExternalId(external_id))
            }
            Err(err) => Err(StoreError::Backend(
                anyhow::Error::new(err).context("inserting inspection entry"),
            )),
        }
    }
}

#[async_trait]
impl AssessmentStore for PgStore {
    async fn load_assessment(&self, entry_id: Uuid) -> anyhow::Result<Option<AssessmentAttributes>> {
        let attrs: Option<Json<AssessmentAttributes>> = sqlx::query_scalar(
            "SELECT attributes FROM inspection_assessments WHERE entry_id = $1",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading assessment for {entry_id}"))?;
        Ok(attrs.map(|json| json.0))
    }

    async fn save_assessment(
        &self,
        entry_id: Uuid,
        attrs: &AssessmentAttributes,
        offer_total: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inspection_assessments (entry_id, attributes, offer_total, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (entry_id) DO UPDATE
               SET attributes = EXCLUDED.attributes,
                   offer_total = EXCLUDED.offer_total,
                   updated_at = NOW()
            "#,
        )
        .bind(entry_id)
        .bind(Json(attrs))
        .bind(offer_total)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving assessment for {entry_id}"))?;
        Ok(())
    }

    async fn apply_review(
        &self,
        entry_id: Uuid,
        review_price: f64,
        review_valuation: f64,
    ) -> anyhow::Result<Option<f64>> {
        let mut tx = self.pool.begin().await.context("starting review transaction")?;
        let attrs: Option<Json<AssessmentAttributes>> = sqlx::query_scalar(
            "SELECT attributes FROM inspection_assessments WHERE entry_id = $1 FOR UPDATE",
        )
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("locking assessment for {entry_id}"))?;
        let Some(Json(mut attrs)) = attrs else {
            return Ok(None);
        };

        attrs.review_price = Some(review_price);
        attrs.review_valuation = Some(review_valuation);
        let total = offer_total(&attrs);
        sqlx::query(
            r#"
            UPDATE inspection_assessments
               SET attributes = $2, offer_total = $3, updated_at = NOW()
             WHERE entry_id = $1
            "#,
        )
        .bind(entry_id)
        .bind(Json(&attrs))
        .bind(total)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("recording review for {entry_id}"))?;
        tx.commit().await.context("committing review")?;
        Ok(Some(total))
    }
}

#[async_trait]
impl InspectionQueue for PgStore {
    async fn stale_entries(
        &self,
        status: InspectionStatus,
        updated_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<InspectionEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, status, owner_id, inspector_email,
                   sales_consultant_email, content, created_at, updated_at
              FROM inspection_entries
             WHERE status = $1
               AND updated_at <= $2
             ORDER BY updated_at
            "#,
        )
        .bind(status.as_str())
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("selecting stale {status} entries"))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn transition(
        &self,
        entry_id: Uuid,
        to: InspectionStatus,
        clear_inspector: bool,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE inspection_entries
               SET status = $2,
                   inspector_email = CASE WHEN $3 THEN NULL ELSE inspector_email END,
                   updated_at = $4
             WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(to.as_str())
        .bind(clear_inspector)
        .bind(at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("moving {entry_id} to {to}"))?;
        anyhow::ensure!(result.rows_affected() == 1, "inspection entry {entry_id} not found");
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar("SELECT synced_until FROM sync_watermarks WHERE name = $1")
            .bind(LEAD_SYNC_WATERMARK)
            .fetch_optional(&self.pool)
            .await
            .context("loading sync watermark")
    }

    async fn store(&self, synced_until: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (name, synced_until, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
               SET synced_until = GREATEST(sync_watermarks.synced_until, EXCLUDED.synced_until),
                   updated_at = NOW()
            "#,
        )
        .bind(LEAD_SYNC_WATERMARK)
        .bind(synced_until)
        .execute(&self.pool)
        .await
        .context("storing sync watermark")?;
        Ok(())
    }
}
