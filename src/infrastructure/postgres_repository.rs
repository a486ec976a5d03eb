// Postgres repository implementation
use crate::application::formula_repository::{
    FormulaRef, FormulaRepository, GroupMembership, MembershipRow,
};
use crate::application::meter_repository::{BucketRow, MeterValueRepository, RawRow};
use crate::domain::formula::FormulaSelector;
use crate::domain::series::SeriesKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(8))
            .connect_lazy(database_url)
            .context("failed to create database pool")?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct RawRecord {
    value_timestamp: DateTime<Utc>,
    value: Option<String>,
}

#[derive(sqlx::FromRow)]
struct BucketRecord {
    bucket: DateTime<Utc>,
    average: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct FormulaRecord {
    id: i64,
    name: String,
}

#[derive(sqlx::FromRow)]
struct MembershipRecord {
    group_id: i64,
    group_name: String,
    sequence: i32,
}

#[derive(sqlx::FromRow)]
struct ChainRecord {
    formula_id: i64,
    name: String,
    unit: Option<String>,
    sequence: i32,
    expression: String,
}

#[async_trait]
impl MeterValueRepository for PostgresRepository {
    async fn scan_series(
        &self,
        key: &SeriesKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<RawRow>> {
        let rows: Vec<RawRecord> = sqlx::query_as(
            r#"
            SELECT value_timestamp, value
            FROM meter_value
            WHERE device = $1
              AND module_id = $2
              AND input_id = $3
              AND value_timestamp >= $4
              AND value_timestamp < $5
            ORDER BY value_timestamp ASC
            "#,
        )
        .bind(&key.device)
        .bind(key.module_id)
        .bind(key.input_id)
        .bind(start_at)
        .bind(end_at)
        .fetch_all(&self.pool)
        .await
        .context("raw series scan failed")?;

        Ok(rows
            .into_iter()
            .map(|row| RawRow {
                timestamp: row.value_timestamp,
                raw_value: row.value,
            })
            .collect())
    }

    async fn aggregate_series(
        &self,
        key: &SeriesKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        bucket_seconds: i64,
        statement_timeout_ms: u64,
    ) -> Result<Vec<BucketRow>> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        // SET LOCAL scopes the timeout to this transaction so the store
        // cancels a runaway aggregate by itself. The value cannot be bound
        // as a parameter; it is a clamped integer, never caller text.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {statement_timeout_ms}"
        ))
        .execute(&mut *tx)
        .await
        .context("statement_timeout failed")?;

        // Non-numeric readings are excluded at the WHERE clause so the
        // average stays fast and never errors on cast.
        let rows: Vec<BucketRecord> = sqlx::query_as(
            r#"
            SELECT
              to_timestamp(floor(extract(epoch FROM value_timestamp) / $4) * $4) AS bucket,
              avg(value::numeric)::float8 AS average
            FROM meter_value
            WHERE device = $1
              AND module_id = $2
              AND input_id = $3
              AND value_timestamp >= $5
              AND value_timestamp < $6
              AND value ~ '^-?[0-9]+(\.[0-9]+)?$'
            GROUP BY 1
            ORDER BY 1 ASC
            "#,
        )
        .bind(&key.device)
        .bind(key.module_id)
        .bind(key.input_id)
        .bind(bucket_seconds)
        .bind(start_at)
        .bind(end_at)
        .fetch_all(&mut *tx)
        .await
        .context("grouped aggregate failed")?;

        tx.commit().await.context("commit failed")?;

        Ok(rows
            .into_iter()
            .map(|row| BucketRow {
                bucket_start: row.bucket,
                average: row.average,
            })
            .collect())
    }
}

#[async_trait]
impl FormulaRepository for PostgresRepository {
    async fn find_formula(&self, selector: &FormulaSelector) -> Result<Option<FormulaRef>> {
        let record: Option<FormulaRecord> = match selector {
            FormulaSelector::Id(id) => {
                sqlx::query_as("SELECT id, name FROM formula WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            }
            FormulaSelector::Name(name) => {
                sqlx::query_as("SELECT id, name FROM formula WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .context("formula lookup failed")?;

        Ok(record.map(|row| FormulaRef {
            id: row.id,
            name: row.name,
        }))
    }

    async fn find_enabled_membership(&self, formula_id: i64) -> Result<Option<GroupMembership>> {
        let record: Option<MembershipRecord> = sqlx::query_as(
            r#"
            SELECT fog.group_id, fg.name AS group_name, fog.sequence
            FROM formula_on_group fog
            JOIN formula_group fg ON fg.id = fog.group_id
            WHERE fog.formula_id = $1
              AND fog.enable
            ORDER BY fog.sequence DESC
            LIMIT 1
            "#,
        )
        .bind(formula_id)
        .fetch_optional(&self.pool)
        .await
        .context("group membership lookup failed")?;

        Ok(record.map(|row| GroupMembership {
            group_id: row.group_id,
            group_name: row.group_name,
            sequence: row.sequence,
        }))
    }

    async fn list_enabled_memberships(&self, group_id: i64) -> Result<Vec<MembershipRow>> {
        let rows: Vec<ChainRecord> = sqlx::query_as(
            r#"
            SELECT fog.formula_id, f.name, f.unit, fog.sequence, f.expression
            FROM formula_on_group fog
            JOIN formula f ON f.id = fog.formula_id
            WHERE fog.group_id = $1
              AND fog.enable
            ORDER BY fog.sequence ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("group chain listing failed")?;

        Ok(rows
            .into_iter()
            .map(|row| MembershipRow {
                formula_id: row.formula_id,
                name: row.name,
                unit: row.unit,
                sequence: row.sequence,
                expression: row.expression,
            })
            .collect())
    }
}
