use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvsync_core::DerivedComponentRecord;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::store::{
    quote_ident, validate_identifier, BulkLoader, DerivedStore, GeneCountStore, NameRow, StagedRow,
    StagingHandle, StorageError, ROW_ID_COLUMN,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// PostgreSQL-backed implementation of every storage seam.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<(), StorageError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BulkLoader for PgStore {
    async fn create_staging(
        &self,
        canonical: &str,
        columns: &[String],
        index_columns: &[String],
    ) -> Result<StagingHandle, StorageError> {
        let handle = StagingHandle::new(canonical, columns, index_columns)?;
        let staging = quote_ident(&handle.staging);

        self.execute(&format!("DROP TABLE IF EXISTS {staging}")).await?;

        let mut column_defs = vec![format!("{} BIGINT NOT NULL", quote_ident(ROW_ID_COLUMN))];
        column_defs.extend(handle.columns.iter().map(|c| format!("{} TEXT", quote_ident(c))));
        self.execute(&format!(
            "CREATE TABLE {staging} ({})",
            column_defs.join(", ")
        ))
        .await?;
        Ok(handle)
    }

    async fn append_batch(&self, handle: &StagingHandle, rows: &[StagedRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let column_list = std::iter::once(ROW_ID_COLUMN)
            .chain(handle.columns.iter().map(String::as_str))
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "COPY {} ({column_list}) FROM STDIN",
            quote_ident(&handle.staging)
        );

        let payload = copy_text_payload(rows);
        let mut copy = self.pool.copy_in_raw(&statement).await?;
        copy.send(payload.into_bytes()).await?;
        let copied = copy.finish().await?;
        debug!(staging = %handle.staging, rows = copied, "copied batch");
        Ok(())
    }

    async fn promote(&self, handle: &StagingHandle) -> Result<(), StorageError> {
        let staging = quote_ident(&handle.staging);
        let canonical = quote_ident(&handle.canonical);
        let index_names = handle.index_names();

        // Build indexes outside the swap transaction.
        for (i, (staging_index, _)) in index_names.iter().enumerate() {
            let (unique, column) = match i {
                0 => ("UNIQUE ", ROW_ID_COLUMN),
                _ => ("", handle.index_columns[i - 1].as_str()),
            };
            self.execute(&format!(
                "CREATE {unique}INDEX {} ON {staging} ({})",
                quote_ident(staging_index),
                quote_ident(column)
            ))
            .await?;
        }
        self.execute(&format!("ANALYZE {staging}")).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {canonical}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ALTER TABLE {staging} RENAME TO {canonical}"))
            .execute(&mut *tx)
            .await?;
        for (staging_index, canonical_index) in &index_names {
            sqlx::query(&format!(
                "ALTER INDEX {} RENAME TO {}",
                quote_ident(staging_index),
                quote_ident(canonical_index)
            ))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(table = %handle.canonical, "swapped staging table into place");
        Ok(())
    }

    async fn rollback(&self, handle: &StagingHandle) -> Result<(), StorageError> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&handle.staging)))
            .await
    }
}

#[async_trait]
impl DerivedStore for PgStore {
    async fn truncate_components(&self) -> Result<(), StorageError> {
        self.execute("TRUNCATE TABLE variant_components").await
    }

    async fn fetch_name_page(
        &self,
        source_table: &str,
        after_row_id: i64,
        limit: i64,
    ) -> Result<Vec<NameRow>, StorageError> {
        validate_identifier(source_table)?;
        let sql = format!(
            "SELECT _row_id, variation_id, name FROM {} WHERE _row_id > $1 ORDER BY _row_id LIMIT $2",
            quote_ident(source_table)
        );
        let rows = sqlx::query(&sql)
            .bind(after_row_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(NameRow {
                row_id: row.try_get("_row_id")?,
                variation_id: row.try_get("variation_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn insert_components(&self, rows: &[DerivedComponentRecord]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.variation_id).collect();
        let genes: Vec<String> = rows.iter().map(|r| r.gene_symbol.clone()).collect();
        let transcripts: Vec<String> = rows.iter().map(|r| r.transcript_id.clone()).collect();
        let dna: Vec<String> = rows.iter().map(|r| r.dna_change.clone()).collect();
        let protein: Vec<Option<String>> = rows.iter().map(|r| r.protein_change.clone()).collect();

        let result = sqlx::query(
            r#"
            WITH input AS (
                SELECT UNNEST($1::bigint[]) AS variation_id,
                       UNNEST($2::text[])   AS gene_symbol,
                       UNNEST($3::text[])   AS transcript_id,
                       UNNEST($4::text[])   AS dna_change,
                       UNNEST($5::text[])   AS protein_change
            )
            INSERT INTO variant_components
                (variation_id, gene_symbol, transcript_id, dna_change, protein_change)
            SELECT variation_id, gene_symbol, transcript_id, dna_change, protein_change FROM input
            ON CONFLICT (variation_id) DO NOTHING
            "#,
        )
        .persistent(false)
        .bind(&ids)
        .bind(&genes)
        .bind(&transcripts)
        .bind(&dna)
        .bind(&protein)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl GeneCountStore for PgStore {
    async fn list_gene_symbols(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT gene_symbol FROM variant_components
            UNION
            SELECT gene_symbol FROM gene_variant_counts
            ORDER BY gene_symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("gene_symbol")?);
        }
        Ok(out)
    }

    async fn upsert_gene_count(
        &self,
        gene_symbol: &str,
        count: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO gene_variant_counts (gene_symbol, count, last_updated)
            VALUES ($1, $2, $3)
            ON CONFLICT (gene_symbol) DO UPDATE
            SET count = EXCLUDED.count,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(gene_symbol)
        .bind(count)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Render rows in COPY text format: tab-separated, `\N` for NULL.
pub fn copy_text_payload(rows: &[StagedRow]) -> String {
    let mut out = String::with_capacity(rows.len() * 128);
    for row in rows {
        out.push_str(&row.row_id.to_string());
        for field in &row.fields {
            out.push('\t');
            match field {
                Some(value) => out.push_str(&escape_copy_text(value)),
                None => out.push_str("\\N"),
            }
        }
        out.push('\n');
    }
    out
}

fn escape_copy_text(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
        .replace('"', "\\\"")
}
