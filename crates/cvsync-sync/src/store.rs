//! Storage seams for the pipeline. `PgStore` is the production implementation;
//! tests run against an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvsync_core::DerivedComponentRecord;
use thiserror::Error;

/// Column the loader adds to every staged table for keyset pagination.
pub const ROW_ID_COLUMN: &str = "_row_id";

/// PostgreSQL truncates longer names silently.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{0}")]
    Backend(String),
}

/// Accept lowercase SQL identifiers only; everything the loader interpolates
/// into DDL passes through here first.
pub fn validate_identifier(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= 48 {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

pub fn staging_table_name(canonical: &str) -> String {
    format!("{canonical}_staging")
}

/// Handle to a staging table created for one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingHandle {
    pub canonical: String,
    pub staging: String,
    pub columns: Vec<String>,
    pub index_columns: Vec<String>,
}

impl StagingHandle {
    pub fn new(canonical: &str, columns: &[String], index_columns: &[String]) -> Result<Self, StorageError> {
        validate_identifier(canonical)?;
        for column in columns {
            validate_identifier(column)?;
            if column == ROW_ID_COLUMN {
                return Err(StorageError::InvalidIdentifier(column.clone()));
            }
        }
        let index_columns = index_columns
            .iter()
            .filter(|c| columns.contains(c))
            .cloned()
            .collect();
        let handle = Self {
            canonical: canonical.to_string(),
            staging: staging_table_name(canonical),
            columns: columns.to_vec(),
            index_columns,
        };
        if let Some((too_long, _)) = handle
            .index_names()
            .into_iter()
            .find(|(staging_index, _)| staging_index.len() > MAX_IDENTIFIER_LEN)
        {
            return Err(StorageError::InvalidIdentifier(too_long));
        }
        Ok(handle)
    }

    /// `(staging index name, canonical index name)` pairs, row-id index first.
    pub fn index_names(&self) -> Vec<(String, String)> {
        let mut out = vec![(
            format!("{}_row_id_idx", self.staging),
            format!("{}_row_id_idx", self.canonical),
        )];
        for column in &self.index_columns {
            out.push((
                format!("{}_{column}_idx", self.staging),
                format!("{}_{column}_idx", self.canonical),
            ));
        }
        out
    }
}

/// One data line, already split and padded to the staging column count.
/// `None` fields are stored as NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub row_id: i64,
    pub fields: Vec<Option<String>>,
}

#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Create (or recreate) the staging table for `canonical`.
    async fn create_staging(
        &self,
        canonical: &str,
        columns: &[String],
        index_columns: &[String],
    ) -> Result<StagingHandle, StorageError>;

    async fn append_batch(&self, handle: &StagingHandle, rows: &[StagedRow]) -> Result<(), StorageError>;

    /// Index the staging table and swap it in as the canonical table in a
    /// single transaction.
    async fn promote(&self, handle: &StagingHandle) -> Result<(), StorageError>;

    /// Drop the staging table. The canonical table is never touched.
    async fn rollback(&self, handle: &StagingHandle) -> Result<(), StorageError>;
}

/// `variation_id` and `name` of one canonical row, as stored (text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRow {
    pub row_id: i64,
    pub variation_id: Option<String>,
    pub name: Option<String>,
}

#[async_trait]
pub trait DerivedStore: Send + Sync {
    async fn truncate_components(&self) -> Result<(), StorageError>;

    /// Rows of `source_table` with `_row_id > after_row_id`, ascending.
    async fn fetch_name_page(
        &self,
        source_table: &str,
        after_row_id: i64,
        limit: i64,
    ) -> Result<Vec<NameRow>, StorageError>;

    /// Insert rows, ignoring variation ids already present. Returns rows
    /// actually inserted.
    async fn insert_components(&self, rows: &[DerivedComponentRecord]) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait GeneCountStore: Send + Sync {
    /// Distinct gene symbols from the component table and existing counts.
    async fn list_gene_symbols(&self) -> Result<Vec<String>, StorageError>;

    async fn upsert_gene_count(
        &self,
        gene_symbol: &str,
        count: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}
