use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use cvsync_core::{DerivedComponentRecord, DerivedStats, NomenclatureParser, ParseRejection};
use cvsync_storage::ParseFailureLog;
use tracing::{debug, info};

use crate::store::{DerivedStore, NameRow};

/// Rebuilds `variant_components` from the canonical variant table.
#[derive(Debug, Clone)]
pub struct DerivedTableBuilder {
    parser: NomenclatureParser,
    source_table: String,
    page_size: i64,
}

impl DerivedTableBuilder {
    pub fn new(parser: NomenclatureParser, source_table: impl Into<String>, page_size: i64) -> Self {
        Self {
            parser,
            source_table: source_table.into(),
            page_size: page_size.max(1),
        }
    }

    /// Truncate and repopulate. Unparseable rows go to `failures`; duplicate
    /// variation ids keep their first occurrence.
    pub async fn rebuild(
        &self,
        store: &dyn DerivedStore,
        failures: &mut ParseFailureLog,
    ) -> Result<DerivedStats> {
        let started = Instant::now();
        let mut stats = DerivedStats::default();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut after_row_id = 0i64;

        store
            .truncate_components()
            .await
            .context("truncating variant_components")?;

        loop {
            let page = store
                .fetch_name_page(&self.source_table, after_row_id, self.page_size)
                .await
                .with_context(|| format!("reading {} after row {after_row_id}", self.source_table))?;
            let Some(last) = page.last() else {
                break;
            };
            after_row_id = last.row_id;

            let mut batch = Vec::with_capacity(page.len());
            for row in &page {
                stats.rows_scanned += 1;
                match self.derive_row(row) {
                    Ok(record) => {
                        if seen.insert(record.variation_id) {
                            batch.push(record);
                        } else {
                            stats.duplicate_ids += 1;
                        }
                    }
                    Err(rejection) => {
                        stats.parse_failures += 1;
                        failures
                            .record(
                                &failure_key(row),
                                rejection.reason_code(),
                                row.name.as_deref().unwrap_or(""),
                            )
                            .await?;
                    }
                }
            }

            let inserted = store
                .insert_components(&batch)
                .await
                .context("inserting variant_components batch")?;
            stats.rows_inserted += inserted;
            debug!(after_row_id, inserted, "derived page");
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = stats.rows_scanned,
            inserted = stats.rows_inserted,
            duplicates = stats.duplicate_ids,
            parse_failures = stats.parse_failures,
            "rebuilt variant_components"
        );
        Ok(stats)
    }

    fn derive_row(&self, row: &NameRow) -> Result<DerivedComponentRecord, ParseRejection> {
        let parsed = self.parser.parse(row.name.as_deref().unwrap_or(""))?;
        let variation_id = row
            .variation_id
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or(ParseRejection::InvalidVariationId)?;
        Ok(DerivedComponentRecord::from_parsed(variation_id, parsed))
    }
}

fn failure_key(row: &NameRow) -> String {
    match row.variation_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("row:{}", row.row_id),
    }
}
