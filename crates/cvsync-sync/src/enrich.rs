use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use cvsync_adapters::{AdapterError, GeneCountSource, QueryStrategy};
use cvsync_core::{EnrichmentStats, ErrorKind, RunSummary, Stage};
use tracing::{debug, info, warn};

use crate::store::GeneCountStore;

/// Refreshes `gene_variant_counts` from the esearch API, one gene at a time.
pub struct EnrichmentClient<'a> {
    source: &'a dyn GeneCountSource,
    delay: Duration,
    calls: u64,
}

impl<'a> EnrichmentClient<'a> {
    pub fn new(source: &'a dyn GeneCountSource, delay: Duration) -> Self {
        Self {
            source,
            delay,
            calls: 0,
        }
    }

    /// Tagged query first; a zero count is retried untagged before it is
    /// accepted. Returns the count and whether the fallback was used.
    pub async fn count_for(&mut self, gene_symbol: &str) -> Result<(u64, bool), AdapterError> {
        let tagged = self.call(gene_symbol, QueryStrategy::Tagged).await?;
        if tagged > 0 {
            return Ok((tagged, false));
        }
        let untagged = self.call(gene_symbol, QueryStrategy::Untagged).await?;
        Ok((untagged, true))
    }

    async fn call(&mut self, gene_symbol: &str, strategy: QueryStrategy) -> Result<u64, AdapterError> {
        if self.calls > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls += 1;
        self.source.count(gene_symbol, strategy).await
    }

    /// Update every known gene. Per-gene failures are recorded on `summary`
    /// and the loop moves on.
    pub async fn refresh_all(
        &mut self,
        store: &dyn GeneCountStore,
        summary: &mut RunSummary,
    ) -> Result<EnrichmentStats> {
        let started = Instant::now();
        let genes = store
            .list_gene_symbols()
            .await
            .context("listing gene symbols")?;
        let mut stats = EnrichmentStats {
            genes_total: genes.len() as u64,
            ..Default::default()
        };
        info!(genes = genes.len(), "starting gene count enrichment");

        for gene in &genes {
            let (count, fell_back) = match self.count_for(gene).await {
                Ok(found) => found,
                Err(err) => {
                    stats.failures += 1;
                    warn!(gene = %gene, error = %err, "esearch count failed");
                    summary.record_error(Stage::Enrich, ErrorKind::EnrichmentFailure, gene, err.to_string());
                    continue;
                }
            };
            if fell_back {
                stats.untagged_fallbacks += 1;
            }

            let count = i64::try_from(count).unwrap_or(i64::MAX);
            if let Err(err) = store.upsert_gene_count(gene, count, Utc::now()).await {
                stats.failures += 1;
                warn!(gene = %gene, error = %err, "storing gene count failed");
                summary.record_error(Stage::Enrich, ErrorKind::EnrichmentFailure, gene, err.to_string());
                continue;
            }
            stats.genes_updated += 1;
            debug!(gene = %gene, count, fell_back, "updated gene count");
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            updated = stats.genes_updated,
            failures = stats.failures,
            fallbacks = stats.untagged_fallbacks,
            "gene count enrichment finished"
        );
        Ok(stats)
    }
}
