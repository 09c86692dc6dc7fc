use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cvsync_adapters::{
    EmailApiNotifier, EsearchClient, GeneCountSource, HttpRemoteSource, LogNotifier, Notifier,
    RemoteSource,
};
use cvsync_core::{
    ErrorKind, FileOutcome, FileStats, IntegrityOutcome, NomenclatureParser, RemoteFileDescriptor,
    RunSummary, Stage,
};
use cvsync_storage::{
    decompress_gzip, file_digest_hex, parse_published_checksum, ChecksumAlgorithm, HttpFetcher,
    ParseFailureLog, WorkDirs,
};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{SourceRegistry, SourceSpec, SyncConfig};
use crate::derived::DerivedTableBuilder;
use crate::enrich::EnrichmentClient;
use crate::loader::load_file;
use crate::postgres::PgStore;
use crate::registry::ActiveProcessRegistry;
use crate::report::RunReporter;
use crate::store::{BulkLoader, DerivedStore, GeneCountStore};

/// Tunables that shape one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub derived_page_size: i64,
    pub enrich_delay: Duration,
    pub keep_run_logs: usize,
    pub sync_cron: String,
    pub health_cron: String,
}

impl RunOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            derived_page_size: config.derived_page_size,
            enrich_delay: config.enrich_delay,
            keep_run_logs: config.keep_run_logs,
            sync_cron: config.sync_cron.clone(),
            health_cron: config.health_cron.clone(),
        }
    }
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub remote: Arc<dyn RemoteSource>,
    pub loader: Arc<dyn BulkLoader>,
    pub derived: Arc<dyn DerivedStore>,
    pub genes: Arc<dyn GeneCountStore>,
    pub gene_counts: Arc<dyn GeneCountSource>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
struct FileFailure {
    stage: Stage,
    kind: ErrorKind,
    message: String,
}

impl FileFailure {
    fn new(stage: Stage, kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            stage,
            kind,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    pub active: Vec<(String, DateTime<Utc>)>,
    pub required_files: Vec<String>,
    pub sync_cron: String,
    pub health_cron: String,
}

impl Heartbeat {
    pub fn new(
        active: Vec<(String, DateTime<Utc>)>,
        registry: &SourceRegistry,
        options: &RunOptions,
    ) -> Self {
        Self {
            at: Utc::now(),
            active,
            required_files: registry.file_names(),
            sync_cron: options.sync_cron.clone(),
            health_cron: options.health_cron.clone(),
        }
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cvsync heartbeat at {}", self.at.to_rfc3339())?;
        writeln!(f, "sync schedule: {}", self.sync_cron)?;
        writeln!(f, "health schedule: {}", self.health_cron)?;
        writeln!(f, "required files: {}", self.required_files.join(", "))?;
        if self.active.is_empty() {
            write!(f, "active: none")
        } else {
            let active = self
                .active
                .iter()
                .map(|(name, since)| format!("{name} (since {})", since.to_rfc3339()))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "active: {active}")
        }
    }
}

/// Sequences one full synchronization and guards against re-entry per file.
pub struct SyncOrchestrator {
    registry: SourceRegistry,
    dirs: WorkDirs,
    parts: Collaborators,
    parser: NomenclatureParser,
    options: RunOptions,
    active: ActiveProcessRegistry,
    running: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: SourceRegistry,
        dirs: WorkDirs,
        parts: Collaborators,
        parser: NomenclatureParser,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            dirs,
            parts,
            parser,
            options,
            active: ActiveProcessRegistry::new(),
            running: Mutex::new(()),
        }
    }

    /// Wire the production collaborators: HTTP index, esearch, email (or
    /// log-only) notifier and a PostgreSQL store.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let notifier = notifier_from_config(config, http.clone());
        Self::wire(config, http, notifier).await
    }

    async fn wire(
        config: &SyncConfig,
        http: Arc<HttpFetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let parser = NomenclatureParser::new(&config.transcript_prefixes)
            .context("compiling nomenclature pattern")?;
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        );
        store.migrate().await.context("running migrations")?;

        let parts = Collaborators {
            remote: Arc::new(HttpRemoteSource::new(http.clone(), config.base_url.clone())),
            loader: store.clone(),
            derived: store.clone(),
            genes: store,
            gene_counts: Arc::new(EsearchClient::new(
                http,
                config.esearch_url.clone(),
                config.ncbi_api_key.clone(),
            )),
            notifier,
        };
        Ok(Self::new(
            registry,
            config.work_dirs(),
            parts,
            parser,
            RunOptions::from_config(config),
        ))
    }

    pub fn active(&self) -> &ActiveProcessRegistry {
        &self.active
    }

    /// Run every stage, then report and clean up. Failures are recorded on
    /// the summary rather than returned. `None` when another run is still in
    /// progress on this orchestrator.
    pub async fn trigger(&self) -> Option<RunSummary> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("a sync run is already in progress; skipping trigger");
            return None;
        };
        let mut summary = RunSummary::start();
        let span = info_span!("sync_run", run_id = %summary.run_id);
        self.run_and_report(&mut summary).instrument(span).await;
        Some(summary)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let beat = Heartbeat::new(self.active.snapshot(), &self.registry, &self.options);
        info!(
            active = beat.active.len(),
            sync_cron = %beat.sync_cron,
            health_cron = %beat.health_cron,
            "heartbeat"
        );
        beat
    }

    async fn run_and_report(&self, summary: &mut RunSummary) {
        info!("sync run started");
        if let Err(err) = self.run_stages(summary).await {
            error!(error = %format!("{err:#}"), "sync run aborted");
            summary.record_error(
                Stage::Orchestrate,
                ErrorKind::FatalOrchestratorFailure,
                "run",
                format!("{err:#}"),
            );
        }
        summary.finish();

        RunReporter::new(&self.dirs, self.parts.notifier.as_ref(), self.options.keep_run_logs)
            .publish(summary)
            .await;
        info!(
            status = %summary.status(),
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms(),
            "sync run finished"
        );
    }

    async fn run_stages(&self, summary: &mut RunSummary) -> Result<()> {
        self.dirs.ensure().await?;

        let required = self.registry.file_names();
        let listed = match self.parts.remote.list_files(&required).await {
            Ok(listed) => Some(listed),
            Err(err) => {
                warn!(error = %err, "listing remote files failed");
                summary.record_error(Stage::List, ErrorKind::NetworkFailure, "index", err.to_string());
                None
            }
        };

        for source in &self.registry.sources {
            let Some(_guard) = self.active.try_register(&source.file_name) else {
                warn!(file = %source.file_name, "file is already being processed; skipping");
                summary.record_file(FileStats::skipped(&source.file_name));
                continue;
            };

            let mut stats = FileStats::new(&source.file_name);
            let descriptor = listed
                .as_ref()
                .and_then(|files| files.iter().find(|d| d.name == source.file_name));
            let result = match (descriptor, &listed) {
                (Some(descriptor), _) => {
                    stats.remote_last_modified = descriptor.last_modified;
                    let span = info_span!("file", file = %source.file_name);
                    self.process_file(source, descriptor, &mut stats)
                        .instrument(span)
                        .await
                }
                (None, Some(_)) => Err(FileFailure::new(
                    Stage::List,
                    ErrorKind::NetworkFailure,
                    "not published in the remote index",
                )),
                (None, None) => Err(FileFailure::new(
                    Stage::List,
                    ErrorKind::NetworkFailure,
                    "remote index unavailable",
                )),
            };

            match result {
                Ok(()) => stats.outcome = FileOutcome::Succeeded,
                Err(failure) => {
                    warn!(
                        file = %source.file_name,
                        stage = %failure.stage,
                        kind = %failure.kind,
                        error = %failure.message,
                        "file chain failed"
                    );
                    stats.outcome = FileOutcome::Failed;
                    summary.record_error(failure.stage, failure.kind, &source.file_name, failure.message);
                }
            }
            summary.record_file(stats);
        }

        self.run_derived(summary).await;
        self.run_enrichment(summary).await;
        Ok(())
    }

    async fn process_file(
        &self,
        source: &SourceSpec,
        descriptor: &RemoteFileDescriptor,
        stats: &mut FileStats,
    ) -> Result<(), FileFailure> {
        let started = Instant::now();
        let result = self.file_chain(source, descriptor, stats).await;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn file_chain(
        &self,
        source: &SourceSpec,
        descriptor: &RemoteFileDescriptor,
        stats: &mut FileStats,
    ) -> Result<(), FileFailure> {
        let downloaded = self.dirs.download_path(&source.file_name);
        stats.downloaded_bytes = self
            .parts
            .remote
            .download(descriptor, &downloaded)
            .await
            .map_err(|err| {
                let kind = if err.is_local_io() {
                    ErrorKind::FileSystemFailure
                } else {
                    ErrorKind::NetworkFailure
                };
                FileFailure::new(Stage::Download, kind, err)
            })?;
        info!(bytes = stats.downloaded_bytes, "downloaded");

        stats.integrity = self
            .verify_integrity(descriptor, &downloaded, source.checksum)
            .await?;

        let plain = self.decompress(&source.file_name, &downloaded).await?;

        let report = load_file(
            self.parts.loader.as_ref(),
            source,
            &plain,
            self.options.batch_size,
        )
        .await
        .map_err(|err| FileFailure::new(Stage::Load, err.kind(), err))?;
        stats.rows_loaded = report.rows_loaded;
        stats.ragged_rows = report.ragged_rows;
        Ok(())
    }

    /// Compare the published digest with the local one. An unreachable or
    /// unparseable checksum counts as a pass.
    async fn verify_integrity(
        &self,
        descriptor: &RemoteFileDescriptor,
        local: &Path,
        algorithm: ChecksumAlgorithm,
    ) -> Result<IntegrityOutcome, FileFailure> {
        let published = match self.parts.remote.fetch_checksum(descriptor, algorithm).await {
            Ok(body) => parse_published_checksum(&body, algorithm),
            Err(err) => {
                warn!(error = %err, "checksum unavailable; accepting download unverified");
                return Ok(IntegrityOutcome::Unavailable);
            }
        };
        let Some(expected) = published else {
            warn!("checksum body had no digest; accepting download unverified");
            return Ok(IntegrityOutcome::Unavailable);
        };

        let actual = file_digest_hex(local, algorithm)
            .await
            .map_err(|err| FileFailure::new(Stage::Verify, ErrorKind::FileSystemFailure, format!("{err:#}")))?;
        if actual.eq_ignore_ascii_case(&expected) {
            info!("checksum verified");
            Ok(IntegrityOutcome::Verified)
        } else {
            Err(FileFailure::new(
                Stage::Verify,
                ErrorKind::IntegrityMismatch,
                format!("published {expected}, computed {actual}"),
            ))
        }
    }

    async fn decompress(&self, file_name: &str, downloaded: &Path) -> Result<PathBuf, FileFailure> {
        if !file_name.ends_with(".gz") {
            return Ok(downloaded.to_path_buf());
        }
        let plain = self.dirs.decompressed_path(file_name);
        let bytes = decompress_gzip(downloaded, &plain).await.map_err(|err| {
            FileFailure::new(Stage::Decompress, ErrorKind::FileSystemFailure, format!("{err:#}"))
        })?;
        info!(bytes, "decompressed");
        Ok(plain)
    }

    async fn run_derived(&self, summary: &mut RunSummary) {
        let builder = DerivedTableBuilder::new(
            self.parser.clone(),
            self.registry.derived_source_table.clone(),
            self.options.derived_page_size,
        );
        let result = async {
            let mut failures = ParseFailureLog::open_append(self.dirs.parse_failure_log_path()).await?;
            let rebuilt = builder.rebuild(self.parts.derived.as_ref(), &mut failures).await;
            let logged = failures.close().await;
            let stats = rebuilt?;
            logged?;
            anyhow::Ok(stats)
        }
        .instrument(info_span!("derive"))
        .await;

        match result {
            Ok(stats) => summary.derived = Some(stats),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "derived table rebuild failed");
                summary.record_error(
                    Stage::Derive,
                    ErrorKind::DerivedFailure,
                    "variant_components",
                    format!("{err:#}"),
                );
            }
        }
    }

    async fn run_enrichment(&self, summary: &mut RunSummary) {
        let mut client = EnrichmentClient::new(self.parts.gene_counts.as_ref(), self.options.enrich_delay);
        let result = client
            .refresh_all(self.parts.genes.as_ref(), summary)
            .instrument(info_span!("enrich"))
            .await;
        match result {
            Ok(stats) => summary.enrichment = Some(stats),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "gene count enrichment failed");
                summary.record_error(
                    Stage::Enrich,
                    ErrorKind::EnrichmentFailure,
                    "gene_variant_counts",
                    format!("{err:#}"),
                );
            }
        }
    }
}

/// Email notifier when configured, otherwise log-only. Needs no database.
pub fn notifier_from_config(config: &SyncConfig, http: Arc<HttpFetcher>) -> Arc<dyn Notifier> {
    match &config.notify {
        Some(email) => Arc::new(EmailApiNotifier::new(http, email.clone())),
        None => {
            info!("email notification not configured; run summaries go to the log only");
            Arc::new(LogNotifier)
        }
    }
}

/// Wire the production orchestrator and run it once. When wiring fails
/// (database down, bad registry) a failed run is still reported.
pub async fn run_once(config: &SyncConfig) -> Result<Option<RunSummary>> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config()).context("building http client")?);
    let notifier = notifier_from_config(config, http.clone());
    match SyncOrchestrator::wire(config, http, notifier.clone()).await {
        Ok(orchestrator) => Ok(orchestrator.trigger().await),
        Err(err) => Ok(Some(
            report_startup_failure(
                &config.work_dirs(),
                notifier.as_ref(),
                config.keep_run_logs,
                &err,
            )
            .await,
        )),
    }
}

/// Record a failure that happened before any stage could run and publish it.
pub async fn report_startup_failure(
    dirs: &WorkDirs,
    notifier: &dyn Notifier,
    keep_run_logs: usize,
    err: &anyhow::Error,
) -> RunSummary {
    error!(error = %format!("{err:#}"), "sync run could not start");
    let mut summary = RunSummary::start();
    summary.record_error(
        Stage::Orchestrate,
        ErrorKind::FatalOrchestratorFailure,
        "startup",
        format!("{err:#}"),
    );
    summary.finish();
    RunReporter::new(dirs, notifier, keep_run_logs)
        .publish(&summary)
        .await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixtureRemote, MemoryStore, RecordingNotifier, StubGeneCounts};
    use cvsync_adapters::QueryStrategy;
    use cvsync_core::RunStatus;
    use tempfile::TempDir;

    const VARIANT: &str = "variant_summary.txt.gz";
    const SUBMISSION: &str = "submission_summary.txt.gz";

    const VARIANT_TSV: &str = "#AlleleID\tType\tName\tGeneSymbol\tVariationID\n\
15041\tIndel\tNM_014855.3(AP5Z1):c.80_83delinsTGCTGTAAACTGTAACTGTAAA (p.Arg27_Ile28delinsLeuLeuTer)\tAP5Z1\t2\n\
15042\tDeletion\tNM_014855.3(AP5Z1):c.1413_1426del (p.Leu473fs)\tAP5Z1\t3\n";

    const SUBMISSION_TSV: &str = "##Overview of interpretation\n\
#VariationID\tClinicalSignificance\tSubmitter\n\
2\tPathogenic\tOMIM\n\
3\tPathogenic\tOMIM\n";

    struct Harness {
        orchestrator: SyncOrchestrator,
        store: Arc<MemoryStore>,
        remote: Arc<FixtureRemote>,
        notifier: Arc<RecordingNotifier>,
        dirs: WorkDirs,
        root: TempDir,
    }

    fn published() -> FixtureRemote {
        FixtureRemote::default()
            .with_tsv(VARIANT, VARIANT_TSV)
            .with_tsv(SUBMISSION, SUBMISSION_TSV)
    }

    fn harness(remote: FixtureRemote) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(
            root.path().join("downloads"),
            root.path().join("tmp"),
            root.path().join("logs"),
        );
        let store = Arc::new(MemoryStore::default());
        let remote = Arc::new(remote);
        let notifier = Arc::new(RecordingNotifier::default());
        let counts = Arc::new(
            StubGeneCounts::default()
                .with("AP5Z1", QueryStrategy::Tagged, 0)
                .with("AP5Z1", QueryStrategy::Untagged, 5),
        );
        let parts = Collaborators {
            remote: remote.clone(),
            loader: store.clone(),
            derived: store.clone(),
            genes: store.clone(),
            gene_counts: counts,
            notifier: notifier.clone(),
        };
        let options = RunOptions {
            batch_size: 1,
            derived_page_size: 1,
            enrich_delay: Duration::ZERO,
            keep_run_logs: 8,
            sync_cron: "0 0 3 * * Sun".to_string(),
            health_cron: "0 0 8 * * *".to_string(),
        };
        Harness {
            orchestrator: SyncOrchestrator::new(
                SourceRegistry::default(),
                dirs.clone(),
                parts,
                NomenclatureParser::default(),
                options,
            ),
            store,
            remote,
            notifier,
            dirs,
            root,
        }
    }

    fn error_kinds(summary: &RunSummary) -> Vec<(String, ErrorKind)> {
        summary
            .errors
            .iter()
            .map(|e| (e.subject.clone(), e.kind))
            .collect()
    }

    #[tokio::test]
    async fn full_run_loads_derives_enriches_and_reports() {
        let h = harness(published());
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success, "{:?}", summary.errors);
        let variant = summary.file(VARIANT).unwrap();
        assert_eq!(variant.outcome, FileOutcome::Succeeded);
        assert_eq!(variant.integrity, IntegrityOutcome::Verified);
        assert_eq!(variant.rows_loaded, 2);
        assert!(variant.remote_last_modified.is_some());

        let table = h.store.table("clinvar_variant_summary").unwrap();
        assert_eq!(
            table.columns,
            vec!["allele_id", "type", "name", "gene_symbol", "variation_id"]
        );
        assert_eq!(h.store.table("clinvar_submission_summary").unwrap().rows.len(), 2);

        let derived = summary.derived.as_ref().unwrap();
        assert_eq!(derived.rows_inserted, 2);
        assert_eq!(h.store.components()[1].dna_change, "c.1413_1426del");

        let enrichment = summary.enrichment.as_ref().unwrap();
        assert_eq!(enrichment.genes_updated, 1);
        assert_eq!(h.store.gene_count("AP5Z1"), Some(5));

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].success);
        assert!(sent[0].body.contains("Status: success"));

        assert!(!tokio::fs::try_exists(h.dirs.download_path(VARIANT)).await.unwrap());
        assert!(!tokio::fs::try_exists(h.dirs.decompressed_path(VARIANT)).await.unwrap());
        assert!(tokio::fs::try_exists(h.dirs.run_log_path(summary.started_at, summary.run_id))
            .await
            .unwrap());
        assert!(h.orchestrator.active().snapshot().is_empty());
    }

    #[tokio::test]
    async fn unreachable_checksum_fails_open() {
        let h = harness(published().without_checksum(VARIANT));
        let summary = h.orchestrator.trigger().await.unwrap();

        let variant = summary.file(VARIANT).unwrap();
        assert_eq!(variant.outcome, FileOutcome::Succeeded);
        assert_eq!(variant.integrity, IntegrityOutcome::Unavailable);
        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.store.table("clinvar_variant_summary").unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts_only_that_file() {
        let wrong = format!("{}  {SUBMISSION}\n", "0".repeat(32));
        let h = harness(published().with_checksum_body(SUBMISSION, &wrong));
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(summary.file(SUBMISSION).unwrap().outcome, FileOutcome::Failed);
        assert_eq!(summary.file(VARIANT).unwrap().outcome, FileOutcome::Succeeded);
        assert_eq!(
            error_kinds(&summary),
            vec![(SUBMISSION.to_string(), ErrorKind::IntegrityMismatch)]
        );
        assert_eq!(summary.errors[0].stage, Stage::Verify);
        assert!(h.store.table("clinvar_submission_summary").is_none());
        assert_eq!(summary.status(), RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn load_failure_is_isolated_and_later_stages_still_run() {
        let h = harness(published());
        h.store.seed_table("clinvar_submission_summary", &["variation_id"], &[&["old"]]);
        h.store.fail_appends_for("clinvar_submission_summary");
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(summary.file(SUBMISSION).unwrap().outcome, FileOutcome::Failed);
        assert_eq!(summary.file(VARIANT).unwrap().outcome, FileOutcome::Succeeded);
        assert_eq!(
            error_kinds(&summary),
            vec![(SUBMISSION.to_string(), ErrorKind::LoadFailure)]
        );
        let kept = h.store.table("clinvar_submission_summary").unwrap();
        assert_eq!(kept.rows[0].fields[0].as_deref(), Some("old"));
        assert!(summary.derived.is_some());
        assert!(summary.enrichment.is_some());

        let sent = h.notifier.sent();
        assert!(!sent[0].success);
        assert!(sent[0].body.contains("[load/load_failure] submission_summary.txt.gz"));
    }

    #[tokio::test]
    async fn active_file_is_skipped_not_queued() {
        let h = harness(published());
        let guard = h.orchestrator.active().try_register(VARIANT).unwrap();
        let summary = h.orchestrator.trigger().await.unwrap();
        drop(guard);

        assert_eq!(summary.file(VARIANT).unwrap().outcome, FileOutcome::Skipped);
        assert_eq!(summary.file(SUBMISSION).unwrap().outcome, FileOutcome::Succeeded);
        assert_eq!(h.remote.downloads(), vec![SUBMISSION.to_string()]);
        assert!(summary.errors.iter().all(|e| e.subject != VARIANT));
    }

    #[tokio::test]
    async fn unpublished_file_is_a_network_failure() {
        let h = harness(FixtureRemote::default().with_tsv(VARIANT, VARIANT_TSV));
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(
            error_kinds(&summary),
            vec![(SUBMISSION.to_string(), ErrorKind::NetworkFailure)]
        );
        assert_eq!(summary.errors[0].stage, Stage::List);
        assert_eq!(summary.status(), RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn listing_failure_fails_every_file_but_still_reports() {
        let h = harness(published().failing_listing());
        let summary = h.orchestrator.trigger().await.unwrap();

        assert!(summary
            .files
            .iter()
            .all(|f| f.outcome == FileOutcome::Failed));
        assert_eq!(summary.status(), RunStatus::Failed);
        assert!(summary
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::DerivedFailure));
        assert!(summary.enrichment.is_some());
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_archive_is_a_filesystem_failure() {
        let h = harness(
            FixtureRemote::default()
                .with_tsv(VARIANT, VARIANT_TSV)
                .with_raw(SUBMISSION, b"plain text, not gzip".to_vec()),
        );
        let summary = h.orchestrator.trigger().await.unwrap();

        let failure = summary
            .errors
            .iter()
            .find(|e| e.subject == SUBMISSION)
            .unwrap();
        assert_eq!(failure.stage, Stage::Decompress);
        assert_eq!(failure.kind, ErrorKind::FileSystemFailure);
        assert_eq!(summary.file(SUBMISSION).unwrap().integrity, IntegrityOutcome::Verified);
    }

    #[tokio::test]
    async fn derived_failure_does_not_block_enrichment() {
        let h = harness(published());
        h.store.fail_derived();
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(
            error_kinds(&summary),
            vec![("variant_components".to_string(), ErrorKind::DerivedFailure)]
        );
        assert!(summary.derived.is_none());
        assert!(summary.enrichment.is_some());
        assert_eq!(summary.status(), RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn heartbeat_reports_registry_and_schedule() {
        let h = harness(published());
        let _guard = h.orchestrator.active().try_register(SUBMISSION).unwrap();
        let beat = h.orchestrator.heartbeat();

        assert_eq!(beat.active.len(), 1);
        assert_eq!(beat.active[0].0, SUBMISSION);
        assert_eq!(beat.required_files, vec![VARIANT.to_string(), SUBMISSION.to_string()]);
        let text = beat.to_string();
        assert!(text.contains("sync schedule: 0 0 3 * * Sun"));
        assert!(text.contains("active: submission_summary.txt.gz (since"));
    }

    #[tokio::test]
    async fn fatal_stage_failure_still_reports() {
        let h = harness(published());
        tokio::fs::write(h.root.path().join("downloads"), b"not a directory").await.unwrap();
        let summary = h.orchestrator.trigger().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::FatalOrchestratorFailure);
        assert!(summary.files.is_empty());
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].success);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let h = harness(published());
        let running = h.orchestrator.running.try_lock().unwrap();
        assert!(h.orchestrator.trigger().await.is_none());
        drop(running);

        assert!(h.remote.downloads().is_empty());
        assert!(h.notifier.sent().is_empty());
        assert!(h.orchestrator.trigger().await.is_some());
    }

    #[tokio::test]
    async fn startup_failure_is_published() {
        let root = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(
            root.path().join("downloads"),
            root.path().join("tmp"),
            root.path().join("logs"),
        );
        let notifier = RecordingNotifier::default();
        let err = anyhow::anyhow!("connection refused").context("connecting to database");
        let summary = report_startup_failure(&dirs, &notifier, 8, &err).await;

        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.errors[0].subject, "startup");
        assert_eq!(summary.errors[0].kind, ErrorKind::FatalOrchestratorFailure);
        assert!(summary.errors[0].message.contains("connecting to database: connection refused"));
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].success);
        assert!(sent[0].body.contains("[orchestrate/fatal_orchestrator_failure] startup"));
        assert!(tokio::fs::try_exists(dirs.run_log_path(summary.started_at, summary.run_id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn run_once_reports_unloadable_registry() {
        let root = tempfile::tempdir().unwrap();
        let sources = root.path().join("sources.yaml");
        tokio::fs::write(&sources, "sources: [unterminated").await.unwrap();

        let mut config = SyncConfig::from_env();
        config.sources_file = sources;
        config.download_dir = root.path().join("downloads");
        config.temp_dir = root.path().join("tmp");
        config.logs_dir = root.path().join("logs");
        config.notify = None;

        let summary = run_once(&config).await.unwrap().unwrap();
        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.errors[0].kind, ErrorKind::FatalOrchestratorFailure);
        assert!(summary.errors[0].message.contains("parsing"));
        assert!(tokio::fs::try_exists(config.work_dirs().run_log_path(summary.started_at, summary.run_id))
            .await
            .unwrap());
    }

    #[test]
    fn heartbeat_needs_only_registry_and_schedule() {
        let options = RunOptions {
            batch_size: 10,
            derived_page_size: 10,
            enrich_delay: Duration::ZERO,
            keep_run_logs: 8,
            sync_cron: "0 0 3 * * Sun".to_string(),
            health_cron: "0 0 8 * * *".to_string(),
        };
        let beat = Heartbeat::new(Vec::new(), &SourceRegistry::default(), &options);
        assert_eq!(beat.required_files.len(), 2);
        assert!(beat.to_string().ends_with("active: none"));
    }
}
