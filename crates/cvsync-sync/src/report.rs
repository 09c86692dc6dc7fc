use std::path::PathBuf;

use cvsync_adapters::Notifier;
use cvsync_core::{FileOutcome, IntegrityOutcome, RunStatus, RunSummary};
use cvsync_storage::WorkDirs;
use tokio::fs;
use tracing::{info, warn};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// What happened while reporting; every step is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    pub run_log: Option<PathBuf>,
    pub notified: bool,
    pub purged_entries: usize,
    pub rotated_logs: usize,
}

pub fn subject_line(summary: &RunSummary) -> String {
    let attempted = summary
        .files
        .iter()
        .filter(|f| f.outcome != FileOutcome::Skipped)
        .count();
    let loaded = summary
        .files
        .iter()
        .filter(|f| f.outcome == FileOutcome::Succeeded)
        .count();
    format!(
        "ClinVar sync {}: {loaded}/{attempted} files loaded",
        summary.status()
    )
}

/// Fixed-layout plain-text run summary.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut lines = Vec::new();

    lines.push(format!("ClinVar sync run {}", summary.run_id));
    lines.push(format!("Status: {}", summary.status()));
    lines.push(format!("Started: {}", summary.started_at.format(TIME_FORMAT)));
    lines.push(match summary.finished_at {
        Some(finished) => format!("Finished: {}", finished.format(TIME_FORMAT)),
        None => "Finished: (in progress)".to_string(),
    });
    lines.push(format!("Duration: {}", format_ms(summary.duration_ms())));

    lines.push(String::new());
    lines.push("Files".to_string());
    if summary.files.is_empty() {
        lines.push("  none processed".to_string());
    }
    for file in &summary.files {
        let outcome = match file.outcome {
            FileOutcome::Succeeded => "succeeded",
            FileOutcome::Failed => "failed",
            FileOutcome::Skipped => "skipped (already in progress)",
        };
        lines.push(format!("  {}: {outcome}", file.file_name));
        if file.outcome == FileOutcome::Skipped {
            continue;
        }
        let modified = file
            .remote_last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let integrity = match file.integrity {
            IntegrityOutcome::Verified => "verified",
            IntegrityOutcome::Unavailable => "unavailable (accepted)",
            IntegrityOutcome::NotChecked => "not checked",
        };
        lines.push(format!("    remote last modified: {modified}"));
        lines.push(format!("    downloaded: {} bytes", file.downloaded_bytes));
        lines.push(format!("    checksum: {integrity}"));
        lines.push(format!(
            "    rows loaded: {} (ragged {})",
            file.rows_loaded, file.ragged_rows
        ));
        lines.push(format!("    duration: {}", format_ms(file.duration_ms)));
    }

    lines.push(String::new());
    lines.push("Derived table (variant_components)".to_string());
    match &summary.derived {
        Some(d) => {
            lines.push(format!(
                "  scanned: {}, inserted: {}, duplicate ids: {}, parse failures: {}",
                d.rows_scanned, d.rows_inserted, d.duplicate_ids, d.parse_failures
            ));
            lines.push(format!("  duration: {}", format_ms(d.duration_ms)));
        }
        None => lines.push("  not completed".to_string()),
    }

    lines.push(String::new());
    lines.push("Gene count enrichment".to_string());
    match &summary.enrichment {
        Some(e) => {
            lines.push(format!(
                "  genes: {}, updated: {}, untagged fallbacks: {}, failures: {}",
                e.genes_total, e.genes_updated, e.untagged_fallbacks, e.failures
            ));
            lines.push(format!("  duration: {}", format_ms(e.duration_ms)));
        }
        None => lines.push("  not completed".to_string()),
    }

    lines.push(String::new());
    lines.push(format!("Errors ({})", summary.errors.len()));
    for err in &summary.errors {
        lines.push(format!(
            "  [{}/{}] {}: {}",
            err.stage, err.kind, err.subject, err.message
        ));
    }
    lines.push(String::new());

    lines.join("\n")
}

fn format_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms} ms")
    } else {
        format!("{:.1} s", ms as f64 / 1_000.0)
    }
}

/// Writes the run log, sends the notification, then purges transient files
/// and rotates old run logs.
pub struct RunReporter<'a> {
    dirs: &'a WorkDirs,
    notifier: &'a dyn Notifier,
    keep_run_logs: usize,
}

impl<'a> RunReporter<'a> {
    pub fn new(dirs: &'a WorkDirs, notifier: &'a dyn Notifier, keep_run_logs: usize) -> Self {
        Self {
            dirs,
            notifier,
            keep_run_logs,
        }
    }

    pub async fn publish(&self, summary: &RunSummary) -> ReportOutcome {
        let body = render_summary(summary);
        let subject = subject_line(summary);
        let mut outcome = ReportOutcome::default();

        let log_path = self.dirs.run_log_path(summary.started_at, summary.run_id);
        let written = match fs::create_dir_all(self.dirs.logs_dir()).await {
            Ok(()) => fs::write(&log_path, &body).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => outcome.run_log = Some(log_path),
            Err(err) => warn!(path = %log_path.display(), error = %err, "failed to write run log"),
        }

        let success = summary.status() == RunStatus::Success;
        match self.notifier.send(&subject, success, &body).await {
            Ok(()) => outcome.notified = true,
            Err(err) => warn!(error = %err, "run notification failed"),
        }

        match self.dirs.purge_transient().await {
            Ok(n) => outcome.purged_entries = n,
            Err(err) => warn!(error = %err, "failed to purge transient directories"),
        }
        match self.dirs.rotate_run_logs(self.keep_run_logs).await {
            Ok(n) => outcome.rotated_logs = n,
            Err(err) => warn!(error = %err, "failed to rotate run logs"),
        }

        info!(
            run_id = %summary.run_id,
            status = %summary.status(),
            notified = outcome.notified,
            purged = outcome.purged_entries,
            rotated = outcome.rotated_logs,
            "run report published"
        );
        outcome
    }
}
