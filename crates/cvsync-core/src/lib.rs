//! Core domain records, variant-name parsing and run accounting for cvsync.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvsync-core";

/// Transcript prefixes recognized when no explicit set is configured.
pub const DEFAULT_TRANSCRIPT_PREFIXES: &[&str] = &["NM_"];

/// One published file as advertised by the remote directory index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileDescriptor {
    pub name: String,
    pub url: String,
    pub last_modified: Option<NaiveDateTime>,
}

/// Component parts extracted from one composite variant name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedComponents {
    pub transcript_id: String,
    pub gene_symbol: String,
    pub dna_change: String,
    pub protein_change: Option<String>,
}

/// Row of the derived component table, keyed by variation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedComponentRecord {
    pub variation_id: i64,
    pub gene_symbol: String,
    pub transcript_id: String,
    pub dna_change: String,
    pub protein_change: Option<String>,
}

impl DerivedComponentRecord {
    pub fn from_parsed(variation_id: i64, parsed: ParsedComponents) -> Self {
        Self {
            variation_id,
            gene_symbol: parsed.gene_symbol,
            transcript_id: parsed.transcript_id,
            dna_change: parsed.dna_change,
            protein_change: parsed.protein_change,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneVariantCount {
    pub gene_symbol: String,
    pub count: i64,
    pub last_updated: DateTime<Utc>,
}

/// Why a canonical row could not be turned into a derived record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRejection {
    #[error("name is empty")]
    EmptyName,
    #[error("name does not start with a recognized transcript prefix")]
    UnrecognizedPrefix,
    #[error("name has no parenthesized gene symbol")]
    MissingGeneSymbol,
    #[error("name has no colon-delimited coding change")]
    MissingCodingChange,
    #[error("name does not match the nomenclature pattern")]
    PatternMismatch,
    #[error("variation id is not an integer")]
    InvalidVariationId,
}

impl ParseRejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyName => "empty_name",
            Self::UnrecognizedPrefix => "unrecognized_prefix",
            Self::MissingGeneSymbol => "missing_gene_symbol",
            Self::MissingCodingChange => "missing_coding_change",
            Self::PatternMismatch => "pattern_mismatch",
            Self::InvalidVariationId => "invalid_variation_id",
        }
    }
}

/// Best-effort grammar for HGVS-style names such as
/// `NM_000059.4(BRCA2):c.1763_1766del (p.Lys588SerfsTer6)`.
///
/// The grammar is: transcript accession with one of the configured prefixes,
/// gene symbol in parentheses, `:c.` coding change, and an optional
/// parenthesized `p.` protein change. Anything else is rejected with a reason.
#[derive(Debug, Clone)]
pub struct NomenclatureParser {
    prefixes: Vec<String>,
    /// `None` when no prefixes are configured; every name is then rejected.
    pattern: Option<Regex>,
}

impl Default for NomenclatureParser {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_PREFIXES).expect("default nomenclature pattern compiles")
    }
}

impl NomenclatureParser {
    pub fn new<S: AsRef<str>>(prefixes: &[S]) -> Result<Self, regex::Error> {
        let prefixes = prefixes
            .iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        if prefixes.is_empty() {
            return Ok(Self {
                prefixes,
                pattern: None,
            });
        }
        let alternation = prefixes
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            r"^((?:{alternation})\d+(?:\.\d+)?)\(([^()\s]+)\):(c\.[^\s(]+)(?:\s*\(p\.([^()]+)\))?"
        ))?;
        Ok(Self {
            prefixes,
            pattern: Some(pattern),
        })
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn parse(&self, name: &str) -> Result<ParsedComponents, ParseRejection> {
        let name = name.trim();
        if let Some(caps) = self.pattern.as_ref().and_then(|p| p.captures(name)) {
            return Ok(ParsedComponents {
                transcript_id: caps[1].to_string(),
                gene_symbol: caps[2].to_string(),
                dna_change: caps[3].to_string(),
                protein_change: caps.get(4).map(|m| m.as_str().to_string()),
            });
        }
        Err(self.classify_rejection(name))
    }

    fn classify_rejection(&self, name: &str) -> ParseRejection {
        if name.is_empty() {
            ParseRejection::EmptyName
        } else if !self.prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            ParseRejection::UnrecognizedPrefix
        } else if !name.contains('(') {
            ParseRejection::MissingGeneSymbol
        } else if !name.contains(":c.") {
            ParseRejection::MissingCodingChange
        } else {
            ParseRejection::PatternMismatch
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    List,
    Download,
    Verify,
    Decompress,
    Load,
    Derive,
    Enrich,
    Report,
    Orchestrate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::List => "list",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Decompress => "decompress",
            Self::Load => "load",
            Self::Derive => "derive",
            Self::Enrich => "enrich",
            Self::Report => "report",
            Self::Orchestrate => "orchestrate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkFailure,
    IntegrityMismatch,
    FileSystemFailure,
    LoadFailure,
    DerivedFailure,
    EnrichmentFailure,
    FatalOrchestratorFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NetworkFailure => "network_failure",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::FileSystemFailure => "filesystem_failure",
            Self::LoadFailure => "load_failure",
            Self::DerivedFailure => "derived_failure",
            Self::EnrichmentFailure => "enrichment_failure",
            Self::FatalOrchestratorFailure => "fatal_orchestrator_failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub stage: Stage,
    pub kind: ErrorKind,
    /// File name, gene symbol, or table the error is about.
    pub subject: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityOutcome {
    Verified,
    /// Published checksum could not be fetched; treated as a pass.
    Unavailable,
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub file_name: String,
    pub outcome: FileOutcome,
    pub remote_last_modified: Option<NaiveDateTime>,
    pub downloaded_bytes: u64,
    pub integrity: IntegrityOutcome,
    pub rows_loaded: u64,
    pub ragged_rows: u64,
    pub duration_ms: u64,
}

impl FileStats {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            outcome: FileOutcome::Failed,
            remote_last_modified: None,
            downloaded_bytes: 0,
            integrity: IntegrityOutcome::NotChecked,
            rows_loaded: 0,
            ragged_rows: 0,
            duration_ms: 0,
        }
    }

    pub fn skipped(file_name: impl Into<String>) -> Self {
        Self {
            outcome: FileOutcome::Skipped,
            ..Self::new(file_name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedStats {
    pub rows_scanned: u64,
    pub rows_inserted: u64,
    pub duplicate_ids: u64,
    pub parse_failures: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentStats {
    pub genes_total: u64,
    pub genes_updated: u64,
    pub untagged_fallbacks: u64,
    pub failures: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// In-memory accumulator for one synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<FileStats>,
    pub derived: Option<DerivedStats>,
    pub enrichment: Option<EnrichmentStats>,
    pub errors: Vec<RunError>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            files: Vec::new(),
            derived: None,
            enrichment: None,
            errors: Vec::new(),
        }
    }

    pub fn record_file(&mut self, stats: FileStats) {
        self.files.push(stats);
    }

    pub fn record_error(
        &mut self,
        stage: Stage,
        kind: ErrorKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(RunError {
            stage,
            kind,
            subject: subject.into(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn file(&self, file_name: &str) -> Option<&FileStats> {
        self.files.iter().find(|f| f.file_name == file_name)
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.kind == ErrorKind::FatalOrchestratorFailure)
    }

    pub fn status(&self) -> RunStatus {
        let attempted = self
            .files
            .iter()
            .filter(|f| f.outcome != FileOutcome::Skipped)
            .count();
        let succeeded = self
            .files
            .iter()
            .filter(|f| f.outcome == FileOutcome::Succeeded)
            .count();

        if self.has_fatal_error() || (attempted > 0 && succeeded == 0) {
            RunStatus::Failed
        } else if !self.errors.is_empty() {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}
