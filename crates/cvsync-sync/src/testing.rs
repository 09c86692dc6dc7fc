//! In-memory doubles for the storage, remote, count and notification seams.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cvsync_adapters::{AdapterError, GeneCountSource, Notifier, QueryStrategy, RemoteSource};
use cvsync_core::{DerivedComponentRecord, RemoteFileDescriptor};
use cvsync_storage::ChecksumAlgorithm;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::store::{
    BulkLoader, DerivedStore, GeneCountStore, NameRow, StagedRow, StagingHandle, StorageError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTable {
    pub columns: Vec<String>,
    pub rows: Vec<StagedRow>,
}

#[derive(Debug, Default)]
struct MemState {
    tables: BTreeMap<String, MemTable>,
    components: BTreeMap<i64, DerivedComponentRecord>,
    gene_counts: BTreeMap<String, (i64, DateTime<Utc>)>,
    fail_appends: HashSet<String>,
    fail_derived: bool,
}

/// Table swaps happen under one lock, so readers see either the old or the
/// new table in full.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
    append_calls: AtomicUsize,
    staging_created: AtomicUsize,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }

    pub fn table(&self, name: &str) -> Option<MemTable> {
        self.state().tables.get(name).cloned()
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn staging_created(&self) -> usize {
        self.staging_created.load(Ordering::SeqCst)
    }

    pub fn fail_appends_for(&self, canonical: &str) {
        self.state().fail_appends.insert(canonical.to_string());
    }

    pub fn fail_derived(&self) {
        self.state().fail_derived = true;
    }

    pub fn seed_table(&self, name: &str, columns: &[&str], rows: &[&[&str]]) {
        let table = MemTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .enumerate()
                .map(|(i, fields)| StagedRow {
                    row_id: i as i64 + 1,
                    fields: fields.iter().map(|f| Some(f.to_string())).collect(),
                })
                .collect(),
        };
        self.state().tables.insert(name.to_string(), table);
    }

    pub fn components(&self) -> Vec<DerivedComponentRecord> {
        self.state().components.values().cloned().collect()
    }

    pub fn seed_component(&self, variation_id: i64, gene_symbol: &str) {
        self.state().components.insert(
            variation_id,
            DerivedComponentRecord {
                variation_id,
                gene_symbol: gene_symbol.to_string(),
                transcript_id: "NM_000000.1".to_string(),
                dna_change: "c.1A>G".to_string(),
                protein_change: None,
            },
        );
    }

    pub fn seed_gene_count(&self, gene_symbol: &str, count: i64) {
        self.state()
            .gene_counts
            .insert(gene_symbol.to_string(), (count, Utc::now()));
    }

    pub fn gene_count(&self, gene_symbol: &str) -> Option<i64> {
        self.state().gene_counts.get(gene_symbol).map(|(count, _)| *count)
    }
}

#[async_trait]
impl BulkLoader for MemoryStore {
    async fn create_staging(
        &self,
        canonical: &str,
        columns: &[String],
        index_columns: &[String],
    ) -> Result<StagingHandle, StorageError> {
        let handle = StagingHandle::new(canonical, columns, index_columns)?;
        self.state().tables.insert(
            handle.staging.clone(),
            MemTable {
                columns: handle.columns.clone(),
                rows: Vec::new(),
            },
        );
        self.staging_created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn append_batch(&self, handle: &StagingHandle, rows: &[StagedRow]) -> Result<(), StorageError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.fail_appends.contains(&handle.canonical) {
            return Err(StorageError::Backend("injected append failure".to_string()));
        }
        let table = state
            .tables
            .get_mut(&handle.staging)
            .ok_or_else(|| StorageError::Backend(format!("{} does not exist", handle.staging)))?;
        table.rows.extend_from_slice(rows);
        Ok(())
    }

    async fn promote(&self, handle: &StagingHandle) -> Result<(), StorageError> {
        let mut state = self.state();
        let staged = state
            .tables
            .remove(&handle.staging)
            .ok_or_else(|| StorageError::Backend(format!("{} does not exist", handle.staging)))?;
        state.tables.insert(handle.canonical.clone(), staged);
        Ok(())
    }

    async fn rollback(&self, handle: &StagingHandle) -> Result<(), StorageError> {
        self.state().tables.remove(&handle.staging);
        Ok(())
    }
}

#[async_trait]
impl DerivedStore for MemoryStore {
    async fn truncate_components(&self) -> Result<(), StorageError> {
        let mut state = self.state();
        if state.fail_derived {
            return Err(StorageError::Backend("injected derived failure".to_string()));
        }
        state.components.clear();
        Ok(())
    }

    async fn fetch_name_page(
        &self,
        source_table: &str,
        after_row_id: i64,
        limit: i64,
    ) -> Result<Vec<NameRow>, StorageError> {
        let state = self.state();
        let table = state
            .tables
            .get(source_table)
            .ok_or_else(|| StorageError::Backend(format!("relation {source_table} does not exist")))?;
        let position = |name: &str| table.columns.iter().position(|c| c == name);
        let (id_idx, name_idx) = (position("variation_id"), position("name"));
        Ok(table
            .rows
            .iter()
            .filter(|row| row.row_id > after_row_id)
            .take(limit as usize)
            .map(|row| NameRow {
                row_id: row.row_id,
                variation_id: id_idx.and_then(|i| row.fields.get(i).cloned().flatten()),
                name: name_idx.and_then(|i| row.fields.get(i).cloned().flatten()),
            })
            .collect())
    }

    async fn insert_components(&self, rows: &[DerivedComponentRecord]) -> Result<u64, StorageError> {
        let mut state = self.state();
        let mut inserted = 0;
        for row in rows {
            if !state.components.contains_key(&row.variation_id) {
                state.components.insert(row.variation_id, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl GeneCountStore for MemoryStore {
    async fn list_gene_symbols(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state();
        let genes: BTreeSet<String> = state
            .components
            .values()
            .map(|c| c.gene_symbol.clone())
            .chain(state.gene_counts.keys().cloned())
            .collect();
        Ok(genes.into_iter().collect())
    }

    async fn upsert_gene_count(
        &self,
        gene_symbol: &str,
        count: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.state()
            .gene_counts
            .insert(gene_symbol.to_string(), (count, updated_at));
        Ok(())
    }
}

pub fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

#[derive(Debug, Clone)]
struct FixtureFile {
    bytes: Vec<u8>,
    /// `None` means the checksum companion cannot be fetched.
    checksum_body: Option<String>,
    last_modified: Option<NaiveDateTime>,
}

/// Serves gzipped fixture files with published MD5 companions.
#[derive(Debug, Default)]
pub struct FixtureRemote {
    files: BTreeMap<String, FixtureFile>,
    fail_listing: bool,
    downloads: Mutex<Vec<String>>,
}

impl FixtureRemote {
    pub fn with_tsv(mut self, name: &str, body: &str) -> Self {
        let bytes = gzip(body);
        let digest = ChecksumAlgorithm::Md5.digest_hex(&bytes);
        self.files.insert(
            name.to_string(),
            FixtureFile {
                bytes,
                checksum_body: Some(format!("{digest}  {name}\n")),
                last_modified: NaiveDateTime::parse_from_str("2024-05-06 13:40", "%Y-%m-%d %H:%M").ok(),
            },
        );
        self
    }

    pub fn with_raw(mut self, name: &str, bytes: Vec<u8>) -> Self {
        let digest = ChecksumAlgorithm::Md5.digest_hex(&bytes);
        self.files.insert(
            name.to_string(),
            FixtureFile {
                bytes,
                checksum_body: Some(format!("MD5 ({name}) = {digest}\n")),
                last_modified: None,
            },
        );
        self
    }

    pub fn without_checksum(mut self, name: &str) -> Self {
        if let Some(file) = self.files.get_mut(name) {
            file.checksum_body = None;
        }
        self
    }

    pub fn with_checksum_body(mut self, name: &str, body: &str) -> Self {
        if let Some(file) = self.files.get_mut(name) {
            file.checksum_body = Some(body.to_string());
        }
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSource for FixtureRemote {
    async fn list_files(&self, required: &[String]) -> Result<Vec<RemoteFileDescriptor>, AdapterError> {
        if self.fail_listing {
            return Err(AdapterError::Message("index unavailable".to_string()));
        }
        Ok(required
            .iter()
            .filter_map(|name| {
                self.files.get(name).map(|file| RemoteFileDescriptor {
                    name: name.clone(),
                    url: format!("https://fixture.invalid/clinvar/{name}"),
                    last_modified: file.last_modified,
                })
            })
            .collect())
    }

    async fn download(&self, file: &RemoteFileDescriptor, dest: &Path) -> Result<u64, AdapterError> {
        self.downloads.lock().unwrap().push(file.name.clone());
        let fixture = self
            .files
            .get(&file.name)
            .ok_or_else(|| AdapterError::Message(format!("http status 404 for {}", file.url)))?;
        tokio::fs::write(dest, &fixture.bytes)
            .await
            .map_err(|e| AdapterError::Anyhow(e.into()))?;
        Ok(fixture.bytes.len() as u64)
    }

    async fn fetch_checksum(
        &self,
        file: &RemoteFileDescriptor,
        _algorithm: ChecksumAlgorithm,
    ) -> Result<String, AdapterError> {
        self.files
            .get(&file.name)
            .and_then(|f| f.checksum_body.clone())
            .ok_or_else(|| AdapterError::Message("checksum not published".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub subject: String,
    pub success: bool,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, success: bool, body: &str) -> Result<(), AdapterError> {
        if self.fail {
            return Err(AdapterError::Message("mail api unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(SentNotification {
            subject: subject.to_string(),
            success,
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Canned esearch counts; unknown genes count zero.
#[derive(Debug, Default)]
pub struct StubGeneCounts {
    counts: BTreeMap<(String, bool), u64>,
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, QueryStrategy)>>,
}

impl StubGeneCounts {
    pub fn with(mut self, gene: &str, strategy: QueryStrategy, count: u64) -> Self {
        self.counts
            .insert((gene.to_string(), strategy == QueryStrategy::Tagged), count);
        self
    }

    pub fn failing(mut self, gene: &str) -> Self {
        self.failing.insert(gene.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, QueryStrategy)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GeneCountSource for StubGeneCounts {
    async fn count(&self, gene_symbol: &str, strategy: QueryStrategy) -> Result<u64, AdapterError> {
        self.calls
            .lock()
            .unwrap()
            .push((gene_symbol.to_string(), strategy));
        if self.failing.contains(gene_symbol) {
            return Err(AdapterError::Message(format!("esearch failed for {gene_symbol}")));
        }
        Ok(self
            .counts
            .get(&(gene_symbol.to_string(), strategy == QueryStrategy::Tagged))
            .copied()
            .unwrap_or(0))
    }
}
