use std::path::{Path, PathBuf};
use std::time::Instant;

use cvsync_core::ErrorKind;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::SourceSpec;
use crate::store::{BulkLoader, StagedRow, StagingHandle, StorageError};

const MARKER: u8 = b'#';
const MAX_COLUMN_NAME_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no header line starting with {token:?} in {}", .path.display())]
    MissingHeader { path: PathBuf, token: String },
    #[error("{} contains no data rows", .path.display())]
    Empty { path: PathBuf },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::FileSystemFailure,
            _ => ErrorKind::LoadFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub table: String,
    pub columns: Vec<String>,
    pub rows_loaded: u64,
    pub ragged_rows: u64,
    pub duration_ms: u64,
}

/// Stream a decompressed tab-delimited file into a fresh staging table and
/// promote it over the canonical table. On any failure the staging table is
/// dropped and the canonical table is left as it was.
pub async fn load_file(
    loader: &dyn BulkLoader,
    source: &SourceSpec,
    path: &Path,
    batch_size: usize,
) -> Result<LoadReport, LoadError> {
    let started = Instant::now();
    let file = File::open(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut lines = LineReader::new(BufReader::with_capacity(256 * 1024, file), path);

    let header = lines.find_header(&source.header_token).await?;
    let columns = match &source.fixed_columns {
        Some(fixed) => fixed.clone(),
        None => column_names(&header),
    };

    let handle = loader
        .create_staging(&source.canonical_table, &columns, &source.index_columns)
        .await?;
    debug!(staging = %handle.staging, columns = columns.len(), "created staging table");

    let streamed = stream_rows(loader, &handle, &mut lines, batch_size.max(1)).await;
    let (rows_loaded, ragged_rows) = match streamed {
        Ok((0, _)) => {
            discard(loader, &handle).await;
            return Err(LoadError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(counts) => counts,
        Err(err) => {
            discard(loader, &handle).await;
            return Err(err);
        }
    };

    if let Err(err) = loader.promote(&handle).await {
        discard(loader, &handle).await;
        return Err(err.into());
    }

    if ragged_rows > 0 {
        warn!(
            table = %handle.canonical,
            ragged_rows,
            "rows with a field count different from the header were padded or truncated"
        );
    }
    let report = LoadReport {
        table: handle.canonical.clone(),
        columns,
        rows_loaded,
        ragged_rows,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        table = %report.table,
        rows = report.rows_loaded,
        duration_ms = report.duration_ms,
        "promoted staging table"
    );
    Ok(report)
}

async fn discard(loader: &dyn BulkLoader, handle: &StagingHandle) {
    if let Err(err) = loader.rollback(handle).await {
        warn!(staging = %handle.staging, error = %err, "failed to drop staging table");
    }
}

async fn stream_rows(
    loader: &dyn BulkLoader,
    handle: &StagingHandle,
    lines: &mut LineReader,
    batch_size: usize,
) -> Result<(u64, u64), LoadError> {
    let width = handle.columns.len();
    let mut batch: Vec<StagedRow> = Vec::with_capacity(batch_size.min(65_536));
    let mut next_row_id: i64 = 1;
    let mut ragged = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() || line.as_bytes().first() == Some(&MARKER) {
            continue;
        }
        let (fields, was_ragged) = split_row(&line, width);
        if was_ragged {
            ragged += 1;
        }
        batch.push(StagedRow {
            row_id: next_row_id,
            fields,
        });
        next_row_id += 1;

        if batch.len() >= batch_size {
            loader.append_batch(handle, &batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        loader.append_batch(handle, &batch).await?;
    }
    Ok(((next_row_id - 1) as u64, ragged))
}

/// Split on tabs and fit to `width`: short rows get NULLs, long rows are cut.
pub fn split_row(line: &str, width: usize) -> (Vec<Option<String>>, bool) {
    let mut fields: Vec<Option<String>> = line.split('\t').map(|f| Some(f.to_string())).collect();
    let ragged = fields.len() != width;
    fields.resize(width, None);
    (fields, ragged)
}

/// Column names from a header line: snake_case, restricted to
/// `[a-z0-9_]`, de-duplicated with a numeric suffix.
pub fn column_names(header: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(header.len());
    for (i, raw) in header.iter().enumerate() {
        let mut base = snake_case(raw);
        if base.is_empty() {
            base = format!("column_{}", i + 1);
        }
        let mut name = base.clone();
        let mut n = 2;
        while out.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        out.push(name);
    }
    out
}

fn snake_case(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_lower)
                {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    let mut name = out.replace("__", "_").trim_matches('_').to_string();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name = format!("c_{name}");
    }
    name.truncate(MAX_COLUMN_NAME_LEN);
    name.trim_end_matches('_').to_string()
}

/// Byte-line reader that tolerates invalid UTF-8 and CRLF endings.
struct LineReader {
    reader: BufReader<File>,
    path: PathBuf,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(reader: BufReader<File>, path: &Path) -> Self {
        Self {
            reader,
            path: path.to_path_buf(),
            buf: Vec::with_capacity(4096),
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>, LoadError> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|source| LoadError::Io {
                path: self.path.clone(),
                source,
            })?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Skip ahead to the marker line whose text starts with `token` and
    /// return its tab-separated fields (marker removed).
    async fn find_header(&mut self, token: &str) -> Result<Vec<String>, LoadError> {
        while let Some(line) = self.next_line().await? {
            let Some(rest) = line.strip_prefix(MARKER as char) else {
                continue;
            };
            let rest = rest.trim_start();
            if rest.starts_with(token) {
                return Ok(rest.split('\t').map(|f| f.trim().to_string()).collect());
            }
        }
        Err(LoadError::MissingHeader {
            path: self.path.clone(),
            token: token.to_string(),
        })
    }
}
