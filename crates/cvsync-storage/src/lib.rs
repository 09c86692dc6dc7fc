//! Working directories, HTTP transfer, checksums and decompression for cvsync.

use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvsync-storage";

/// Name of the one log file that survives run-log rotation.
pub const PARSE_FAILURE_LOG: &str = "parse_failures.log";

const RUN_LOG_PREFIX: &str = "run-";
const RUN_LOG_SUFFIX: &str = ".log";
const IO_BUFFER_BYTES: usize = 256 * 1024;

/// The three directories a run works in. Download and temp are purged after
/// every run; logs keeps the parse-failure log plus rotated run logs.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    download_dir: PathBuf,
    temp_dir: PathBuf,
    logs_dir: PathBuf,
}

impl WorkDirs {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            download_dir: download_dir.into(),
            temp_dir: temp_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.download_dir, &self.temp_dir, &self.logs_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating work directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn download_path(&self, file_name: &str) -> PathBuf {
        self.download_dir.join(file_name)
    }

    /// Destination of the decompressed copy: the file name with `.gz` removed.
    pub fn decompressed_path(&self, file_name: &str) -> PathBuf {
        let plain = file_name.strip_suffix(".gz").unwrap_or(file_name);
        self.temp_dir.join(plain)
    }

    pub fn parse_failure_log_path(&self) -> PathBuf {
        self.logs_dir.join(PARSE_FAILURE_LOG)
    }

    pub fn run_log_path(&self, started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S");
        self.logs_dir
            .join(format!("{RUN_LOG_PREFIX}{stamp}-{run_id}{RUN_LOG_SUFFIX}"))
    }

    /// Remove everything inside the download and temp directories.
    pub async fn purge_transient(&self) -> anyhow::Result<usize> {
        let mut removed = 0usize;
        for dir in [&self.download_dir, &self.temp_dir] {
            if dir == &self.logs_dir {
                warn!(dir = %dir.display(), "transient directory is the logs directory; not purging");
                continue;
            }
            if !fs::try_exists(dir)
                .await
                .with_context(|| format!("checking {}", dir.display()))?
            {
                continue;
            }
            let mut entries = fs::read_dir(dir)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("listing {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("inspecting {}", path.display()))?;
                if file_type.is_dir() {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                }
                .with_context(|| format!("removing {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Keep the newest `keep` run logs and delete the rest. The parse-failure
    /// log is never a candidate.
    pub async fn rotate_run_logs(&self, keep: usize) -> anyhow::Result<usize> {
        if !fs::try_exists(&self.logs_dir)
            .await
            .with_context(|| format!("checking {}", self.logs_dir.display()))?
        {
            return Ok(0);
        }
        let mut run_logs = Vec::new();
        let mut entries = fs::read_dir(&self.logs_dir)
            .await
            .with_context(|| format!("reading {}", self.logs_dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.logs_dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name != PARSE_FAILURE_LOG
                && name.starts_with(RUN_LOG_PREFIX)
                && name.ends_with(RUN_LOG_SUFFIX)
            {
                run_logs.push(name);
            }
        }
        // Names embed a sortable timestamp.
        run_logs.sort();
        run_logs.reverse();

        let mut removed = 0usize;
        for name in run_logs.into_iter().skip(keep) {
            let path = self.logs_dir.join(&name);
            fs::remove_file(&path)
                .await
                .with_context(|| format!("removing rotated log {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Md5 => ".md5",
            Self::Sha256 => ".sha256",
        }
    }

    /// Checksums are published next to the data file under a fixed suffix.
    pub fn checksum_url(&self, file_url: &str) -> String {
        format!("{file_url}{}", self.file_suffix())
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        let mut digester = Digester::new(*self);
        digester.update(bytes);
        digester.finish()
    }
}

enum Digester {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl Digester {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(bytes),
            Self::Sha256(hasher) => hasher.update(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.finalize()),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Extract the digest from a published checksum file. Accepts both
/// `<hex>  <name>` and `MD5 (<name>) = <hex>` layouts.
pub fn parse_published_checksum(body: &str, algorithm: ChecksumAlgorithm) -> Option<String> {
    body.split(|c: char| c.is_whitespace() || c == '=' || c == '(' || c == ')')
        .find(|token| {
            token.len() == algorithm.hex_len() && token.chars().all(|c| c.is_ascii_hexdigit())
        })
        .map(|token| token.to_ascii_lowercase())
}

/// Digest a local file with a bounded read buffer on a blocking worker.
pub async fn file_digest_hex(path: &Path, algorithm: ChecksumAlgorithm) -> anyhow::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("opening {} for checksum", path.display()))?;
        let mut digester = Digester::new(algorithm);
        let mut buf = vec![0u8; IO_BUFFER_BYTES];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("reading {} for checksum", path.display()))?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        Ok(digester.finish())
    })
    .await
    .context("joining checksum worker")?
}

/// Stream a gzip file (multi-member aware) into `dest` through fixed-size
/// buffers. Returns the number of decompressed bytes written.
pub async fn decompress_gzip(src: &Path, dest: &Path) -> anyhow::Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
        let input = std::fs::File::open(&src)
            .with_context(|| format!("opening {} for decompression", src.display()))?;
        let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(IO_BUFFER_BYTES, input));

        let temp_path = sibling_temp_path(&dest);
        let output = std::fs::File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        let mut writer = BufWriter::with_capacity(IO_BUFFER_BYTES, output);

        let copied = std::io::copy(&mut decoder, &mut writer)
            .and_then(|n| std::io::Write::flush(&mut writer).map(|_| n));
        drop(writer);
        let bytes = match copied {
            Ok(n) => n,
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(err).with_context(|| {
                    format!("decompressing {} -> {}", src.display(), dest.display())
                });
            }
        };

        std::fs::rename(&temp_path, &dest).with_context(|| {
            format!(
                "renaming decompressed {} -> {}",
                temp_path.display(),
                dest.display()
            )
        })?;
        Ok(bytes)
    })
    .await
    .context("joining decompression worker")?
}

fn sibling_temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}.{}.part", Uuid::new_v4()))
}

/// Append-only record of rows the derived-table builder could not parse.
/// One tab-separated line per failure: timestamp, key, reason, original text.
#[derive(Debug)]
pub struct ParseFailureLog {
    path: PathBuf,
    writer: tokio::io::BufWriter<fs::File>,
    written: u64,
}

impl ParseFailureLog {
    pub async fn open_append(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening parse failure log {}", path.display()))?;
        Ok(Self {
            path,
            writer: tokio::io::BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn record(&mut self, key: &str, reason: &str, original: &str) -> anyhow::Result<()> {
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            Utc::now().to_rfc3339(),
            single_line(key),
            reason,
            single_line(original)
        );
        self.writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    pub async fn close(mut self) -> anyhow::Result<u64> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(self.written)
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applies to whole small requests (index, checksum, API calls).
    pub timeout: Duration,
    /// Applies to every connection, including large downloads.
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("incomplete download of {url}: expected {expected} bytes, wrote {written}")]
    Incomplete {
        url: String,
        expected: u64,
        written: u64,
    },
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// True when the failure happened on the local disk rather than the wire.
    pub fn is_local_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_with_query(url, &[]).await
    }

    pub async fn fetch_bytes_with_query(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_once(url, query).instrument(span).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", url);
        self.post_once(url, bearer_token, body)
            .instrument(span)
            .await
    }

    /// Stream a response body to `dest` without buffering it in memory. The
    /// body lands in a temp file next to `dest` and is renamed into place only
    /// once fully written.
    pub async fn download_to_path(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<DownloadedFile, FetchError> {
        let span = info_span!("http_download", url, dest = %dest.display());
        self.download_once(url, dest).instrument(span).await
    }

    async fn get_once(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).timeout(self.timeout);
        if !query.is_empty() {
            request = request.query(query);
        }
        let resp = request.send().await?;
        into_fetched(resp).await
    }

    async fn post_once<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).timeout(self.timeout).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        into_fetched(resp).await
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<DownloadedFile, FetchError> {
        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let expected = resp.content_length();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let temp_path = sibling_temp_path(dest);
        let file = fs::File::create(&temp_path)
            .await
            .map_err(|source| FetchError::Io {
                path: temp_path.clone(),
                source,
            })?;
        let mut writer = tokio::io::BufWriter::with_capacity(IO_BUFFER_BYTES, file);

        let streamed = stream_body(&mut resp, &mut writer, &temp_path).await;
        drop(writer);
        let written = match streamed {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Some(expected) = expected {
            if expected != written {
                let _ = fs::remove_file(&temp_path).await;
                return Err(FetchError::Incomplete {
                    url: url.to_string(),
                    expected,
                    written,
                });
            }
        }

        if let Err(source) = fs::rename(&temp_path, dest).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(FetchError::Io {
                path: dest.to_path_buf(),
                source,
            });
        }
        debug!(bytes = written, "download complete");
        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            bytes: written,
        })
    }
}

async fn into_fetched(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

async fn stream_body(
    resp: &mut reqwest::Response,
    writer: &mut tokio::io::BufWriter<fs::File>,
    temp_path: &Path,
) -> Result<u64, FetchError> {
    let io_err = |source: std::io::Error| FetchError::Io {
        path: temp_path.to_path_buf(),
        source,
    };
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        writer.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    writer.flush().await.map_err(io_err)?;
    writer.get_ref().sync_all().await.map_err(io_err)?;
    Ok(written)
}
