//! Remote-facing adapters: the ClinVar directory index, the esearch count API
//! and the run-summary notifier.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use cvsync_core::RemoteFileDescriptor;
use cvsync_storage::{ChecksumAlgorithm, FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cvsync-adapters";

/// Timestamp layout used by Apache/nginx autoindex listings.
const INDEX_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response from {url}: {message}")]
    UnexpectedResponse { url: String, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// True when the failure happened on the local disk rather than the wire.
    pub fn is_local_io(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_local_io())
    }
}

/// Directory-style source of published files.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Descriptors for the `required` names the index advertises, in the
    /// order given. Names that are not listed are left out.
    async fn list_files(&self, required: &[String]) -> Result<Vec<RemoteFileDescriptor>, AdapterError>;

    /// Stream `file` into `dest`, returning bytes written.
    async fn download(&self, file: &RemoteFileDescriptor, dest: &Path) -> Result<u64, AdapterError>;

    /// Raw body of the published checksum companion for `file`.
    async fn fetch_checksum(
        &self,
        file: &RemoteFileDescriptor,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpRemoteSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn list_files(&self, required: &[String]) -> Result<Vec<RemoteFileDescriptor>, AdapterError> {
        let page = self.http.fetch_bytes(&self.base_url).await?;
        let listed = parse_directory_index(&page.text(), &self.base_url)?;
        info!(
            base_url = %self.base_url,
            listed = listed.len(),
            "fetched remote directory index"
        );
        Ok(select_required(listed, required))
    }

    async fn download(&self, file: &RemoteFileDescriptor, dest: &Path) -> Result<u64, AdapterError> {
        let downloaded = self.http.download_to_path(&file.url, dest).await?;
        Ok(downloaded.bytes)
    }

    async fn fetch_checksum(
        &self,
        file: &RemoteFileDescriptor,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, AdapterError> {
        let url = algorithm.checksum_url(&file.url);
        let resp = self.http.fetch_bytes(&url).await?;
        Ok(resp.text())
    }
}

/// Keep only the `required` names, in the order they were requested.
pub fn select_required(
    listed: Vec<RemoteFileDescriptor>,
    required: &[String],
) -> Vec<RemoteFileDescriptor> {
    required
        .iter()
        .filter_map(|name| listed.iter().find(|d| &d.name == name).cloned())
        .collect()
}

/// Extract file entries from an autoindex HTML page. Parent links, sort links,
/// absolute paths and subdirectories are ignored.
pub fn parse_directory_index(
    html: &str,
    base_url: &str,
) -> Result<Vec<RemoteFileDescriptor>, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut out: Vec<RemoteFileDescriptor> = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('?')
            || href.starts_with('/')
            || href.starts_with('#')
            || href.starts_with("..")
            || href.ends_with('/')
        {
            continue;
        }

        let (name, url) = if href.contains("://") {
            if !href.starts_with(base_url) {
                continue;
            }
            let name = href[base_url.len()..].to_string();
            (name, href.to_string())
        } else {
            (href.to_string(), format!("{base_url}{href}"))
        };
        if name.is_empty() || name.contains('/') || out.iter().any(|d| d.name == name) {
            continue;
        }

        out.push(RemoteFileDescriptor {
            name,
            url,
            last_modified: listed_timestamp(anchor),
        });
    }
    Ok(out)
}

fn listed_timestamp(anchor: ElementRef<'_>) -> Option<NaiveDateTime> {
    // <pre> listings: "<a ..>name</a>   2024-05-06 14:02  1.2M"
    if let Some(text) = anchor.next_sibling().and_then(|n| n.value().as_text()) {
        if let Some(ts) = parse_index_timestamp(text) {
            return Some(ts);
        }
    }

    // <table> listings: the timestamp sits in a following <td>.
    let cell = anchor.parent().and_then(ElementRef::wrap)?;
    if cell.value().name() != "td" {
        return None;
    }
    cell.next_siblings()
        .filter_map(ElementRef::wrap)
        .find_map(|td| parse_index_timestamp(&td.text().collect::<String>()))
}

fn parse_index_timestamp(text: &str) -> Option<NaiveDateTime> {
    let mut parts = text.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), INDEX_TIMESTAMP_FORMAT).ok()
}

/// How a gene symbol is phrased in an esearch term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// `BRCA2[gene]`
    Tagged,
    /// `BRCA2`
    Untagged,
}

impl QueryStrategy {
    pub fn term(&self, gene_symbol: &str) -> String {
        match self {
            Self::Tagged => format!("{gene_symbol}[gene]"),
            Self::Untagged => gene_symbol.to_string(),
        }
    }
}

#[async_trait]
pub trait GeneCountSource: Send + Sync {
    async fn count(&self, gene_symbol: &str, strategy: QueryStrategy) -> Result<u64, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct EsearchClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
    database: String,
    api_key: Option<String>,
}

impl EsearchClient {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            database: "clinvar".to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl GeneCountSource for EsearchClient {
    async fn count(&self, gene_symbol: &str, strategy: QueryStrategy) -> Result<u64, AdapterError> {
        let term = strategy.term(gene_symbol);
        let mut query: Vec<(&str, &str)> = vec![
            ("db", self.database.as_str()),
            ("term", term.as_str()),
            ("retmode", "json"),
            ("retmax", "0"),
        ];
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.as_str()));
        }
        let resp = self.http.fetch_bytes_with_query(&self.endpoint, &query).await?;
        parse_esearch_count(&resp.body).map_err(|message| AdapterError::UnexpectedResponse {
            url: self.endpoint.clone(),
            message,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EsearchEnvelope {
    esearchresult: Option<EsearchResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EsearchResult {
    count: Option<String>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

/// Pull `esearchresult.count` out of an esearch JSON body.
pub fn parse_esearch_count(body: &[u8]) -> Result<u64, String> {
    let envelope: EsearchEnvelope =
        serde_json::from_slice(body).map_err(|e| format!("invalid esearch json: {e}"))?;
    if let Some(err) = envelope.error {
        return Err(err);
    }
    let result = envelope
        .esearchresult
        .ok_or_else(|| "missing esearchresult".to_string())?;
    if let Some(err) = result.error {
        return Err(err);
    }
    let count = result.count.ok_or_else(|| "missing count".to_string())?;
    count
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("non-numeric count {count:?}: {e}"))
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, success: bool, body: &str) -> Result<(), AdapterError>;
}

/// Writes the summary to the tracing log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, success: bool, body: &str) -> Result<(), AdapterError> {
        if success {
            info!(subject, "{body}");
        } else {
            warn!(subject, "{body}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailApiConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: Vec<String>,
}

/// Sends the summary through a transactional email HTTP API.
#[derive(Debug, Clone)]
pub struct EmailApiNotifier {
    http: Arc<HttpFetcher>,
    config: EmailApiConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailPayload {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub tags: Vec<EmailTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailTag {
    pub name: String,
    pub value: String,
}

impl EmailApiNotifier {
    pub fn new(http: Arc<HttpFetcher>, config: EmailApiConfig) -> Self {
        Self { http, config }
    }

    pub fn payload(&self, subject: &str, success: bool, body: &str) -> EmailPayload {
        EmailPayload {
            from: self.config.from.clone(),
            to: self.config.to.clone(),
            subject: subject.to_string(),
            text: body.to_string(),
            tags: vec![EmailTag {
                name: "status".to_string(),
                value: if success { "success" } else { "failure" }.to_string(),
            }],
        }
    }
}

#[async_trait]
impl Notifier for EmailApiNotifier {
    async fn send(&self, subject: &str, success: bool, body: &str) -> Result<(), AdapterError> {
        if self.config.to.is_empty() {
            return Err(AdapterError::Message(
                "email notifier has no recipients".to_string(),
            ));
        }
        let payload = self.payload(subject, success, body);
        self.http
            .post_json(&self.config.api_url, Some(&self.config.api_key), &payload)
            .await?;
        info!(subject, recipients = self.config.to.len(), "sent run notification");
        Ok(())
    }
}
