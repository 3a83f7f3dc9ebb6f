//! Catalog persistence (raw snapshots + canonical merge) and page fetching.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use shelf_core::{ProductRecord, CANONICAL_COLUMNS};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-storage";

pub const CANONICAL_FILE: &str = "products.csv";
pub const RAW_DIR: &str = "raw";
pub const PROCESSED_DIR: &str = "processed";

const BOM: &str = "\u{FEFF}";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding catalog rows: {0}")]
    Encode(#[source] csv::Error),
    #[error("catalog {} is not a readable product csv: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> CatalogError + 'a {
    move |source| CatalogError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub canonical_path: PathBuf,
    pub history_path: PathBuf,
    pub prior_count: usize,
    pub accepted_incoming: usize,
    pub dropped_invalid: usize,
    /// Rows of the prior catalog that no longer qualify (no name, or no positive price).
    pub dropped_prior: usize,
    pub final_count: usize,
    /// Where an unreadable prior catalog was moved before being replaced.
    pub quarantined_path: Option<PathBuf>,
}

impl MergeOutcome {
    pub fn recovered_from_corruption(&self) -> bool {
        self.quarantined_path.is_some()
    }
}

/// Directory-backed catalog: `products.csv`, `raw/` and `processed/` under one root.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    root: PathBuf,
}

impl CatalogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.root.join(CANONICAL_FILE)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    /// Write an immutable snapshot of this run's records under `raw/`.
    pub async fn append_raw(&self, records: &[ProductRecord], label: &str) -> Result<PathBuf, CatalogError> {
        self.append_raw_at(records, label, Utc::now()).await
    }

    pub async fn append_raw_at(
        &self,
        records: &[ProductRecord],
        label: &str,
        at: DateTime<Utc>,
    ) -> Result<PathBuf, CatalogError> {
        let bytes = encode_csv(records)?;
        let path = unused_snapshot_path(&self.raw_dir(), label, at).await?;
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), records = records.len(), "raw snapshot written");
        Ok(path)
    }

    /// Merge `incoming` into the canonical catalog, last write wins per url,
    /// and keep a timestamped copy of the result under `processed/`.
    pub async fn merge_and_persist(
        &self,
        incoming: &[ProductRecord],
        label: &str,
    ) -> Result<MergeOutcome, CatalogError> {
        let at = Utc::now();
        let span = info_span!("catalog_merge", root = %self.root.display(), incoming = incoming.len());
        async move {
            let valid = incoming.iter().filter(|r| r.is_catalogable()).cloned().collect::<Vec<_>>();
            let dropped_invalid = incoming.len() - valid.len();
            let accepted = dedupe_keep_first(valid);

            let (loaded, quarantined_path) = self.load_base(label, at).await?;
            let loaded_count = loaded.len();
            let base = loaded.into_iter().filter(ProductRecord::is_catalogable).collect::<Vec<_>>();
            let dropped_prior = loaded_count - base.len();
            if dropped_prior > 0 {
                warn!(dropped_prior, "prior catalog rows without a usable price removed");
            }
            let prior_count = base.len();
            let accepted_incoming = accepted.len();
            let merged = merge_records(base, accepted);

            let bytes = encode_csv(&merged)?;
            let canonical_path = self.canonical_path();
            write_atomic(&canonical_path, &bytes).await?;
            let history_path = unused_snapshot_path(&self.processed_dir(), label, at).await?;
            write_atomic(&history_path, &bytes).await?;

            info!(
                prior = prior_count,
                accepted = accepted_incoming,
                dropped_invalid,
                total = merged.len(),
                "catalog merged"
            );
            Ok::<_, CatalogError>(MergeOutcome {
                canonical_path,
                history_path,
                prior_count,
                accepted_incoming,
                dropped_invalid,
                dropped_prior,
                final_count: merged.len(),
                quarantined_path,
            })
        }
        .instrument(span)
        .await
    }

    /// Canonical records; a missing or empty file is an empty catalog.
    pub async fn load(&self) -> Result<Vec<ProductRecord>, CatalogError> {
        let path = self.canonical_path();
        match read_if_present(&path).await? {
            None => Ok(Vec::new()),
            Some(bytes) => decode_csv(&bytes).map_err(|source| CatalogError::Corrupt { path, source }),
        }
    }

    /// Replace the canonical catalog with a header-only file.
    pub async fn reset(&self) -> Result<PathBuf, CatalogError> {
        let path = self.canonical_path();
        write_atomic(&path, &encode_csv(&[])?).await?;
        info!(path = %path.display(), "catalog reset");
        Ok(path)
    }

    async fn load_base(
        &self,
        label: &str,
        at: DateTime<Utc>,
    ) -> Result<(Vec<ProductRecord>, Option<PathBuf>), CatalogError> {
        match self.load().await {
            Ok(records) => Ok((records, None)),
            Err(CatalogError::Corrupt { path, source }) => {
                let quarantine = unused_snapshot_path(&self.processed_dir(), &format!("corrupt_{label}"), at).await?;
                if let Some(parent) = quarantine.parent() {
                    fs::create_dir_all(parent).await.map_err(io_err("creating directory", parent))?;
                }
                fs::rename(&path, &quarantine)
                    .await
                    .map_err(io_err("quarantining corrupt catalog", &path))?;
                warn!(
                    path = %path.display(),
                    moved_to = %quarantine.display(),
                    error = %source,
                    "canonical catalog unreadable; merging onto an empty base"
                );
                Ok((Vec::new(), Some(quarantine)))
            }
            Err(err) => Err(err),
        }
    }
}

/// Keep the first record per url, preserving order.
pub fn dedupe_keep_first(records: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let mut seen = HashSet::new();
    records.into_iter().filter(|r| seen.insert(r.url.clone())).collect()
}

/// Concatenate `base` then `incoming` and keep the last record per url.
/// Survivors stay in the position of their last occurrence.
pub fn merge_records(base: Vec<ProductRecord>, incoming: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let mut seen = HashSet::new();
    let mut merged = base
        .into_iter()
        .chain(incoming)
        .rev()
        .filter(|r| seen.insert(r.url.clone()))
        .collect::<Vec<_>>();
    merged.reverse();
    merged
}

fn encode_csv(records: &[ProductRecord]) -> Result<Vec<u8>, CatalogError> {
    let mut buf = BOM.as_bytes().to_vec();
    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&mut buf);
        writer.write_record(CANONICAL_COLUMNS).map_err(CatalogError::Encode)?;
        for record in records {
            writer.serialize(record).map_err(CatalogError::Encode)?;
        }
        writer.flush().map_err(|e| CatalogError::Encode(e.into()))?;
    }
    Ok(buf)
}

fn decode_csv(bytes: &[u8]) -> Result<Vec<ProductRecord>, csv::Error> {
    let bytes = bytes.strip_prefix(BOM.as_bytes()).unwrap_or(bytes);
    csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes)
        .deserialize()
        .collect()
}

async fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, CatalogError> {
    match fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err("reading catalog", path)(err)),
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned = label
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>();
    if cleaned.trim_matches('_').is_empty() {
        "catalog".to_string()
    } else {
        cleaned
    }
}

/// `<label>_<YYYYmmdd_HHMMSS>.csv` in `dir`, with a short suffix if taken.
async fn unused_snapshot_path(dir: &Path, label: &str, at: DateTime<Utc>) -> Result<PathBuf, CatalogError> {
    let stem = format!("{}_{}", sanitize_label(label), at.format("%Y%m%d_%H%M%S"));
    let mut candidate = dir.join(format!("{stem}.csv"));
    while fs::try_exists(&candidate)
        .await
        .map_err(io_err("checking snapshot path", &candidate))?
    {
        let suffix = Uuid::new_v4().simple().to_string();
        candidate = dir.join(format!("{stem}_{}.csv", &suffix[..8]));
    }
    Ok(candidate)
}

/// Write through a temp file in the target directory, then rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CatalogError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(io_err("creating directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err("renaming temp file into", path)(err));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Where pages come from. The pipeline only ever sees this seam.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Uniform random duration in `[min, max]`; `min` when the range is empty.
pub fn uniform_delay<R: Rng + ?Sized>(min: Duration, max: Duration, rng: &mut R) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi > lo {
        Duration::from_millis(rng.gen_range(lo..=hi))
    } else {
        min
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the wait after failed attempt `attempt_index`:
    /// doubles from `min_delay`, capped at `max_delay`.
    pub fn ceiling_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.min_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .max(self.min_delay)
    }

    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        uniform_delay(self.min_delay, self.ceiling_for_attempt(attempt_index), rng)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP page source owned by one run: opened before the first page, closed after the last.
#[derive(Debug)]
pub struct FetchSession {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl FetchSession {
    pub fn open(config: FetchConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        debug!(attempts = config.backoff.max_attempts, "fetch session opened");
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn close(self) {
        debug!("fetch session closed");
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let last_attempt = attempt + 1 >= attempts;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return resp.text().await.map_err(|source| FetchError::Request {
                            url: final_url,
                            source,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(attempt, status = status.as_u16(), "retryable status");
                }
                Err(source) => {
                    if classify_reqwest_error(&source) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            source,
                        });
                    }
                    warn!(attempt, error = %source, "retryable request error");
                }
            }
            let delay = self.backoff.delay_for_attempt(attempt, &mut rand::thread_rng());
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageSource for FetchSession {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_text(url).await
    }
}
