//! Source fetching, source archiving and the offer store for catalog ingestion.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use merchant_core::{Offer, OfferId, OfferQuery, SellerId, TaskId, TaskLog, TaskLogUpdate};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

mod memory;
mod postgres;

pub use memory::MemoryOfferStore;
pub use postgres::PgOfferStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness or foreign-key violation, e.g. two runs inserting the same offer.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("missing row: {0}")]
    Missing(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if matches!(db_err.code().as_deref(), Some("23505") | Some("23503")) {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Persistence for sellers, offers and task logs.
///
/// Implementations serialize individual statements only; nothing here spans
/// a whole reconciliation batch.
#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn seller_exists(&self, seller_id: SellerId) -> Result<bool, StoreError>;

    async fn create_seller(&self, seller_id: SellerId) -> Result<(), StoreError>;

    async fn get_offer(
        &self,
        offer_id: OfferId,
        seller_id: SellerId,
    ) -> Result<Option<Offer>, StoreError>;

    async fn insert_offer(&self, offer: &Offer) -> Result<(), StoreError>;

    /// Overwrites every mutable field of the offer identified by `(offer_id, seller_id)`.
    async fn update_offer(&self, offer: &Offer) -> Result<(), StoreError>;

    async fn find_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, StoreError>;

    async fn create_task_log(&self, url: &str, seller_id: SellerId) -> Result<TaskId, StoreError>;

    /// Applies the terminal write. Returns `false` when no `Processing` row
    /// with this id exists.
    async fn update_task_log(
        &self,
        task_id: TaskId,
        update: &TaskLogUpdate,
    ) -> Result<bool, StoreError>;

    async fn get_task_log(&self, task_id: TaskId) -> Result<Option<TaskLog>, StoreError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrieves raw source bytes for one ingestion run.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` keeps the transport default.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some("merchant-ingest/0.1".to_string()),
        }
    }
}

/// Single-shot HTTP GET; no retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched source");
            Ok(body)
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSource {
    pub content_hash: String,
    pub path: PathBuf,
    /// The same bytes were already archived for this seller.
    pub reused: bool,
}

/// Keeps a copy of each fetched catalog at `seller-<id>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct SourceArchive {
    root: PathBuf,
}

impl SourceArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_for(&self, seller_id: SellerId, content_hash: &str, extension: &str) -> PathBuf {
        self.root
            .join(format!("seller-{seller_id}"))
            .join(format!("{content_hash}.{extension}"))
    }

    pub async fn store(
        &self,
        seller_id: SellerId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSource> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.path_for(seller_id, &content_hash, extension);

        let reused = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !reused {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            fs::write(&path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }

        Ok(ArchivedSource {
            content_hash,
            path,
            reused,
        })
    }
}
