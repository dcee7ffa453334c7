//! Core domain model for seller catalog ingestion.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type OfferId = i64;
pub type SellerId = i64;
pub type TaskId = i64;

/// One validated catalog row before it is attributed to a seller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDraft {
    pub offer_id: OfferId,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i64,
    pub available: bool,
}

impl OfferDraft {
    pub fn for_seller(&self, seller_id: SellerId) -> Offer {
        Offer {
            offer_id: self.offer_id,
            name: self.name.clone(),
            price: self.price,
            quantity: self.quantity,
            available: self.available,
            seller_id,
        }
    }
}

/// Persisted catalog line; `(offer_id, seller_id)` is its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i64,
    pub available: bool,
    pub seller_id: SellerId,
}

impl Offer {
    /// True when any mutable field differs from the freshly parsed row.
    ///
    /// Price comparison is exact decimal equality.
    pub fn differs_from(&self, draft: &OfferDraft) -> bool {
        self.name != draft.name
            || self.price != draft.price
            || self.quantity != draft.quantity
            || self.available != draft.available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seller {
    pub seller_id: SellerId,
}

/// Lifecycle of one ingestion run.
///
/// There is no separate "created" state: a task is `Processing` from the
/// instant it exists until its single terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Finished,
    Error(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Processing)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        TaskStatus::Error(reason.into())
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Processing => f.write_str("Processing"),
            TaskStatus::Finished => f.write_str("Finished"),
            TaskStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTaskStatus(pub String);

impl fmt::Display for UnknownTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task status {:?}", self.0)
    }
}

impl std::error::Error for UnknownTaskStatus {}

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Processing" => Ok(TaskStatus::Processing),
            "Finished" => Ok(TaskStatus::Finished),
            other => other
                .strip_prefix("Error:")
                .map(|reason| TaskStatus::Error(reason.trim_start().to_string()))
                .ok_or_else(|| UnknownTaskStatus(other.to_string())),
        }
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Outcome counters written with the terminal status; zero until then.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub lines_parsed: u64,
    pub new_offers: u64,
    pub updated_offers: u64,
    pub errors: u64,
}

/// Durable record of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: TaskId,
    pub url: String,
    pub seller_id: SellerId,
    pub status: TaskStatus,
    pub elapsed: Option<Duration>,
    pub counters: TaskCounters,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskLog {
    pub fn processing(task_id: TaskId, url: impl Into<String>, seller_id: SellerId) -> Self {
        Self {
            task_id,
            url: url.into(),
            seller_id,
            status: TaskStatus::Processing,
            elapsed: None,
            counters: TaskCounters::default(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal write applied to a `Processing` task log.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLogUpdate {
    pub status: TaskStatus,
    pub elapsed: Duration,
    pub counters: TaskCounters,
    pub finished_at: DateTime<Utc>,
}

/// Offer lookup filters; every absent filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferQuery {
    pub offer_id: Option<OfferId>,
    pub seller_id: Option<SellerId>,
    pub name_contains: Option<String>,
}

impl OfferQuery {
    pub fn matches(&self, offer: &Offer) -> bool {
        self.offer_id.map_or(true, |id| offer.offer_id == id)
            && self.seller_id.map_or(true, |id| offer.seller_id == id)
            && self
                .name_contains
                .as_deref()
                .map_or(true, |needle| offer.name.contains(needle))
    }
}
