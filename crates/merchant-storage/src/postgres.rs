use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use merchant_core::{
    Offer, OfferId, OfferQuery, SellerId, TaskCounters, TaskId, TaskLog, TaskLogUpdate,
    TaskStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::{OfferStore, StoreError};

const OFFER_COLUMNS: &str = "id, name, price, quantity, available, seller_id";

#[derive(Debug, Clone)]
pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn offer_from_row(row: &PgRow) -> Result<Offer, StoreError> {
    Ok(Offer {
        offer_id: row.try_get("id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        available: row.try_get("available")?,
        seller_id: row.try_get("seller_id")?,
    })
}

fn task_log_from_row(row: &PgRow) -> Result<TaskLog, StoreError> {
    let raw_status: String = row.try_get("status")?;
    let status: TaskStatus = raw_status
        .parse()
        .map_err(|err| StoreError::Corrupt(format!("task_log.status: {err}")))?;
    let elapsed_micros: Option<i64> = row.try_get("elapsed_micros")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;

    Ok(TaskLog {
        task_id: row.try_get("id")?,
        url: row.try_get("url")?,
        seller_id: row.try_get("seller_id")?,
        status,
        elapsed: elapsed_micros.map(|v| Duration::from_micros(from_db_count(v))),
        counters: TaskCounters {
            lines_parsed: from_db_count(row.try_get("lines_parsed")?),
            new_offers: from_db_count(row.try_get("new_offers")?),
            updated_offers: from_db_count(row.try_get("updated_offers")?),
            errors: from_db_count(row.try_get("errors")?),
        },
        created_at,
        finished_at,
    })
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn seller_exists(&self, seller_id: SellerId) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM seller WHERE id = $1)",
        )
        .bind(seller_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_seller(&self, seller_id: SellerId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO seller (id) VALUES ($1)")
            .bind(seller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_offer(
        &self,
        offer_id: OfferId,
        seller_id: SellerId,
    ) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer WHERE id = $1 AND seller_id = $2"
        ))
        .bind(offer_id)
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn insert_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO offer (id, name, price, quantity, available, seller_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(offer.offer_id)
        .bind(&offer.name)
        .bind(offer.price)
        .bind(offer.quantity)
        .bind(offer.available)
        .bind(offer.seller_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offer
               SET name = $1,
                   price = $2,
                   quantity = $3,
                   available = $4
             WHERE id = $5
               AND seller_id = $6
            "#,
        )
        .bind(&offer.name)
        .bind(offer.price)
        .bind(offer.quantity)
        .bind(offer.available)
        .bind(offer.offer_id)
        .bind(offer.seller_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(format!(
                "offer ({}, {})",
                offer.offer_id, offer.seller_id
            )));
        }
        Ok(())
    }

    async fn find_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, StoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {OFFER_COLUMNS} FROM offer WHERE TRUE"));
        if let Some(offer_id) = query.offer_id {
            builder.push(" AND id = ").push_bind(offer_id);
        }
        if let Some(seller_id) = query.seller_id {
            builder.push(" AND seller_id = ").push_bind(seller_id);
        }
        if let Some(needle) = &query.name_contains {
            // strpos keeps the needle literal; LIKE would treat % and _ as wildcards.
            builder
                .push(" AND strpos(name, ")
                .push_bind(needle.clone())
                .push(") > 0");
        }
        builder.push(" ORDER BY seller_id, id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn create_task_log(&self, url: &str, seller_id: SellerId) -> Result<TaskId, StoreError> {
        let task_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO task_log (url, seller_id, status) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(url)
        .bind(seller_id)
        .bind(TaskStatus::Processing.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(task_id)
    }

    async fn update_task_log(
        &self,
        task_id: TaskId,
        update: &TaskLogUpdate,
    ) -> Result<bool, StoreError> {
        let elapsed_micros = i64::try_from(update.elapsed.as_micros()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            UPDATE task_log
               SET status = $1,
                   elapsed_micros = $2,
                   lines_parsed = $3,
                   new_offers = $4,
                   updated_offers = $5,
                   errors = $6,
                   finished_at = $7
             WHERE id = $8
               AND status = $9
            "#,
        )
        .bind(update.status.to_string())
        .bind(elapsed_micros)
        .bind(to_db_count(update.counters.lines_parsed))
        .bind(to_db_count(update.counters.new_offers))
        .bind(to_db_count(update.counters.updated_offers))
        .bind(to_db_count(update.counters.errors))
        .bind(update.finished_at)
        .bind(task_id)
        .bind(TaskStatus::Processing.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_task_log(&self, task_id: TaskId) -> Result<Option<TaskLog>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, url, seller_id, status, elapsed_micros,
                   lines_parsed, new_offers, updated_offers, errors,
                   created_at, finished_at
              FROM task_log
             WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_log_from_row).transpose()
    }
}
