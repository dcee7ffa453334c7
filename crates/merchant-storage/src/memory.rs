use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use merchant_core::{Offer, OfferId, OfferQuery, SellerId, TaskId, TaskLog, TaskLogUpdate};
use tokio::sync::RwLock;

use crate::{OfferStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    sellers: BTreeSet<SellerId>,
    offers: BTreeMap<(SellerId, OfferId), Offer>,
    tasks: BTreeMap<TaskId, TaskLog>,
    last_task_id: TaskId,
}

/// In-process store with the same key and reference rules as the SQL schema.
#[derive(Debug, Clone, Default)]
pub struct MemoryOfferStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require_seller(state: &MemoryState, seller_id: SellerId) -> Result<(), StoreError> {
    if state.sellers.contains(&seller_id) {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "seller {seller_id} does not exist"
        )))
    }
}

#[async_trait]
impl OfferStore for MemoryOfferStore {
    async fn seller_exists(&self, seller_id: SellerId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.sellers.contains(&seller_id))
    }

    async fn create_seller(&self, seller_id: SellerId) -> Result<(), StoreError> {
        if self.state.write().await.sellers.insert(seller_id) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!("seller {seller_id} already exists")))
        }
    }

    async fn get_offer(
        &self,
        offer_id: OfferId,
        seller_id: SellerId,
    ) -> Result<Option<Offer>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .offers
            .get(&(seller_id, offer_id))
            .cloned())
    }

    async fn insert_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        require_seller(&state, offer.seller_id)?;
        let key = (offer.seller_id, offer.offer_id);
        if state.offers.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "offer ({}, {}) already exists",
                offer.offer_id, offer.seller_id
            )));
        }
        state.offers.insert(key, offer.clone());
        Ok(())
    }

    async fn update_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.offers.get_mut(&(offer.seller_id, offer.offer_id)) {
            Some(existing) => {
                *existing = offer.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!(
                "offer ({}, {})",
                offer.offer_id, offer.seller_id
            ))),
        }
    }

    async fn find_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .offers
            .values()
            .filter(|offer| query.matches(offer))
            .cloned()
            .collect())
    }

    async fn create_task_log(&self, url: &str, seller_id: SellerId) -> Result<TaskId, StoreError> {
        let mut state = self.state.write().await;
        require_seller(&state, seller_id)?;
        state.last_task_id += 1;
        let task_id = state.last_task_id;
        state
            .tasks
            .insert(task_id, TaskLog::processing(task_id, url, seller_id));
        Ok(task_id)
    }

    async fn update_task_log(
        &self,
        task_id: TaskId,
        update: &TaskLogUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.is_terminal() {
            return Ok(false);
        }
        task.status = update.status.clone();
        task.elapsed = Some(update.elapsed);
        task.counters = update.counters;
        task.finished_at = Some(update.finished_at);
        Ok(true)
    }

    async fn get_task_log(&self, task_id: TaskId) -> Result<Option<TaskLog>, StoreError> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use merchant_core::{TaskCounters, TaskStatus};
    use rust_decimal::Decimal;

    use super::*;

    fn offer(offer_id: OfferId, seller_id: SellerId) -> Offer {
        Offer {
            offer_id,
            name: "Widget".into(),
            price: Decimal::new(999, 2),
            quantity: 5,
            available: true,
            seller_id,
        }
    }

    #[tokio::test]
    async fn offers_require_an_existing_seller() {
        let store = MemoryOfferStore::new();
        let err = store.insert_offer(&offer(1, 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.create_seller(3).await.unwrap();
        store.insert_offer(&offer(1, 3)).await.unwrap();
        assert_eq!(store.get_offer(1, 3).await.unwrap(), Some(offer(1, 3)));
        assert_eq!(store.get_offer(1, 4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let store = MemoryOfferStore::new();
        store.create_seller(3).await.unwrap();
        store.insert_offer(&offer(1, 3)).await.unwrap();
        let err = store.insert_offer(&offer(1, 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn task_log_accepts_a_single_terminal_write() {
        let store = MemoryOfferStore::new();
        store.create_seller(3).await.unwrap();
        let first = store.create_task_log("http://a", 3).await.unwrap();
        let second = store.create_task_log("http://b", 3).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let update = TaskLogUpdate {
            status: TaskStatus::Finished,
            elapsed: Duration::from_millis(12),
            counters: TaskCounters {
                lines_parsed: 1,
                new_offers: 1,
                updated_offers: 0,
                errors: 0,
            },
            finished_at: Utc::now(),
        };
        assert!(store.update_task_log(first, &update).await.unwrap());
        assert!(!store.update_task_log(first, &update).await.unwrap());
        assert!(!store.update_task_log(99, &update).await.unwrap());

        let log = store.get_task_log(first).await.unwrap().unwrap();
        assert_eq!(log.status, TaskStatus::Finished);
        assert_eq!(log.counters.new_offers, 1);
        assert_eq!(log.elapsed, Some(Duration::from_millis(12)));
    }
}
