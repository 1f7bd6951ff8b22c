use crate::settings;
use crate::shop::MAX_PAGE_SIZE;
use crate::store::{self, KeyValueStore, StoreError, keys};
use crate::tagger::OrderTagger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Progress of the historical order pass. Orders created after
/// `start_time` are left to the live completion hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncCursor {
    pub start_time: DateTime<Utc>,
    pub total_count: u64,
    pub processed_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    NotStarted,
    Running(SyncCursor),
    Complete,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    AlreadyComplete,
    Disabled,
    Unconfigured,
    ApiUnavailable { reason: String },
    NothingToDo,
    Advanced { processed: u64, total: u64, batch: usize },
    Completed { processed: u64 },
    Failed { reason: String },
}

impl BackfillOutcome {
    /// Whether the recurring trigger should keep firing after this outcome.
    pub fn keeps_trigger(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyComplete | Self::NothingToDo | Self::Completed { .. }
        )
    }
}

pub struct BackfillScheduler {
    tagger: OrderTagger,
    store: Arc<dyn KeyValueStore>,
    batch_size: usize,
}

impl BackfillScheduler {
    pub fn new(tagger: OrderTagger, store: Arc<dyn KeyValueStore>, batch_size: usize) -> Self {
        Self {
            tagger,
            store,
            batch_size: batch_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub async fn state(&self) -> Result<SyncState, StoreError> {
        if self.store.get(keys::SYNC_COMPLETE).await?.is_some() {
            return Ok(SyncState::Complete);
        }
        Ok(
            match store::get_json::<SyncCursor>(self.store.as_ref(), keys::SYNC_CURSOR).await? {
                Some(cursor) => SyncState::Running(cursor),
                None => SyncState::NotStarted,
            },
        )
    }

    /// Forget completion and progress so the next run starts over.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.delete(keys::SYNC_COMPLETE).await?;
        self.store.delete(keys::SYNC_CURSOR).await
    }

    pub async fn run_once(&self) -> BackfillOutcome {
        let run_id = Uuid::new_v4();
        let outcome = match self.advance(run_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target = "mautic_sync.backfill", %run_id, error = %err, "backfill state unavailable");
                BackfillOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        debug!(target = "mautic_sync.backfill", %run_id, ?outcome, "backfill invocation finished");
        outcome
    }

    async fn advance(&self, run_id: Uuid) -> Result<BackfillOutcome, StoreError> {
        if self.store.get(keys::SYNC_COMPLETE).await?.is_some() {
            return Ok(BackfillOutcome::AlreadyComplete);
        }

        let settings = settings::load(self.store.as_ref()).await?;
        if !settings.tagging_enabled() {
            debug!(target = "mautic_sync.backfill", %run_id, "order sync disabled");
            return Ok(BackfillOutcome::Disabled);
        }
        if !settings.is_configured() {
            error!(
                target = "mautic_sync.backfill",
                %run_id,
                "failed to sync past orders as the service has not been configured"
            );
            return Ok(BackfillOutcome::Unconfigured);
        }
        if let Err(err) = self.tagger.api().ready().await {
            error!(target = "mautic_sync.backfill", %run_id, error = %err, "mautic unavailable, skipping run");
            return Ok(BackfillOutcome::ApiUnavailable {
                reason: err.to_string(),
            });
        }

        let orders = self.tagger.orders().clone();
        let mut cursor =
            match store::get_json::<SyncCursor>(self.store.as_ref(), keys::SYNC_CURSOR).await? {
                Some(cursor) => cursor,
                None => {
                    let total_count = match orders.count_completed().await {
                        Ok(total) => total,
                        Err(err) => {
                            error!(target = "mautic_sync.backfill", %run_id, error = %err, "failed to count completed orders");
                            return Ok(BackfillOutcome::Failed {
                                reason: err.to_string(),
                            });
                        }
                    };
                    if total_count == 0 {
                        error!(
                            target = "mautic_sync.backfill",
                            %run_id,
                            "failed to sync past orders as no completed orders were detected"
                        );
                        return Ok(BackfillOutcome::NothingToDo);
                    }
                    let cursor = SyncCursor {
                        start_time: Utc::now(),
                        total_count,
                        processed_count: 0,
                    };
                    store::set_json(self.store.as_ref(), keys::SYNC_CURSOR, &cursor, None).await?;
                    info!(target = "mautic_sync.backfill", %run_id, total = total_count, "order sync started");
                    cursor
                }
            };

        debug!(
            target = "mautic_sync.backfill",
            %run_id,
            offset = cursor.processed_count,
            limit = self.batch_size,
            "fetching batch"
        );
        let batch = match orders
            .completed_before(cursor.start_time, cursor.processed_count, self.batch_size)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                error!(target = "mautic_sync.backfill", %run_id, error = %err, "failed to fetch orders");
                return Ok(BackfillOutcome::Failed {
                    reason: err.to_string(),
                });
            }
        };

        if batch.is_empty() {
            return self.finish(run_id, cursor.processed_count).await;
        }

        for order_id in &batch {
            let outcome = self.tagger.tag(*order_id).await;
            debug!(target = "mautic_sync.backfill", %run_id, order_id, outcome = outcome.label(), "order processed");
        }
        crate::metrics::backfill_batch(batch.len());

        cursor.processed_count += batch.len() as u64;
        cursor.total_count = cursor.total_count.max(cursor.processed_count);

        // A short page means the next fetch would come back empty.
        if batch.len() < self.batch_size {
            return self.finish(run_id, cursor.processed_count).await;
        }

        store::set_json(self.store.as_ref(), keys::SYNC_CURSOR, &cursor, None).await?;
        info!(
            target = "mautic_sync.backfill",
            %run_id,
            processed = cursor.processed_count,
            total = cursor.total_count,
            "synced batch"
        );
        Ok(BackfillOutcome::Advanced {
            processed: cursor.processed_count,
            total: cursor.total_count,
            batch: batch.len(),
        })
    }

    async fn finish(&self, run_id: Uuid, processed: u64) -> Result<BackfillOutcome, StoreError> {
        self.store.set(keys::SYNC_COMPLETE, "1", None).await?;
        self.store.delete(keys::SYNC_CURSOR).await?;
        info!(target = "mautic_sync.backfill", %run_id, processed, "order sync complete");
        Ok(BackfillOutcome::Completed { processed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TaggingSource;
    use crate::testing::{
        FakeContacts, MemoryOrders, configured_settings, order_with_items, product_item,
        store_with,
    };

    struct Harness {
        scheduler: BackfillScheduler,
        api: Arc<FakeContacts>,
        orders: Arc<MemoryOrders>,
        store: Arc<dyn KeyValueStore>,
    }

    async fn harness(completed: u64, api: FakeContacts) -> Harness {
        let store = store_with(&configured_settings(&[TaggingSource::Categories])).await;
        let api = Arc::new(api);
        let orders = Arc::new(MemoryOrders::with_completed(completed));
        let tagger = OrderTagger::new(orders.clone(), api.clone(), store.clone());
        Harness {
            scheduler: BackfillScheduler::new(tagger, store.clone(), DEFAULT_BATCH_SIZE),
            api,
            orders,
            store,
        }
    }

    fn subscribed(count: u64) -> FakeContacts {
        (1..=count).fold(FakeContacts::new(), |api, id| {
            api.with_contact(&format!("buyer{id}@example.com"), 500 + id)
        })
    }

    #[tokio::test]
    async fn exhausts_120_orders_in_three_invocations() {
        let h = harness(120, subscribed(120)).await;

        assert_eq!(
            h.scheduler.run_once().await,
            BackfillOutcome::Advanced {
                processed: 50,
                total: 120,
                batch: 50
            }
        );
        assert!(matches!(
            h.scheduler.state().await.unwrap(),
            SyncState::Running(SyncCursor {
                processed_count: 50,
                total_count: 120,
                ..
            })
        ));
        assert!(h.scheduler.run_once().await.keeps_trigger());
        let last = h.scheduler.run_once().await;
        assert_eq!(last, BackfillOutcome::Completed { processed: 120 });
        assert!(!last.keeps_trigger());

        assert_eq!(h.scheduler.state().await.unwrap(), SyncState::Complete);
        assert!(h.store.get(keys::SYNC_CURSOR).await.unwrap().is_none());
        assert_eq!(h.api.edit_count(), 120);
        assert_eq!(h.scheduler.run_once().await, BackfillOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn oversized_batch_is_capped_at_shop_page_limit() {
        let h = harness(120, subscribed(120)).await;
        let tagger = OrderTagger::new(h.orders.clone(), h.api.clone(), h.store.clone());
        let scheduler = BackfillScheduler::new(tagger, h.store.clone(), 500);
        assert_eq!(
            scheduler.run_once().await,
            BackfillOutcome::Advanced {
                processed: 100,
                total: 120,
                batch: 100
            }
        );
        assert_eq!(
            scheduler.run_once().await,
            BackfillOutcome::Completed { processed: 120 }
        );
    }

    #[tokio::test]
    async fn exact_multiple_completes_on_empty_fetch() {
        let h = harness(100, subscribed(100)).await;
        assert!(matches!(
            h.scheduler.run_once().await,
            BackfillOutcome::Advanced { processed: 50, .. }
        ));
        assert!(matches!(
            h.scheduler.run_once().await,
            BackfillOutcome::Advanced { processed: 100, .. }
        ));
        assert_eq!(
            h.scheduler.run_once().await,
            BackfillOutcome::Completed { processed: 100 }
        );
    }

    #[tokio::test]
    async fn orders_after_start_are_left_for_the_live_hook() {
        let h = harness(3, subscribed(3)).await;
        h.store
            .set(
                keys::SYNC_CURSOR,
                &serde_json::to_string(&SyncCursor {
                    start_time: Utc::now() - chrono::Duration::days(60),
                    total_count: 3,
                    processed_count: 0,
                })
                .unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            h.scheduler.run_once().await,
            BackfillOutcome::Completed { processed: 0 }
        );
        assert_eq!(h.api.edit_count(), 0);
    }

    #[tokio::test]
    async fn resync_recomputes_total() {
        let h = harness(2, subscribed(3)).await;
        assert_eq!(
            h.scheduler.run_once().await,
            BackfillOutcome::Completed { processed: 2 }
        );

        h.orders.insert(order_with_items(
            3,
            "buyer3@example.com",
            None,
            vec![product_item(3, &["Gear"], &[])],
        ));
        h.scheduler.reset().await.unwrap();
        assert_eq!(h.scheduler.state().await.unwrap(), SyncState::NotStarted);

        // Already-tagged orders are skipped; the new one gets tagged.
        assert_eq!(
            h.scheduler.run_once().await,
            BackfillOutcome::Completed { processed: 3 }
        );
        assert_eq!(h.api.edit_count(), 3);
    }

    #[tokio::test]
    async fn resync_cursor_counts_current_orders() {
        let h = harness(60, subscribed(60)).await;
        h.scheduler.run_once().await;
        h.orders.insert(order_with_items(61, "late@example.com", None, vec![]));
        h.scheduler.reset().await.unwrap();
        h.scheduler.run_once().await;
        let SyncState::Running(cursor) = h.scheduler.state().await.unwrap() else {
            panic!("expected running state");
        };
        assert_eq!(cursor.total_count, 61);
    }

    #[tokio::test]
    async fn no_completed_orders_is_nothing_to_do() {
        let h = harness(0, FakeContacts::new()).await;
        let outcome = h.scheduler.run_once().await;
        assert_eq!(outcome, BackfillOutcome::NothingToDo);
        assert!(!outcome.keeps_trigger());
        assert_eq!(h.scheduler.state().await.unwrap(), SyncState::NotStarted);
    }

    #[tokio::test]
    async fn unavailable_api_leaves_cursor_untouched() {
        let h = harness(5, subscribed(5)).await;
        h.api.set_unavailable(true);
        let outcome = h.scheduler.run_once().await;
        assert!(matches!(outcome, BackfillOutcome::ApiUnavailable { .. }));
        assert!(outcome.keeps_trigger());
        assert_eq!(h.scheduler.state().await.unwrap(), SyncState::NotStarted);
    }

    #[tokio::test]
    async fn unconfigured_or_disabled_skips_without_state() {
        let h = harness(5, subscribed(5)).await;
        let mut settings = configured_settings(&[TaggingSource::Categories]);
        settings.client_secret.clear();
        crate::settings::save(h.store.as_ref(), &settings).await.unwrap();
        assert_eq!(h.scheduler.run_once().await, BackfillOutcome::Unconfigured);

        crate::settings::save(h.store.as_ref(), &configured_settings(&[]))
            .await
            .unwrap();
        assert_eq!(h.scheduler.run_once().await, BackfillOutcome::Disabled);
        assert_eq!(h.scheduler.state().await.unwrap(), SyncState::NotStarted);
    }
}
