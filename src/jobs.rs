use crate::backfill::{BackfillScheduler, SyncState};
use crate::store::StoreError;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info};

/// Recurring trigger for the backfill. One loop at most; it stops itself
/// once the scheduler reports there is nothing left to do.
#[derive(Clone)]
pub struct BackfillRunner {
    scheduler: Arc<BackfillScheduler>,
    period: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BackfillRunner {
    pub fn new(scheduler: Arc<BackfillScheduler>, period: Duration) -> Self {
        Self {
            scheduler,
            period,
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn scheduler(&self) -> &Arc<BackfillScheduler> {
        &self.scheduler
    }

    /// Start the loop unless it is already running. Returns whether a new
    /// loop was started.
    pub async fn arm(&self) -> bool {
        let mut guard = self.task.lock().await;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let scheduler = self.scheduler.clone();
        let period = self.period;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = scheduler.run_once().await;
                if !outcome.keeps_trigger() {
                    info!(target = "mautic_sync.backfill", ?outcome, "backfill trigger cancelled");
                    break;
                }
            }
        }));
        debug!(target = "mautic_sync.backfill", period_secs = period.as_secs(), "backfill trigger armed");
        true
    }

    pub async fn cancel(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!(target = "mautic_sync.backfill", "backfill trigger cancelled");
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Clear completion and progress, then arm again.
    pub async fn resync(&self) -> Result<(), StoreError> {
        self.cancel().await;
        self.scheduler.reset().await?;
        self.arm().await;
        info!(target = "mautic_sync.backfill", "resync of past orders requested");
        Ok(())
    }

    /// Arm when tagging is on and the pass has not finished yet.
    pub async fn arm_if_pending(&self, tagging_enabled: bool) -> Result<bool, StoreError> {
        if !tagging_enabled {
            return Ok(false);
        }
        if self.scheduler.state().await? == SyncState::Complete {
            return Ok(false);
        }
        Ok(self.arm().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::DEFAULT_BATCH_SIZE;
    use crate::settings::TaggingSource;
    use crate::tagger::OrderTagger;
    use crate::testing::{FakeContacts, MemoryOrders, configured_settings, store_with};

    async fn runner(completed: u64, sources: &[TaggingSource]) -> (BackfillRunner, Arc<FakeContacts>) {
        let store = store_with(&configured_settings(sources)).await;
        let api = Arc::new((1..=completed).fold(FakeContacts::new(), |api, id| {
            api.with_contact(&format!("buyer{id}@example.com"), id)
        }));
        let orders = Arc::new(MemoryOrders::with_completed(completed));
        let tagger = OrderTagger::new(orders, api.clone(), store.clone());
        let scheduler = Arc::new(BackfillScheduler::new(tagger, store, DEFAULT_BATCH_SIZE));
        (
            BackfillRunner::new(scheduler, Duration::from_millis(5)),
            api,
        )
    }

    async fn wait_until_idle(runner: &BackfillRunner) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.is_armed().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("runner should stop on its own");
    }

    #[tokio::test]
    async fn loop_stops_once_backfill_completes() {
        let (runner, api) = runner(120, &[TaggingSource::Categories]).await;
        assert!(runner.arm().await);
        assert!(!runner.arm().await);
        wait_until_idle(&runner).await;
        assert_eq!(api.edit_count(), 120);
        assert_eq!(
            runner.scheduler().state().await.unwrap(),
            SyncState::Complete
        );
        assert!(!runner.arm_if_pending(true).await.unwrap());
    }

    #[tokio::test]
    async fn resync_rearms_completed_pass() {
        let (runner, api) = runner(3, &[TaggingSource::Categories]).await;
        runner.arm().await;
        wait_until_idle(&runner).await;
        assert_eq!(api.edit_count(), 3);

        runner.resync().await.unwrap();
        wait_until_idle(&runner).await;
        assert_eq!(
            runner.scheduler().state().await.unwrap(),
            SyncState::Complete
        );
        // Orders carry the tagged marker, so the second pass sends nothing.
        assert_eq!(api.edit_count(), 3);
    }

    #[tokio::test]
    async fn disabled_tagging_is_not_armed_and_cancel_stops_loop() {
        let (runner, _) = runner(3, &[]).await;
        assert!(!runner.arm_if_pending(false).await.unwrap());
        assert!(runner.arm().await);
        runner.cancel().await;
        assert!(!runner.is_armed().await);
    }
}
