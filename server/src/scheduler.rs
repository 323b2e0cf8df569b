//! Fleet-wide singleton schedule for the recurring statistics job.
//!
//! Every instance runs [`Scheduler::startup`]. The schedule is claimed once,
//! ever, through a compare-and-set on `[topic, "lock"]`; after that it keeps
//! itself alive by re-enqueueing the next run at the end of each run. If the
//! queue gives up on a message it writes `[topic, "deliveryFailed"]`, and the
//! next instance to start wins a compare-and-delete on that marker and
//! restarts the chain.

use std::sync::Arc;
use std::time::Duration;

use bench_core::constants::{DELIVERY_FAILED, LAST_MESSAGE_DELIVERY, LOCK, NEXT_UPDATE};
use log::{error, info, warn};
use serde::Serialize;

use crate::aggregator::{AggregateError, AggregationReport, Aggregator};
use crate::clock::{duration_ms, format_utc, Clock};
use crate::kv::{
    get_json, set_json, AtomicOperation, CommitResult, Consistency, KvKey, KvStore, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule store access failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This instance took the lock and enqueued the first run.
    Claimed,
    AlreadyClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NoFailure,
    /// The marker was cleared and the topic re-enqueued by this instance.
    Restarted { topic: String },
    /// Another instance cleared the marker first.
    LostRace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub claim: ClaimOutcome,
    pub recovery: RecoveryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { deliver_at_ms: u64 },
    /// The enqueue did not commit. `next_delivery_ms` is whatever delivery
    /// time the store still holds, if any.
    Rejected { next_delivery_ms: Option<u64> },
}

/// Snapshot of the schedule keys, for diagnostics.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub lock_held: bool,
    pub next_delivery_ms: Option<u64>,
    pub last_delivery_ms: Option<u64>,
    pub delivery_failed: Option<String>,
}

fn topic_key(topic: &str, name: &str) -> KvKey {
    KvKey::pair(topic, name)
}

pub struct Scheduler {
    topic: String,
    store: Arc<dyn KvStore>,
    aggregator: Aggregator,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        topic: &str,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Scheduler {
            topic: topic.to_string(),
            aggregator: Aggregator::new(store.clone()),
            store,
            clock,
            interval,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Claim first, then look for a failed delivery. The order matters: a
    /// fresh deployment must not treat an absent lock as a failure.
    pub async fn startup(&self) -> Result<StartupReport, SchedulerError> {
        let claim = self.claim_schedule().await?;
        let recovery = self.recover_failed_delivery().await?;
        Ok(StartupReport { claim, recovery })
    }

    /// Takes the lock and enqueues the first run in one commit. Losing the
    /// race is silent.
    pub async fn claim_schedule(&self) -> Result<ClaimOutcome, SchedulerError> {
        let lock = topic_key(&self.topic, LOCK);
        let (op, deliver_at_ms) = self.enqueue_operation(&self.topic, Duration::ZERO)?;
        let op = op.check(lock.clone(), None).set_json(lock, &true)?;

        match self.store.commit(op).await? {
            CommitResult::Committed(_) => {
                info!(
                    "Claimed the {} schedule, first run at {}",
                    self.topic,
                    format_utc(deliver_at_ms)
                );
                Ok(ClaimOutcome::Claimed)
            }
            CommitResult::CheckFailed => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    /// Restarts a topic whose message the queue gave up on. Only the
    /// instance whose compare-and-delete on the marker commits re-enqueues.
    pub async fn recover_failed_delivery(&self) -> Result<RecoveryOutcome, SchedulerError> {
        let marker = topic_key(&self.topic, DELIVERY_FAILED);
        let Some((failed_topic, versionstamp)) =
            get_json::<String>(self.store.as_ref(), &marker, Consistency::Strong).await?
        else {
            return Ok(RecoveryOutcome::NoFailure);
        };

        warn!("Delivery of {failed_topic} failed earlier, restarting its schedule");
        let (op, _) = self.enqueue_operation(&failed_topic, Duration::ZERO)?;
        let op = op.check(marker.clone(), Some(versionstamp)).delete(marker);

        match self.store.commit(op).await? {
            CommitResult::Committed(_) => {
                info!("Re-enqueued {failed_topic} after failed delivery");
                Ok(RecoveryOutcome::Restarted {
                    topic: failed_topic,
                })
            }
            CommitResult::CheckFailed => Ok(RecoveryOutcome::LostRace),
        }
    }

    /// Enqueues `topic` for delivery after `delay` and records the delivery
    /// time. A failure is logged together with the delivery time the store
    /// still holds; it is never retried here.
    pub async fn enqueue(&self, topic: &str, delay: Duration) -> EnqueueOutcome {
        let result = match self.enqueue_operation(topic, delay) {
            Ok((op, deliver_at_ms)) => self.store.commit(op).await.map(|res| (res, deliver_at_ms)),
            Err(err) => Err(err),
        };

        match result {
            Ok((CommitResult::Committed(_), deliver_at_ms)) => {
                info!("Next {topic} run at {}", format_utc(deliver_at_ms));
                return EnqueueOutcome::Enqueued { deliver_at_ms };
            }
            Ok((CommitResult::CheckFailed, _)) => error!("Enqueue of {topic} was rejected"),
            Err(err) => error!("Enqueue of {topic} failed: {err}"),
        }

        let next_update = topic_key(topic, NEXT_UPDATE);
        let next_delivery_ms =
            match get_json::<u64>(self.store.as_ref(), &next_update, Consistency::Strong).await {
                Ok(found) => found.map(|(ms, _)| ms),
                Err(err) => {
                    error!("Failed to read {next_update}: {err}");
                    None
                }
            };
        match next_delivery_ms {
            Some(ms) => error!("{topic} remains scheduled for {}", format_utc(ms)),
            None => error!("{topic} has no scheduled delivery"),
        }
        EnqueueOutcome::Rejected { next_delivery_ms }
    }

    /// Handles one queue delivery: note it, recompute, arm the next run.
    /// Errors propagate so the message is handed back to the queue.
    pub async fn handle_message(&self, topic: &str) -> Result<AggregationReport, SchedulerError> {
        let now_ms = self.clock.now_ms();
        set_json(
            self.store.as_ref(),
            &topic_key(topic, LAST_MESSAGE_DELIVERY),
            &now_ms,
        )
        .await?;

        let report = self.aggregator.run().await?;
        self.enqueue(topic, self.interval).await;
        Ok(report)
    }

    pub async fn schedule_state(&self) -> Result<ScheduleState, SchedulerError> {
        let store = self.store.as_ref();
        let lock_held = store
            .get(&topic_key(&self.topic, LOCK), Consistency::Strong)
            .await?
            .is_some();
        let next_delivery_ms =
            get_json::<u64>(store, &topic_key(&self.topic, NEXT_UPDATE), Consistency::Strong).await?;
        let last_delivery_ms = get_json::<u64>(
            store,
            &topic_key(&self.topic, LAST_MESSAGE_DELIVERY),
            Consistency::Strong,
        )
        .await?;
        let delivery_failed = get_json::<String>(
            store,
            &topic_key(&self.topic, DELIVERY_FAILED),
            Consistency::Strong,
        )
        .await?;

        Ok(ScheduleState {
            lock_held,
            next_delivery_ms: next_delivery_ms.map(|(ms, _)| ms),
            last_delivery_ms: last_delivery_ms.map(|(ms, _)| ms),
            delivery_failed: delivery_failed.map(|(topic, _)| topic),
        })
    }

    fn enqueue_operation(
        &self,
        topic: &str,
        delay: Duration,
    ) -> Result<(AtomicOperation, u64), StoreError> {
        let deliver_at_ms = self.clock.now_ms().saturating_add(duration_ms(delay));
        let op = AtomicOperation::new()
            .enqueue_json(topic, delay, vec![topic_key(topic, DELIVERY_FAILED)])?
            .set_json(topic_key(topic, NEXT_UPDATE), &deliver_at_ms)?;
        Ok((op, deliver_at_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::QueuePolicy;
    use crate::kv::{KvEntry, NackOutcome, QueueDelivery};
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use bench_core::constants::COMPUTE_STATS_TOPIC;

    /// Delegates to a `MemoryStore` but refuses every commit that enqueues.
    struct RefusesEnqueues {
        inner: MemoryStore,
        as_error: bool,
    }

    #[async_trait]
    impl KvStore for RefusesEnqueues {
        async fn get(&self, key: &KvKey, consistency: Consistency) -> Result<Option<KvEntry>, StoreError> {
            self.inner.get(key, consistency).await
        }

        async fn list(&self, prefix: &KvKey, consistency: Consistency) -> Result<Vec<KvEntry>, StoreError> {
            self.inner.list(prefix, consistency).await
        }

        async fn commit(&self, operation: AtomicOperation) -> Result<CommitResult, StoreError> {
            match (operation.enqueues.is_empty(), self.as_error) {
                (true, _) => self.inner.commit(operation).await,
                (false, true) => Err(StoreError::Rejected("queue unavailable".to_string())),
                (false, false) => Ok(CommitResult::CheckFailed),
            }
        }

        async fn dequeue(&self) -> Result<Option<QueueDelivery>, StoreError> {
            self.inner.dequeue().await
        }

        async fn ack(&self, delivery: &QueueDelivery) -> Result<bool, StoreError> {
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: &QueueDelivery) -> Result<NackOutcome, StoreError> {
            self.inner.nack(delivery).await
        }
    }

    async fn refusing_scheduler(as_error: bool) -> (Scheduler, MemoryStore) {
        let clock = Arc::new(ManualClock::new(10_000));
        let inner = MemoryStore::new(clock.clone(), QueuePolicy::default());
        set_json(&inner, &topic_key(COMPUTE_STATS_TOPIC, NEXT_UPDATE), &42_000u64)
            .await
            .unwrap();
        let store = RefusesEnqueues {
            inner: inner.clone(),
            as_error,
        };
        let scheduler = Scheduler::new(
            COMPUTE_STATS_TOPIC,
            Arc::new(store),
            clock,
            Duration::from_secs(60),
        );
        (scheduler, inner)
    }

    fn scheduler() -> (Scheduler, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = MemoryStore::new(clock.clone(), QueuePolicy::default());
        let scheduler = Scheduler::new(
            COMPUTE_STATS_TOPIC,
            Arc::new(store.clone()),
            clock.clone(),
            Duration::from_secs(60),
        );
        (scheduler, store, clock)
    }

    #[tokio::test]
    async fn enqueue_records_next_update() {
        let (scheduler, store, _) = scheduler();
        let outcome = scheduler
            .enqueue(COMPUTE_STATS_TOPIC, Duration::from_secs(5))
            .await;
        assert_eq!(outcome, EnqueueOutcome::Enqueued { deliver_at_ms: 15_000 });
        assert_eq!(store.pending_delivery_times().await, vec![15_000]);

        let state = scheduler.schedule_state().await.unwrap();
        assert_eq!(state.next_delivery_ms, Some(15_000));
        assert!(!state.lock_held);
    }

    #[tokio::test]
    async fn second_claim_is_silent() {
        let (scheduler, store, _) = scheduler();
        assert_eq!(scheduler.claim_schedule().await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            scheduler.claim_schedule().await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(store.queued_messages().await, 1);
    }

    #[tokio::test]
    async fn handle_message_rearms_after_interval() {
        let (scheduler, store, clock) = scheduler();
        let report = scheduler.handle_message(COMPUTE_STATS_TOPIC).await.unwrap();
        assert_eq!(report.measurements, 0);

        let state = scheduler.schedule_state().await.unwrap();
        assert_eq!(state.last_delivery_ms, Some(clock.now_ms()));
        assert_eq!(state.next_delivery_ms, Some(clock.now_ms() + 60_000));
        assert_eq!(store.pending_delivery_times().await, vec![70_000]);
    }

    #[tokio::test]
    async fn schedule_state_serializes_camel_case() {
        let (scheduler, _, _) = scheduler();
        scheduler.claim_schedule().await.unwrap();
        let state = scheduler.schedule_state().await.unwrap();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["lockHeld"], true);
        assert_eq!(json["nextDeliveryMs"], 10_000);
        assert!(json["deliveryFailed"].is_null());
    }

    #[tokio::test]
    async fn failed_enqueue_reports_stored_delivery_time() {
        for as_error in [true, false] {
            let (scheduler, inner) = refusing_scheduler(as_error).await;
            let outcome = scheduler
                .enqueue(COMPUTE_STATS_TOPIC, Duration::from_secs(5))
                .await;
            assert_eq!(
                outcome,
                EnqueueOutcome::Rejected {
                    next_delivery_ms: Some(42_000)
                }
            );
            assert_eq!(inner.queued_messages().await, 0);
        }
    }

    #[tokio::test]
    async fn failed_rearm_still_completes_the_run() {
        let (scheduler, inner) = refusing_scheduler(true).await;
        let report = scheduler.handle_message(COMPUTE_STATS_TOPIC).await.unwrap();
        assert_eq!(report.measurements, 0);
        assert_eq!(inner.queued_messages().await, 0);

        let state = scheduler.schedule_state().await.unwrap();
        assert_eq!(state.last_delivery_ms, Some(10_000));
        assert_eq!(state.next_delivery_ms, Some(42_000));
    }
}
