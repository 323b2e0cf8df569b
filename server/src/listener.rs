/// Queue listener task.
///
/// Polls the durable queue for due messages and hands each one to the
/// [`Scheduler`]. A run that returns `Ok` is acked; a run that fails is
/// nacked, so the queue redelivers it with backoff or, once attempts are
/// exhausted, writes the failure marker that the next instance start picks
/// up.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::kv::{KvStore, NackOutcome, QueueDelivery, StoreError};
use crate::scheduler::Scheduler;

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed { topic: String },
    Failed { topic: String, nack: NackOutcome },
    /// Acked and ignored.
    UnknownTopic { topic: String },
    /// Payload was not a topic string. Acked and ignored.
    BadPayload,
}

/// Handle for the listener task. Dropping it signals the task to stop
/// after its current message.
pub struct QueueListener {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueListener {
    /// Spawns the poll loop on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn KvStore>,
        scheduler: Arc<Scheduler>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(listen(store, scheduler, poll_interval, shutdown_rx));
        QueueListener {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signals the task to stop and waits for it to exit. Calling it twice
    /// is a no-op.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("Queue listener task panicked: {e}");
            }
        }
    }
}

impl Drop for QueueListener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn listen(
    store: Arc<dyn KvStore>,
    scheduler: Arc<Scheduler>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    log::info!("Queue listener started (poll every {}ms)", poll_interval.as_millis());

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match process_next(store.as_ref(), &scheduler).await {
            // Drain everything that is due before sleeping again.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => log::error!("Queue poll failed: {e}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    log::info!("Queue listener exiting.");
}

/// Dequeues and handles at most one message.
///
/// # Returns
///
/// * `Ok(None)` when nothing is due.
/// * `Err` only for store failures around the queue itself; a failing run is
///   reported as [`DeliveryOutcome::Failed`].
pub async fn process_next(
    store: &dyn KvStore,
    scheduler: &Scheduler,
) -> Result<Option<DeliveryOutcome>, StoreError> {
    let Some(delivery) = store.dequeue().await? else {
        return Ok(None);
    };

    let topic = match delivery.decode::<String>() {
        Ok(topic) => topic,
        Err(e) => {
            log::warn!("Dropping queue message {} with bad payload: {e}", delivery.id);
            ack(store, &delivery).await?;
            return Ok(Some(DeliveryOutcome::BadPayload));
        }
    };

    if topic != scheduler.topic() {
        log::warn!("Dropping queue message {} for unknown topic {topic}", delivery.id);
        ack(store, &delivery).await?;
        return Ok(Some(DeliveryOutcome::UnknownTopic { topic }));
    }

    log::debug!("Delivering {topic} (attempt {})", delivery.attempt);
    match scheduler.handle_message(&topic).await {
        Ok(_) => {
            ack(store, &delivery).await?;
            Ok(Some(DeliveryOutcome::Completed { topic }))
        }
        Err(e) => {
            log::error!("Handling {topic} failed on attempt {}: {e}", delivery.attempt);
            let nack = store.nack(&delivery).await?;
            match nack {
                NackOutcome::Redelivering { at_ms } => {
                    log::warn!("{topic} will be redelivered at {}", crate::clock::format_utc(at_ms))
                }
                NackOutcome::DeadLettered => {
                    log::error!("{topic} exhausted its delivery attempts")
                }
                NackOutcome::StaleLease => {
                    log::warn!("{topic} lease expired before the run finished")
                }
            }
            Ok(Some(DeliveryOutcome::Failed { topic, nack }))
        }
    }
}

async fn ack(store: &dyn KvStore, delivery: &QueueDelivery) -> Result<(), StoreError> {
    if !store.ack(delivery).await? {
        log::warn!(
            "Queue message {} lease expired before ack; it may run again",
            delivery.id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{AtomicOperation, KvStore, QueuePolicy};
    use crate::memory::MemoryStore;
    use bench_core::constants::COMPUTE_STATS_TOPIC;

    fn setup() -> (MemoryStore, Arc<Scheduler>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone(), QueuePolicy::default());
        let scheduler = Scheduler::new(
            COMPUTE_STATS_TOPIC,
            Arc::new(store.clone()),
            clock,
            Duration::from_secs(60),
        );
        (store, Arc::new(scheduler))
    }

    async fn push(store: &MemoryStore, payload: &str) {
        let op = AtomicOperation::new()
            .enqueue_json(payload, Duration::ZERO, vec![])
            .unwrap();
        store.commit(op).await.unwrap();
    }

    #[tokio::test]
    async fn empty_queue_yields_nothing() {
        let (store, scheduler) = setup();
        assert_eq!(process_next(&store, &scheduler).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_topic_is_acked() {
        let (store, scheduler) = setup();
        push(&store, "somethingElse").await;
        let outcome = process_next(&store, &scheduler).await.unwrap();
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::UnknownTopic {
                topic: "somethingElse".to_string()
            })
        );
        assert_eq!(store.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn successful_run_is_acked_and_rearmed() {
        let (store, scheduler) = setup();
        push(&store, COMPUTE_STATS_TOPIC).await;
        let outcome = process_next(&store, &scheduler).await.unwrap();
        assert!(matches!(outcome, Some(DeliveryOutcome::Completed { .. })));
        // Only the re-armed run remains.
        assert_eq!(store.pending_delivery_times().await, vec![60_000]);
        assert_eq!(store.queued_messages().await, 1);
    }

    #[tokio::test]
    async fn spawned_listener_stops_on_shutdown() {
        let (store, scheduler) = setup();
        let mut listener =
            QueueListener::spawn(Arc::new(store), scheduler, Duration::from_millis(10));
        listener.shutdown().await;
        listener.shutdown().await;
    }
}
