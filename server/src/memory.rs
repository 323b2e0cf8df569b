use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::{duration_ms, Clock};
use crate::kv::{
    AtomicOperation, CommitResult, Consistency, KvEntry, KvKey, KvStore, Mutation, NackOutcome,
    QueueDelivery, QueuePolicy, StoreError, Versionstamp,
};

struct StoredEntry {
    key: KvKey,
    value: String,
    version: u64,
}

struct StoredMessage {
    payload: String,
    keys_if_undelivered: Vec<KvKey>,
    attempts: u32,
    /// `(token, deadline_ms)` while handed out to a consumer.
    lease: Option<(u64, u64)>,
}

#[derive(Default)]
struct Inner {
    version: u64,
    entries: BTreeMap<String, StoredEntry>,
    message_seq: u64,
    lease_seq: u64,
    messages: HashMap<u64, StoredMessage>,
    /// `(ready_at_ms, id)` of every message waiting for delivery.
    ready: BTreeSet<(u64, u64)>,
}

impl Inner {
    fn current_version(&self, encoded: &str) -> Option<u64> {
        self.entries.get(encoded).map(|entry| entry.version)
    }

    fn put(&mut self, encoded: String, key: KvKey, value: String, version: u64) {
        self.entries.insert(
            encoded,
            StoredEntry {
                key,
                value,
                version,
            },
        );
    }

    /// A delivery did not succeed: schedule a retry or dead-letter it.
    fn fail(&mut self, id: u64, now_ms: u64, policy: &QueuePolicy) -> Result<NackOutcome, StoreError> {
        let Some(message) = self.messages.get_mut(&id) else {
            return Ok(NackOutcome::StaleLease);
        };
        message.lease = None;

        if message.attempts < policy.max_attempts {
            let at_ms = now_ms.saturating_add(policy.backoff_ms(message.attempts));
            self.ready.insert((at_ms, id));
            return Ok(NackOutcome::Redelivering { at_ms });
        }

        let Some(message) = self.messages.remove(&id) else {
            return Ok(NackOutcome::StaleLease);
        };
        if !message.keys_if_undelivered.is_empty() {
            self.version += 1;
            let version = self.version;
            for key in message.keys_if_undelivered {
                let encoded = key.encode()?;
                self.put(encoded, key, message.payload.clone(), version);
            }
        }
        Ok(NackOutcome::DeadLettered)
    }

    fn reclaim_expired(&mut self, now_ms: u64, policy: &QueuePolicy) -> Result<(), StoreError> {
        let expired: Vec<u64> = self
            .messages
            .iter()
            .filter_map(|(id, message)| match message.lease {
                Some((_, deadline)) if deadline <= now_ms => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            log::warn!("Queue message {id} lease expired, reclaiming");
            self.fail(id, now_ms, policy)?;
        }
        Ok(())
    }

    fn holds_lease(&self, delivery: &QueueDelivery) -> bool {
        self.messages
            .get(&delivery.id)
            .and_then(|message| message.lease)
            .is_some_and(|(token, _)| token == delivery.lease_token)
    }
}

/// In-process [`KvStore`] with the same semantics as the KeyDB store.
///
/// Clones share the same data, so several "instances" in a test can race
/// against one store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, policy: QueuePolicy) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            policy,
        }
    }

    /// Number of messages in the queue, leased or not.
    pub async fn queued_messages(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// Delivery times of messages waiting in the queue, earliest first.
    pub async fn pending_delivery_times(&self) -> Vec<u64> {
        self.inner.lock().await.ready.iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &KvKey, _consistency: Consistency) -> Result<Option<KvEntry>, StoreError> {
        let encoded = key.encode()?;
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&encoded).map(|entry| KvEntry {
            key: entry.key.clone(),
            value: entry.value.clone(),
            versionstamp: Versionstamp(entry.version),
        }))
    }

    async fn list(&self, prefix: &KvKey, _consistency: Consistency) -> Result<Vec<KvEntry>, StoreError> {
        let start = format!("{}:", prefix.encode()?);
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(start.clone()..)
            .take_while(|(encoded, _)| encoded.starts_with(&start))
            .map(|(_, entry)| KvEntry {
                key: entry.key.clone(),
                value: entry.value.clone(),
                versionstamp: Versionstamp(entry.version),
            })
            .collect())
    }

    async fn commit(&self, operation: AtomicOperation) -> Result<CommitResult, StoreError> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        for check in &operation.checks {
            let current = inner.current_version(&check.key.encode()?);
            if current != check.versionstamp.map(|v| v.0) {
                return Ok(CommitResult::CheckFailed);
            }
        }

        // Encode everything up front so a bad key cannot leave a half-applied batch.
        let mut mutations = Vec::with_capacity(operation.mutations.len());
        for mutation in operation.mutations {
            let encoded = match &mutation {
                Mutation::Set { key, .. } | Mutation::Delete { key } => key.encode()?,
            };
            mutations.push((encoded, mutation));
        }
        for enqueue in &operation.enqueues {
            for key in &enqueue.keys_if_undelivered {
                key.encode()?;
            }
        }

        inner.version += 1;
        let version = inner.version;

        for (encoded, mutation) in mutations {
            match mutation {
                Mutation::Set { key, value } => inner.put(encoded, key, value, version),
                Mutation::Delete { .. } => {
                    inner.entries.remove(&encoded);
                }
            }
        }

        for enqueue in operation.enqueues {
            inner.message_seq += 1;
            let id = inner.message_seq;
            let ready_at = now_ms.saturating_add(duration_ms(enqueue.delay));
            inner.messages.insert(
                id,
                StoredMessage {
                    payload: enqueue.payload,
                    keys_if_undelivered: enqueue.keys_if_undelivered,
                    attempts: 0,
                    lease: None,
                },
            );
            inner.ready.insert((ready_at, id));
        }

        Ok(CommitResult::Committed(Versionstamp(version)))
    }

    async fn dequeue(&self) -> Result<Option<QueueDelivery>, StoreError> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(now_ms, &self.policy)?;

        let due = match inner.ready.iter().next() {
            Some(&(ready_at, id)) if ready_at <= now_ms => (ready_at, id),
            _ => return Ok(None),
        };
        inner.ready.remove(&due);
        let id = due.1;

        inner.lease_seq += 1;
        let token = inner.lease_seq;
        let deadline = now_ms.saturating_add(duration_ms(self.policy.lease));
        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        message.attempts += 1;
        message.lease = Some((token, deadline));

        Ok(Some(QueueDelivery {
            id,
            payload: message.payload.clone(),
            attempt: message.attempts,
            lease_token: token,
        }))
    }

    async fn ack(&self, delivery: &QueueDelivery) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.holds_lease(delivery) {
            return Ok(false);
        }
        inner.messages.remove(&delivery.id);
        Ok(true)
    }

    async fn nack(&self, delivery: &QueueDelivery) -> Result<NackOutcome, StoreError> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        if !inner.holds_lease(delivery) {
            return Ok(NackOutcome::StaleLease);
        }
        inner.fail(delivery.id, now_ms, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{get_json, set_json};

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = QueuePolicy {
            max_attempts: 3,
            lease: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
        };
        (MemoryStore::new(clock.clone(), policy), clock)
    }

    fn marker() -> KvKey {
        KvKey::pair("topic", "deliveryFailed")
    }

    async fn enqueue(store: &MemoryStore, delay: Duration) {
        let op = AtomicOperation::new()
            .enqueue_json("topic", delay, vec![marker()])
            .unwrap();
        assert!(store.commit(op).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn set_then_get_returns_increasing_versionstamps() {
        let (store, _) = store_with_clock();
        let key = KvKey::pair("a", "b");
        let v1 = set_json(&store, &key, &1u32).await.unwrap();
        let v2 = set_json(&store, &key, &2u32).await.unwrap();
        assert!(v2 > v1);

        let (value, version) = get_json::<u32>(&store, &key, Consistency::Strong)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(version, v2);
    }

    #[tokio::test]
    async fn list_returns_only_children_in_key_order() {
        let (store, _) = store_with_clock();
        for ts in [30u64, 4, 200] {
            set_json(&store, &KvKey::pair("dbPerfRun", ts), &ts).await.unwrap();
        }
        set_json(&store, &KvKey::prefix("dbPerfRun"), &0u64).await.unwrap();
        set_json(&store, &KvKey::pair("dbPerfRunX", 1u64), &1u64).await.unwrap();

        let entries = store
            .list(&KvKey::prefix("dbPerfRun"), Consistency::Eventual)
            .await
            .unwrap();
        let stamps: Vec<u64> = entries.iter().filter_map(|e| e.key.last_int()).collect();
        assert_eq!(stamps, vec![4, 30, 200]);
    }

    #[tokio::test]
    async fn failed_check_applies_nothing() {
        let (store, _) = store_with_clock();
        let guarded = KvKey::pair("lock", "x");
        let other = KvKey::pair("other", "y");
        set_json(&store, &guarded, &true).await.unwrap();

        let op = AtomicOperation::new()
            .check(guarded.clone(), None)
            .set(other.clone(), "1".to_string())
            .enqueue_json("topic", Duration::ZERO, vec![])
            .unwrap();
        assert_eq!(store.commit(op).await.unwrap(), CommitResult::CheckFailed);
        assert!(store.get(&other, Consistency::Strong).await.unwrap().is_none());
        assert_eq!(store.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn delayed_messages_are_not_delivered_early() {
        let (store, clock) = store_with_clock();
        enqueue(&store, Duration::from_secs(5)).await;

        assert!(store.dequeue().await.unwrap().is_none());
        clock.advance(Duration::from_secs(5));
        let delivery = store.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.decode::<String>().unwrap(), "topic");
        assert!(store.ack(&delivery).await.unwrap());
        assert_eq!(store.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_after_backoff() {
        let (store, clock) = store_with_clock();
        enqueue(&store, Duration::ZERO).await;

        let first = store.dequeue().await.unwrap().unwrap();
        let outcome = store.nack(&first).await.unwrap();
        assert_eq!(outcome, NackOutcome::Redelivering { at_ms: 1_100 });
        assert!(store.dequeue().await.unwrap().is_none());

        clock.advance(Duration::from_millis(100));
        let second = store.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_message_writes_failure_marker() {
        let (store, clock) = store_with_clock();
        enqueue(&store, Duration::ZERO).await;

        for attempt in 1..=3 {
            let delivery = store.dequeue().await.unwrap().unwrap();
            assert_eq!(delivery.attempt, attempt);
            let outcome = store.nack(&delivery).await.unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, NackOutcome::Redelivering { .. }));
            } else {
                assert_eq!(outcome, NackOutcome::DeadLettered);
            }
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(store.queued_messages().await, 0);
        let (topic, _) = get_json::<String>(&store, &marker(), Consistency::Strong)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "topic");
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_lease_cannot_ack() {
        let (store, clock) = store_with_clock();
        enqueue(&store, Duration::ZERO).await;

        let lost = store.dequeue().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(10));
        // Reclaimed on this dequeue, then due again after the backoff.
        assert!(store.dequeue().await.unwrap().is_none());
        clock.advance(Duration::from_millis(100));
        let again = store.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, lost.id);
        assert_ne!(again.lease_token, lost.lease_token);

        assert!(!store.ack(&lost).await.unwrap());
        assert_eq!(store.nack(&lost).await.unwrap(), NackOutcome::StaleLease);
        assert!(store.ack(&again).await.unwrap());
    }
}
