//! Durable key-value store contract shared by every component.
//!
//! The model follows the store the benchmark page was built on: ordered
//! tuple keys, per-entry versionstamps, all-or-nothing atomic operations
//! guarded by version checks, and a durable delayed queue with at-least-once
//! delivery. Two implementations exist: [`crate::keydb_store::KeyDbStore`]
//! for production and [`crate::memory::MemoryStore`] for tests and dry runs.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One segment of a [`KvKey`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum KeyPart {
    Int(u64),
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        KeyPart::Int(value)
    }
}

impl KeyPart {
    /// Integers are tagged with `#`, which strings always escape, so the two
    /// kinds never share an encoding. Zero padding keeps lexicographic order
    /// equal to numeric order.
    fn encode_into(&self, out: &mut String) {
        match self {
            KeyPart::Int(value) => out.push_str(&format!("#{value:020}")),
            KeyPart::Str(value) => {
                for ch in value.chars() {
                    match ch {
                        '%' => out.push_str("%25"),
                        ':' => out.push_str("%3A"),
                        '#' => out.push_str("%23"),
                        other => out.push(other),
                    }
                }
            }
        }
    }
}

/// Ordered tuple key, e.g. `["computeStats", "lock"]` or `["dbPerfRun", 1700000000000]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct KvKey(Vec<KeyPart>);

impl KvKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        KvKey(parts)
    }

    pub fn prefix(first: impl Into<KeyPart>) -> Self {
        KvKey(vec![first.into()])
    }

    pub fn pair(first: impl Into<KeyPart>, second: impl Into<KeyPart>) -> Self {
        KvKey(vec![first.into(), second.into()])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn last_str(&self) -> Option<&str> {
        match self.0.last() {
            Some(KeyPart::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn last_int(&self) -> Option<u64> {
        match self.0.last() {
            Some(KeyPart::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Flat string form used for ordering and as the storage identity.
    ///
    /// Segments are joined with `:`; a `:` inside a string segment is
    /// percent-escaped so every key sharing a prefix also shares the encoded
    /// prefix followed by `:`.
    pub fn encode(&self) -> Result<String, StoreError> {
        if self.0.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        let mut out = String::new();
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                out.push(':');
            }
            part.encode_into(&mut out);
        }
        Ok(out)
    }

    /// Encoded first segment. Entries are indexed per first segment, so every
    /// listing prefix must have one.
    pub fn index_segment(&self) -> Result<String, StoreError> {
        let first = self
            .0
            .first()
            .ok_or_else(|| StoreError::InvalidKey("empty key".to_string()))?;
        let mut out = String::new();
        first.encode_into(&mut out);
        Ok(out)
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match part {
                KeyPart::Int(value) => write!(f, "{value}")?,
                KeyPart::Str(value) => write!(f, "{value:?}")?,
            }
        }
        f.write_str("]")
    }
}

/// Monotonic version assigned to every committed write.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Versionstamp(pub u64);

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020x}", self.0)
    }
}

/// Read consistency requested by the caller.
///
/// `Eventual` reads may be served from a replica and lag behind recent
/// commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Strong,
    Eventual,
}

/// A stored value with its key and current versionstamp. Values are JSON
/// documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: KvKey,
    pub value: String,
    pub versionstamp: Versionstamp,
}

impl KvEntry {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.value)
    }
}

/// Precondition of an atomic operation: `key` must currently be at
/// `versionstamp`, or absent when `versionstamp` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub key: KvKey,
    pub versionstamp: Option<Versionstamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set { key: KvKey, value: String },
    Delete { key: KvKey },
}

/// A queue message created as part of an atomic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueue {
    pub payload: String,
    pub delay: Duration,
    /// Keys that receive the payload if the message is never delivered
    /// successfully.
    pub keys_if_undelivered: Vec<KvKey>,
}

/// All-or-nothing batch: if any check fails nothing is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicOperation {
    pub checks: Vec<Check>,
    pub mutations: Vec<Mutation>,
    pub enqueues: Vec<Enqueue>,
}

impl AtomicOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(mut self, key: KvKey, versionstamp: Option<Versionstamp>) -> Self {
        self.checks.push(Check { key, versionstamp });
        self
    }

    pub fn set(mut self, key: KvKey, value: String) -> Self {
        self.mutations.push(Mutation::Set { key, value });
        self
    }

    pub fn set_json<T: Serialize + ?Sized>(self, key: KvKey, value: &T) -> Result<Self, StoreError> {
        let encoded = serde_json::to_string(value)?;
        Ok(self.set(key, encoded))
    }

    pub fn delete(mut self, key: KvKey) -> Self {
        self.mutations.push(Mutation::Delete { key });
        self
    }

    pub fn enqueue_json<T: Serialize + ?Sized>(
        mut self,
        payload: &T,
        delay: Duration,
        keys_if_undelivered: Vec<KvKey>,
    ) -> Result<Self, StoreError> {
        self.enqueues.push(Enqueue {
            payload: serde_json::to_string(payload)?,
            delay,
            keys_if_undelivered,
        });
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed(Versionstamp),
    CheckFailed,
}

impl CommitResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommitResult::Committed(_))
    }
}

/// Redelivery policy of the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Deliveries before a message is dead-lettered into its
    /// `keys_if_undelivered`.
    pub max_attempts: u32,
    /// How long a delivered message stays invisible before it is assumed lost
    /// and handed out again.
    pub lease: Duration,
    /// Delay before the first redelivery; doubles with each further attempt.
    pub retry_backoff: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy {
            max_attempts: 5,
            lease: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl QueuePolicy {
    pub(crate) fn backoff_ms(&self, attempts: u32) -> u64 {
        let base = crate::clock::duration_ms(self.retry_backoff);
        let shift = attempts.saturating_sub(1).min(20);
        base.saturating_mul(1u64 << shift)
    }
}

/// A message handed to a consumer. It stays leased until acked or nacked,
/// or until the lease runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    pub id: u64,
    pub payload: String,
    /// 1 on first delivery.
    pub attempt: u32,
    pub lease_token: u64,
}

impl QueueDelivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back in the queue, visible again at `at_ms`.
    Redelivering { at_ms: u64 },
    /// Attempts exhausted; the payload was written to the message's
    /// `keys_if_undelivered` and the message dropped.
    DeadLettered,
    /// The lease had already expired and the message was reclaimed.
    StaleLease,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("KeyDB command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("value encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("write to {0} was rejected")]
    Rejected(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey, consistency: Consistency) -> Result<Option<KvEntry>, StoreError>;

    /// Entries strictly below `prefix`, in key order.
    async fn list(&self, prefix: &KvKey, consistency: Consistency) -> Result<Vec<KvEntry>, StoreError>;

    async fn commit(&self, operation: AtomicOperation) -> Result<CommitResult, StoreError>;

    /// Leases the oldest due message, if any. Messages whose lease ran out are
    /// treated as failed deliveries first.
    async fn dequeue(&self) -> Result<Option<QueueDelivery>, StoreError>;

    /// Removes a delivered message. Returns `false` if the lease had expired.
    async fn ack(&self, delivery: &QueueDelivery) -> Result<bool, StoreError>;

    /// Hands a delivered message back for redelivery or dead-letters it.
    async fn nack(&self, delivery: &QueueDelivery) -> Result<NackOutcome, StoreError>;

    async fn set(&self, key: &KvKey, value: String) -> Result<Versionstamp, StoreError> {
        match self.commit(AtomicOperation::new().set(key.clone(), value)).await? {
            CommitResult::Committed(versionstamp) => Ok(versionstamp),
            CommitResult::CheckFailed => Err(StoreError::Rejected(key.to_string())),
        }
    }
}

/// Reads and decodes a JSON value, returning it with its versionstamp.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &KvKey,
    consistency: Consistency,
) -> Result<Option<(T, Versionstamp)>, StoreError> {
    let Some(entry) = store.get(key, consistency).await? else {
        return Ok(None);
    };
    let value = entry.decode().map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Some((value, entry.versionstamp)))
}

pub async fn set_json<T: Serialize + ?Sized + Sync>(
    store: &dyn KvStore,
    key: &KvKey,
    value: &T,
) -> Result<Versionstamp, StoreError> {
    store.set(key, serde_json::to_string(value)?).await
}
