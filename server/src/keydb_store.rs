/// KeyDB-backed implementation of [`KvStore`].
///
/// Key schema:
/// - `kv:e:{encoded key}`    hash with `key` (JSON tuple), `value` (JSON), `version`
/// - `kv:idx:{first part}`   sorted set of encoded keys, all at score 0, for lex listing
/// - `kv:meta:version`       versionstamp counter
/// - `queue:seq`             message id counter
/// - `queue:lease_seq`       lease token counter
/// - `queue:ready`           sorted set of message ids by ready time (ms)
/// - `queue:leased`          sorted set of message ids by lease deadline (ms)
/// - `queue:msg:{id}`        hash with `payload`, `undelivered`, `attempts`, `lease`
///
/// Every write path runs as a single Lua script, so checks, mutations and
/// enqueues land together or not at all.
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::pipe;
use serde::Serialize;

use crate::clock::{duration_ms, Clock};
use crate::keydb::connect_with_retry;
use crate::kv::{
    AtomicOperation, CommitResult, Consistency, KvEntry, KvKey, KvStore, Mutation, NackOutcome,
    QueueDelivery, QueuePolicy, StoreError, Versionstamp,
};

/// Number of keys to batch in a single Redis pipeline round-trip.
const PIPELINE_BATCH_SIZE: usize = 4096;

const ENTRY_PREFIX: &str = "kv:e:";
const INDEX_PREFIX: &str = "kv:idx:";

/// Shared by the dequeue and nack scripts: gives up a lease and either
/// schedules a retry or dead-letters the message. Returns the retry time,
/// `-2` when dead-lettered, `-1` when the message is gone.
macro_rules! fail_fn {
    () => {
        r#"
local function fail(id, now, max_attempts, backoff)
  local mkey = 'queue:msg:' .. id
  redis.call('ZREM', 'queue:leased', id)
  if redis.call('EXISTS', mkey) == 0 then return -1 end
  redis.call('HSET', mkey, 'lease', 0)
  local attempts = tonumber(redis.call('HGET', mkey, 'attempts') or '0')
  if attempts < max_attempts then
    local at = now + backoff * (2 ^ math.min(math.max(attempts - 1, 0), 20))
    redis.call('ZADD', 'queue:ready', at, id)
    return at
  end
  local fields = redis.call('HMGET', mkey, 'payload', 'undelivered')
  local targets = cjson.decode(fields[2])
  if #targets > 0 then
    local version = redis.call('INCR', 'kv:meta:version')
    for _, t in ipairs(targets) do
      redis.call('HSET', 'kv:e:' .. t.k, 'key', t.key, 'value', fields[1], 'version', version)
      redis.call('ZADD', 'kv:idx:' .. t.idx, 0, t.k)
    end
  end
  redis.call('DEL', mkey)
  return -2
end
"#
    };
}

const COMMIT_SCRIPT: &str = r#"
local op = cjson.decode(ARGV[1])
local now = tonumber(ARGV[2])
for _, c in ipairs(op.checks) do
  local v = redis.call('HGET', 'kv:e:' .. c.k, 'version')
  local current = 0
  if v then current = tonumber(v) end
  if current ~= c.v then return 0 end
end
local version = redis.call('INCR', 'kv:meta:version')
for _, m in ipairs(op.mutations) do
  local hkey = 'kv:e:' .. m.k
  if m.op == 'set' then
    redis.call('HSET', hkey, 'key', m.key, 'value', m.value, 'version', version)
    redis.call('ZADD', 'kv:idx:' .. m.idx, 0, m.k)
  else
    redis.call('DEL', hkey)
    redis.call('ZREM', 'kv:idx:' .. m.idx, m.k)
  end
end
for _, e in ipairs(op.enqueues) do
  local id = redis.call('INCR', 'queue:seq')
  redis.call('HSET', 'queue:msg:' .. id, 'payload', e.payload, 'undelivered', e.undelivered,
    'attempts', 0, 'lease', 0)
  redis.call('ZADD', 'queue:ready', now + e.delay, id)
end
return version
"#;

const DEQUEUE_SCRIPT: &str = concat!(
    fail_fn!(),
    r#"
local now = tonumber(ARGV[1])
local lease_ms = tonumber(ARGV[2])
local max_attempts = tonumber(ARGV[3])
local backoff = tonumber(ARGV[4])
local expired = redis.call('ZRANGEBYSCORE', 'queue:leased', '-inf', now)
for _, id in ipairs(expired) do fail(id, now, max_attempts, backoff) end
local due = redis.call('ZRANGEBYSCORE', 'queue:ready', '-inf', now, 'LIMIT', 0, 1)
if #due == 0 then return false end
local id = due[1]
redis.call('ZREM', 'queue:ready', id)
local mkey = 'queue:msg:' .. id
if redis.call('EXISTS', mkey) == 0 then return false end
local token = redis.call('INCR', 'queue:lease_seq')
local attempts = redis.call('HINCRBY', mkey, 'attempts', 1)
redis.call('HSET', mkey, 'lease', token)
redis.call('ZADD', 'queue:leased', now + lease_ms, id)
local payload = redis.call('HGET', mkey, 'payload')
return {id, payload, attempts, token}
"#
);

const ACK_SCRIPT: &str = r#"
local mkey = 'queue:msg:' .. ARGV[1]
local lease = redis.call('HGET', mkey, 'lease')
if not lease or lease ~= ARGV[2] then return 0 end
redis.call('ZREM', 'queue:leased', ARGV[1])
redis.call('DEL', mkey)
return 1
"#;

const NACK_SCRIPT: &str = concat!(
    fail_fn!(),
    r#"
local lease = redis.call('HGET', 'queue:msg:' .. ARGV[1], 'lease')
if not lease or lease ~= ARGV[2] then return -1 end
return fail(ARGV[1], tonumber(ARGV[3]), tonumber(ARGV[4]), tonumber(ARGV[5]))
"#
);

#[derive(Serialize)]
struct ScriptCheck {
    k: String,
    /// `0` means the key must be absent.
    v: u64,
}

#[derive(Serialize)]
struct ScriptMutation {
    op: &'static str,
    k: String,
    idx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Serialize)]
struct ScriptTarget {
    k: String,
    key: String,
    idx: String,
}

#[derive(Serialize)]
struct ScriptEnqueue {
    payload: String,
    delay: u64,
    undelivered: String,
}

#[derive(Serialize)]
struct ScriptOperation {
    checks: Vec<ScriptCheck>,
    mutations: Vec<ScriptMutation>,
    enqueues: Vec<ScriptEnqueue>,
}

impl ScriptOperation {
    fn build(operation: AtomicOperation) -> Result<Self, StoreError> {
        let mut checks = Vec::with_capacity(operation.checks.len());
        for check in operation.checks {
            checks.push(ScriptCheck {
                k: check.key.encode()?,
                v: check.versionstamp.map_or(0, |v| v.0),
            });
        }

        let mut mutations = Vec::with_capacity(operation.mutations.len());
        for mutation in operation.mutations {
            mutations.push(match mutation {
                Mutation::Set { key, value } => ScriptMutation {
                    op: "set",
                    k: key.encode()?,
                    idx: key.index_segment()?,
                    key: Some(serde_json::to_string(&key)?),
                    value: Some(value),
                },
                Mutation::Delete { key } => ScriptMutation {
                    op: "delete",
                    k: key.encode()?,
                    idx: key.index_segment()?,
                    key: None,
                    value: None,
                },
            });
        }

        let mut enqueues = Vec::with_capacity(operation.enqueues.len());
        for enqueue in operation.enqueues {
            let mut targets = Vec::with_capacity(enqueue.keys_if_undelivered.len());
            for key in &enqueue.keys_if_undelivered {
                targets.push(ScriptTarget {
                    k: key.encode()?,
                    key: serde_json::to_string(key)?,
                    idx: key.index_segment()?,
                });
            }
            enqueues.push(ScriptEnqueue {
                payload: enqueue.payload,
                delay: duration_ms(enqueue.delay),
                undelivered: serde_json::to_string(&targets)?,
            });
        }

        Ok(ScriptOperation {
            checks,
            mutations,
            enqueues,
        })
    }
}

type EntryFields = (Option<String>, Option<String>, Option<u64>);

fn entry_from_fields(encoded: &str, fields: EntryFields) -> Result<Option<KvEntry>, StoreError> {
    let (Some(key), Some(value), Some(version)) = fields else {
        return Ok(None);
    };
    let key: KvKey = serde_json::from_str(&key).map_err(|err| StoreError::Corrupt {
        key: encoded.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Some(KvEntry {
        key,
        value,
        versionstamp: Versionstamp(version),
    }))
}

#[derive(Clone)]
pub struct KeyDbStore {
    primary: MultiplexedConnection,
    replica: Option<MultiplexedConnection>,
    policy: QueuePolicy,
    clock: Arc<dyn Clock>,
}

impl KeyDbStore {
    pub fn new(
        primary: MultiplexedConnection,
        replica: Option<MultiplexedConnection>,
        policy: QueuePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        KeyDbStore {
            primary,
            replica,
            policy,
            clock,
        }
    }

    /// Connects to the primary and, when configured, to a read replica used
    /// for eventually consistent reads.
    pub async fn connect(
        url: &str,
        replica_url: Option<&str>,
        policy: QueuePolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let primary = connect_with_retry(url).await?;
        let replica = match replica_url {
            Some(replica_url) => Some(connect_with_retry(replica_url).await?),
            None => None,
        };
        Ok(Self::new(primary, replica, policy, clock))
    }

    fn reader(&self, consistency: Consistency) -> MultiplexedConnection {
        match (consistency, &self.replica) {
            (Consistency::Eventual, Some(replica)) => replica.clone(),
            _ => self.primary.clone(),
        }
    }
}

#[async_trait]
impl KvStore for KeyDbStore {
    async fn get(&self, key: &KvKey, consistency: Consistency) -> Result<Option<KvEntry>, StoreError> {
        let encoded = key.encode()?;
        let mut con = self.reader(consistency);
        let fields: EntryFields = redis::cmd("HMGET")
            .arg(format!("{ENTRY_PREFIX}{encoded}"))
            .arg("key")
            .arg("value")
            .arg("version")
            .query_async(&mut con)
            .await?;
        entry_from_fields(&encoded, fields)
    }

    async fn list(&self, prefix: &KvKey, consistency: Consistency) -> Result<Vec<KvEntry>, StoreError> {
        let encoded_prefix = prefix.encode()?;
        let mut con = self.reader(consistency);
        // ';' sorts right after ':', so this range holds exactly the children.
        let members: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(format!("{INDEX_PREFIX}{}", prefix.index_segment()?))
            .arg(format!("[{encoded_prefix}:"))
            .arg(format!("({encoded_prefix};"))
            .query_async(&mut con)
            .await?;

        let mut entries = Vec::with_capacity(members.len());
        for batch in members.chunks(PIPELINE_BATCH_SIZE) {
            let mut pipeline = pipe();
            for encoded in batch {
                pipeline
                    .cmd("HMGET")
                    .arg(format!("{ENTRY_PREFIX}{encoded}"))
                    .arg("key")
                    .arg("value")
                    .arg("version");
            }
            let rows: Vec<EntryFields> = pipeline.query_async(&mut con).await?;
            for (encoded, fields) in batch.iter().zip(rows) {
                // Deleted between the index scan and the fetch.
                if let Some(entry) = entry_from_fields(encoded, fields)? {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn commit(&self, operation: AtomicOperation) -> Result<CommitResult, StoreError> {
        let script_op = serde_json::to_string(&ScriptOperation::build(operation)?)?;
        let mut con = self.primary.clone();
        let version: u64 = redis::cmd("EVAL")
            .arg(COMMIT_SCRIPT)
            .arg(0)
            .arg(script_op)
            .arg(self.clock.now_ms())
            .query_async(&mut con)
            .await?;
        if version == 0 {
            Ok(CommitResult::CheckFailed)
        } else {
            Ok(CommitResult::Committed(Versionstamp(version)))
        }
    }

    async fn dequeue(&self) -> Result<Option<QueueDelivery>, StoreError> {
        let mut con = self.primary.clone();
        let delivery: Option<(u64, String, u32, u64)> = redis::cmd("EVAL")
            .arg(DEQUEUE_SCRIPT)
            .arg(0)
            .arg(self.clock.now_ms())
            .arg(duration_ms(self.policy.lease))
            .arg(self.policy.max_attempts)
            .arg(duration_ms(self.policy.retry_backoff))
            .query_async(&mut con)
            .await?;
        Ok(delivery.map(|(id, payload, attempt, lease_token)| QueueDelivery {
            id,
            payload,
            attempt,
            lease_token,
        }))
    }

    async fn ack(&self, delivery: &QueueDelivery) -> Result<bool, StoreError> {
        let mut con = self.primary.clone();
        let removed: i64 = redis::cmd("EVAL")
            .arg(ACK_SCRIPT)
            .arg(0)
            .arg(delivery.id)
            .arg(delivery.lease_token)
            .query_async(&mut con)
            .await?;
        Ok(removed == 1)
    }

    async fn nack(&self, delivery: &QueueDelivery) -> Result<NackOutcome, StoreError> {
        let mut con = self.primary.clone();
        let outcome: i64 = redis::cmd("EVAL")
            .arg(NACK_SCRIPT)
            .arg(0)
            .arg(delivery.id)
            .arg(delivery.lease_token)
            .arg(self.clock.now_ms())
            .arg(self.policy.max_attempts)
            .arg(duration_ms(self.policy.retry_backoff))
            .query_async(&mut con)
            .await?;
        Ok(match outcome {
            -2 => NackOutcome::DeadLettered,
            at_ms if at_ms >= 0 => NackOutcome::Redelivering {
                at_ms: at_ms as u64,
            },
            _ => NackOutcome::StaleLease,
        })
    }
}
