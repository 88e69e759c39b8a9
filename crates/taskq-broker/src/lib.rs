//! In-memory broker backing the queue engine's priority pending list,
//! delayed set, and inflight claim markers.
//!
//! Backed by Redis. Each queue gets its own namespaced set of keys so many
//! queues can share one Redis instance:
//!
//! - `taskq:{queue}:pending`  -- ZSET, member = task id, score orders by
//!   priority then FIFO sequence.
//! - `taskq:{queue}:seq`      -- plain counter, supplies the FIFO tie-break.
//! - `taskq:{queue}:delayed`  -- ZSET, member = task id, score = ready_at
//!   (epoch seconds).
//! - `taskq:{queue}:inflight` -- HASH, field = task id, value = JSON
//!   `{worker_id, claim_deadline}`.
//!
//! `claim_next` pops the lowest-scoring member of `pending` and writes the
//! inflight marker in one Lua script invocation so the pop and the marker
//! write are atomic -- no other worker can observe the task as claimable
//! between the two steps.

mod script;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

pub use script::BrokerError;

/// Config for connecting to the broker's backing Redis instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
}

impl BrokerConfig {
    pub const DEFAULT_URL: &str = "redis://localhost:6379";

    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("TASKQ_REDIS_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { redis_url }
    }

    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Marker stored in the `inflight` hash for a claimed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InflightMarker {
    worker_id: String,
    claim_deadline: i64,
}

/// A claimed task handed back to the caller by [`Broker::claim_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub task_id: String,
}

/// Async client for one Redis-backed broker instance, shared across
/// queues -- queue names are folded into the Redis key, not the connection.
#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
    claim_script: script::ClaimScript,
}

impl Broker {
    /// Connect to Redis and prepare the broker's Lua scripts.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(BrokerError::Connect)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(BrokerError::Connect)?;
        Ok(Self {
            conn,
            claim_script: script::ClaimScript::new(),
        })
    }

    fn pending_key(queue: &str) -> String {
        format!("taskq:{queue}:pending")
    }

    fn seq_key(queue: &str) -> String {
        format!("taskq:{queue}:seq")
    }

    fn delayed_key(queue: &str) -> String {
        format!("taskq:{queue}:delayed")
    }

    fn inflight_key(queue: &str) -> String {
        format!("taskq:{queue}:inflight")
    }

    /// Score used to order the pending ZSET: lower priority ordinal sorts
    /// first (it is a higher-urgency band), ties broken by FIFO sequence.
    fn score(priority_ordinal: i16, sequence: i64) -> f64 {
        (priority_ordinal as f64) * 1e12 + (sequence as f64)
    }

    /// Push a task reference onto the immediate pending list.
    pub async fn push_pending(
        &self,
        queue: &str,
        task_id: &str,
        priority_ordinal: i16,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let sequence: i64 = conn
            .incr(Self::seq_key(queue), 1)
            .await
            .map_err(BrokerError::Command)?;
        let score = Self::score(priority_ordinal, sequence);
        conn.zadd::<_, _, _, ()>(Self::pending_key(queue), task_id, score)
            .await
            .map_err(BrokerError::Command)?;
        Ok(())
    }

    /// Push a task reference onto the delayed set, ordered by `ready_at`.
    pub async fn push_delayed(
        &self,
        queue: &str,
        task_id: &str,
        ready_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), task_id, ready_at.timestamp())
            .await
            .map_err(BrokerError::Command)?;
        Ok(())
    }

    /// Atomically pop the highest-priority pending task (if any) and record
    /// an inflight claim marker for it with the given deadline.
    pub async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        claim_deadline: DateTime<Utc>,
    ) -> Result<Option<Claim>, BrokerError> {
        let mut conn = self.conn.clone();
        let task_id: Option<String> = self
            .claim_script
            .invoke(
                &mut conn,
                &Self::pending_key(queue),
                &Self::inflight_key(queue),
                worker_id,
                claim_deadline.timestamp(),
            )
            .await?;

        Ok(task_id.map(|task_id| Claim { task_id }))
    }

    /// Remove a task's inflight marker once the worker has reported a
    /// terminal outcome (success or failure) to the durable store.
    pub async fn ack(&self, queue: &str, task_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(Self::inflight_key(queue), task_id)
            .await
            .map_err(BrokerError::Command)?;
        Ok(())
    }

    /// Pop every delayed task whose `ready_at` has passed and move it onto
    /// the pending list. Returns the promoted task ids.
    pub async fn promote_delayed(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        priority_ordinal_of: impl Fn(&str) -> i16,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(Self::delayed_key(queue), f64::MIN, now.timestamp() as f64)
            .await
            .map_err(BrokerError::Command)?;

        for task_id in &due {
            conn.zrem::<_, _, ()>(Self::delayed_key(queue), task_id)
                .await
                .map_err(BrokerError::Command)?;
            self.push_pending(queue, task_id, priority_ordinal_of(task_id))
                .await?;
        }

        Ok(due)
    }

    /// List inflight task ids whose claim deadline has passed -- their
    /// worker is presumed dead or hung.
    pub async fn list_expired_inflight(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, String)> = conn
            .hgetall(Self::inflight_key(queue))
            .await
            .map_err(BrokerError::Command)?;

        let mut expired = Vec::new();
        for (task_id, raw) in entries {
            let marker: InflightMarker = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if marker.claim_deadline <= now.timestamp() {
                expired.push(task_id);
            }
        }
        Ok(expired)
    }

    /// Number of tasks currently sitting in the pending list.
    pub async fn pending_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn
            .zcard(Self::pending_key(queue))
            .await
            .map_err(BrokerError::Command)?;
        Ok(depth)
    }
}
