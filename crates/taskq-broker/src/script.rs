//! Lua scripts run server-side so multi-step broker operations are atomic.

use redis::aio::ConnectionManager;
use redis::Script;

/// Errors surfaced by [`crate::Broker`].
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] redis::RedisError),
    #[error("broker command failed: {0}")]
    Command(#[source] redis::RedisError),
    #[error("broker script failed: {0}")]
    Script(#[source] redis::RedisError),
}

/// Pops the lowest-scoring member of the pending ZSET and, in the same Lua
/// invocation, writes an inflight marker for it. A worker racing another
/// worker's `claim_next` call can never observe a task as both popped and
/// unmarked -- Redis executes the whole script as one atomic step.
const CLAIM_SCRIPT_BODY: &str = r#"
local pending_key = KEYS[1]
local inflight_key = KEYS[2]
local worker_id = ARGV[1]
local claim_deadline = ARGV[2]

local popped = redis.call('ZPOPMIN', pending_key)
if #popped == 0 then
    return false
end

local task_id = popped[1]
local marker = cjson.encode({worker_id = worker_id, claim_deadline = tonumber(claim_deadline)})
redis.call('HSET', inflight_key, task_id, marker)

return task_id
"#;

pub(crate) struct ClaimScript(Script);

impl ClaimScript {
    pub(crate) fn new() -> Self {
        Self(Script::new(CLAIM_SCRIPT_BODY))
    }

    pub(crate) async fn invoke(
        &self,
        conn: &mut ConnectionManager,
        pending_key: &str,
        inflight_key: &str,
        worker_id: &str,
        claim_deadline: i64,
    ) -> Result<Option<String>, BrokerError> {
        let result: redis::Value = self
            .0
            .key(pending_key)
            .key(inflight_key)
            .arg(worker_id)
            .arg(claim_deadline)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Script)?;

        match result {
            redis::Value::BulkString(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            redis::Value::Nil | redis::Value::Okay => Ok(None),
            other => Err(BrokerError::Script(redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "unexpected claim script return value",
                format!("{other:?}"),
            )))),
        }
    }
}
