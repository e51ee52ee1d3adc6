use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::txn::{ttl_millis, Commit, Guard, Transaction, Versioned, Write};
use crate::Store;

/// Abort connecting when the server has not answered within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Applies a whole [`Transaction`] server-side.
///
/// KEYS: guard keys in order, then write keys in order.
/// ARGV: guard count, write count, then `kind arg` per guard and
/// `kind x y` per write. Returns 1 when applied, 0 on a failed guard.
const COMMIT_SCRIPT: &str = r#"
local guards = tonumber(ARGV[1])
local writes = tonumber(ARGV[2])
local a = 3
for i = 1, guards do
  local kind, arg = ARGV[a], ARGV[a + 1]
  a = a + 2
  local key = KEYS[i]
  if kind == 'absent' then
    if redis.call('EXISTS', key) == 1 then return 0 end
  elseif kind == 'present' then
    if redis.call('EXISTS', key) == 0 then return 0 end
  elseif kind == 'eq' then
    if redis.call('GET', key) ~= arg then return 0 end
  elseif kind == 'ver' then
    if redis.call('HGET', key, 'v') ~= arg then return 0 end
  end
end
for i = 1, writes do
  local kind, x, y = ARGV[a], ARGV[a + 1], ARGV[a + 2]
  a = a + 3
  local key = KEYS[guards + i]
  if kind == 'put' then
    redis.call('HINCRBY', key, 'v', 1)
    redis.call('HSET', key, 'd', x)
  elseif kind == 'del' then
    redis.call('DEL', key)
  elseif kind == 'setpx' then
    redis.call('SET', key, x, 'PX', y)
  elseif kind == 'pexpire' then
    redis.call('PEXPIRE', key, x)
  elseif kind == 'zadd' then
    redis.call('ZADD', key, x, y)
  elseif kind == 'zrem' then
    redis.call('ZREM', key, x)
  end
end
return 1
"#;

/// Redis-backed store. Versioned documents are hashes `{v, d}`; TTL values
/// are plain strings written with `PX`; due times live in sorted sets scored
/// by epoch milliseconds.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    commit_script: redis::Script,
}

impl RedisStore {
    /// Connect and verify the server answers. Failure here is startup-fatal
    /// for the service.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "connect timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })??;

        let store = Self {
            conn,
            commit_script: redis::Script::new(COMMIT_SCRIPT),
        };
        store.ping().await?;
        info!("connected to redis store");
        Ok(store)
    }
}

fn guard_args(guard: &Guard) -> (&'static str, String) {
    match guard {
        Guard::Absent(_) => ("absent", String::new()),
        Guard::Present(_) => ("present", String::new()),
        Guard::Equals { value, .. } => ("eq", value.clone()),
        Guard::Version { expected: Some(v), .. } => ("ver", v.to_string()),
        Guard::Version { expected: None, .. } => ("absent", String::new()),
    }
}

fn write_args(write: &Write) -> (&'static str, String, String) {
    match write {
        Write::Put { value, .. } => ("put", value.clone(), String::new()),
        Write::Delete { .. } => ("del", String::new(), String::new()),
        Write::SetWithTtl { value, ttl, .. } => ("setpx", value.clone(), ttl_millis(*ttl).to_string()),
        Write::ExtendTtl { ttl, .. } => ("pexpire", ttl_millis(*ttl).to_string(), String::new()),
        Write::ZAdd { member, score, .. } => ("zadd", score.to_string(), member.clone()),
        Write::ZRem { member, .. } => ("zrem", member.clone(), String::new()),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (version, value): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await?;
        match (version, value) {
            (Some(version), Some(value)) => Ok(Some(Versioned { version, value })),
            (None, None) => Ok(None),
            _ => Err(StoreError::Malformed {
                key: key.to_string(),
                reason: "versioned document missing a field".to_string(),
            }),
        }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn due_before(&self, set: &str, until: i64, offset: usize, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // Equal scores come back in lexical member order.
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg("-inf")
            .arg(until)
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query_async(&mut conn)
            .await?)
    }

    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score.map(|s| s as i64))
    }

    async fn commit(&self, txn: Transaction) -> Result<Commit> {
        let mut invocation = self.commit_script.prepare_invoke();
        for guard in &txn.guards {
            invocation.key(guard.key());
        }
        for write in &txn.writes {
            invocation.key(write.key());
        }
        invocation.arg(txn.guards.len()).arg(txn.writes.len());
        for guard in &txn.guards {
            let (kind, arg) = guard_args(guard);
            invocation.arg(kind).arg(arg);
        }
        for write in &txn.writes {
            let (kind, x, y) = write_args(write);
            invocation.arg(kind).arg(x).arg(y);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(if applied == 1 {
            Commit::Applied
        } else {
            Commit::Conflict
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_version_guard_means_absent() {
        let guard = Guard::Version { key: "k".into(), expected: None };
        assert_eq!(guard_args(&guard), ("absent", String::new()));

        let guard = Guard::Version { key: "k".into(), expected: Some(7) };
        assert_eq!(guard_args(&guard), ("ver", "7".to_string()));
    }

    #[test]
    fn ttl_is_sent_in_milliseconds() {
        let write = Write::SetWithTtl {
            key: "lease".into(),
            value: "owner".into(),
            ttl: Duration::from_secs(30),
        };
        assert_eq!(write_args(&write), ("setpx", "owner".to_string(), "30000".to_string()));
    }

    #[test]
    fn zadd_passes_score_before_member() {
        let write = Write::ZAdd { set: "due".into(), member: "job".into(), score: 1_700 };
        assert_eq!(write_args(&write), ("zadd", "1700".to_string(), "job".to_string()));
    }
}
