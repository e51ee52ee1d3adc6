//! `scheduler-store` — thin adapter over the shared Redis-compatible store.
//!
//! # Overview
//!
//! Every mutation goes through [`Store::commit`]: a [`Transaction`] of guards
//! and writes that the backend applies in a single atomic step (a Lua script
//! on Redis, one mutex section in memory). Compare-and-swap, TTL writes and
//! TTL extension are thin wrappers over it.
//!
//! | Backend       | Use                                                 |
//! |---------------|-----------------------------------------------------|
//! | `RedisStore`  | Production; one round-trip per operation           |
//! | `MemoryStore` | Tests and local runs; TTLs follow an injected clock |
//!
//! Any failure to reach the store is reported as
//! [`StoreError::Unavailable`], never as an empty result.

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod txn;

use std::time::Duration;

use async_trait::async_trait;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use txn::{Commit, Guard, TtlExtension, Transaction, Versioned, Write};

#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trip check used at startup.
    async fn ping(&self) -> Result<()>;

    /// Read a versioned document written by [`Write::Put`].
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Read a plain value written by [`Write::SetWithTtl`]; expired keys read as `None`.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Members of `set` with score ≤ `until`, ascending by score, ties by
    /// member in lexical order. Skips the first `offset`, returns at most `limit`.
    async fn due_before(&self, set: &str, until: i64, offset: usize, limit: usize) -> Result<Vec<String>>;

    /// Score of `member` in `set`, if present.
    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>>;

    /// Apply `txn` atomically: all guards are checked, then all writes land,
    /// or nothing does.
    async fn commit(&self, txn: Transaction) -> Result<Commit>;

    /// Replace the document at `key` only if its version is still `expected`
    /// (`None` = create only if absent).
    async fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: String) -> Result<Commit> {
        let txn = Transaction::new()
            .guard(Guard::Version {
                key: key.to_string(),
                expected,
            })
            .write(Write::Put {
                key: key.to_string(),
                value,
            });
        self.commit(txn).await
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let txn = Transaction::new().write(Write::SetWithTtl {
            key: key.to_string(),
            value,
            ttl,
        });
        self.commit(txn).await.map(|_| ())
    }

    /// Push the expiry of a live key out to `ttl` from now.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<TtlExtension> {
        let txn = Transaction::new()
            .guard(Guard::Present(key.to_string()))
            .write(Write::ExtendTtl {
                key: key.to_string(),
                ttl,
            });
        Ok(match self.commit(txn).await? {
            Commit::Applied => TtlExtension::Extended,
            Commit::Conflict => TtlExtension::Expired,
        })
    }
}
