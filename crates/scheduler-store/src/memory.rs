//! In-memory store backend.
//!
//! Thread-safe, non-persistent. Expiry follows the injected [`Clock`] so
//! tests can step time across lease boundaries without sleeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{Clock, SystemClock};

use crate::error::{Result, StoreError};
use crate::txn::{ttl_millis, Commit, Guard, Transaction, Versioned, Write};
use crate::Store;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Versioned>,
    values: HashMap<String, (String, Option<DateTime<Utc>>)>,
    /// Ordered (score, member) pairs plus a reverse index for updates.
    sets: HashMap<String, (BTreeSet<(i64, String)>, HashMap<String, i64>)>,
}

impl Inner {
    fn live_value(&self, key: &str, now: DateTime<Utc>) -> Option<&str> {
        match self.values.get(key) {
            Some((value, expiry)) if expiry.map_or(true, |at| at > now) => Some(value),
            _ => None,
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.values.retain(|_, (_, expiry)| expiry.map_or(true, |at| at > now));
    }

    fn exists(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.docs.contains_key(key) || self.live_value(key, now).is_some() || self.sets.contains_key(key)
    }

    fn check(&self, guard: &Guard, now: DateTime<Utc>) -> bool {
        match guard {
            Guard::Absent(key) => !self.exists(key, now),
            Guard::Present(key) => self.exists(key, now),
            Guard::Equals { key, value } => self.live_value(key, now) == Some(value.as_str()),
            Guard::Version { key, expected } => {
                self.docs.get(key).map(|d| d.version) == *expected
            }
        }
    }

    fn apply(&mut self, write: Write, now: DateTime<Utc>) {
        match write {
            Write::Put { key, value } => {
                let version = self.docs.get(&key).map_or(1, |d| d.version + 1);
                self.docs.insert(key, Versioned { version, value });
            }
            Write::Delete { key } => {
                self.docs.remove(&key);
                self.values.remove(&key);
                self.sets.remove(&key);
            }
            Write::SetWithTtl { key, value, ttl } => {
                let expiry = now + Duration::milliseconds(ttl_millis(ttl) as i64);
                self.values.insert(key, (value, Some(expiry)));
            }
            Write::ExtendTtl { key, ttl } => {
                if self.live_value(&key, now).is_some() {
                    if let Some((_, expiry)) = self.values.get_mut(&key) {
                        *expiry = Some(now + Duration::milliseconds(ttl_millis(ttl) as i64));
                    }
                }
            }
            Write::ZAdd { set, member, score } => {
                let (ordered, index) = self.sets.entry(set).or_default();
                if let Some(old) = index.insert(member.clone(), score) {
                    ordered.remove(&(old, member.clone()));
                }
                ordered.insert((score, member));
            }
            Write::ZRem { set, member } => {
                if let Some((ordered, index)) = self.sets.get_mut(&set) {
                    if let Some(old) = index.remove(&member) {
                        ordered.remove(&(old, member));
                    }
                    if index.is_empty() {
                        self.sets.remove(&set);
                    }
                }
            }
        }
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while `false`, every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.lock()?.docs.get(key).cloned())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self.lock()?.live_value(key, now).map(str::to_string))
    }

    async fn due_before(&self, set: &str, until: i64, offset: usize, limit: usize) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .sets
            .get(set)
            .map(|(ordered, _)| {
                ordered
                    .iter()
                    .take_while(|(score, _)| *score <= until)
                    .skip(offset)
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>> {
        let inner = self.lock()?;
        Ok(inner.sets.get(set).and_then(|(_, index)| index.get(member).copied()))
    }

    async fn commit(&self, txn: Transaction) -> Result<Commit> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.purge_expired(now);
        if !txn.guards.iter().all(|g| inner.check(g, now)) {
            return Ok(Commit::Conflict);
        }
        for write in txn.writes {
            inner.apply(write, now);
        }
        Ok(Commit::Applied)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use scheduler_core::ManualClock;

    use super::*;
    use crate::TtlExtension;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn compare_and_swap_detects_stale_version() {
        let (_, store) = store();

        assert_eq!(store.compare_and_swap("doc", None, "a".into()).await.unwrap(), Commit::Applied);
        // Creating again must fail: the key now exists.
        assert_eq!(store.compare_and_swap("doc", None, "b".into()).await.unwrap(), Commit::Conflict);

        assert_eq!(store.compare_and_swap("doc", Some(1), "c".into()).await.unwrap(), Commit::Applied);
        assert_eq!(store.compare_and_swap("doc", Some(1), "d".into()).await.unwrap(), Commit::Conflict);

        let doc = store.get("doc").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.value, "c");
    }

    #[tokio::test]
    async fn ttl_value_expires_exactly_at_deadline() {
        let (clock, store) = store();
        store
            .set_with_ttl("lease", "owner".into(), StdDuration::from_secs(10))
            .await
            .unwrap();

        clock.advance(Duration::milliseconds(9_999));
        assert_eq!(store.get_value("lease").await.unwrap().as_deref(), Some("owner"));

        clock.advance(Duration::milliseconds(1));
        assert_eq!(store.get_value("lease").await.unwrap(), None);
    }

    #[tokio::test]
    async fn extend_ttl_only_on_live_keys() {
        let (clock, store) = store();
        store
            .set_with_ttl("k", "v".into(), StdDuration::from_secs(5))
            .await
            .unwrap();

        clock.advance(Duration::seconds(4));
        assert_eq!(
            store.extend_ttl("k", StdDuration::from_secs(5)).await.unwrap(),
            TtlExtension::Extended
        );
        clock.advance(Duration::seconds(4));
        assert!(store.get_value("k").await.unwrap().is_some());

        clock.advance(Duration::seconds(2));
        assert_eq!(
            store.extend_ttl("k", StdDuration::from_secs(5)).await.unwrap(),
            TtlExtension::Expired
        );
    }

    #[tokio::test]
    async fn due_before_orders_by_score_then_member() {
        let (_, store) = store();
        let txn = Transaction::new()
            .write(Write::ZAdd { set: "due".into(), member: "zeta".into(), score: 10 })
            .write(Write::ZAdd { set: "due".into(), member: "alpha".into(), score: 10 })
            .write(Write::ZAdd { set: "due".into(), member: "early".into(), score: 5 })
            .write(Write::ZAdd { set: "due".into(), member: "late".into(), score: 50 });
        store.commit(txn).await.unwrap();

        let due = store.due_before("due", 10, 0, 10).await.unwrap();
        assert_eq!(due, vec!["early", "alpha", "zeta"]);

        let limited = store.due_before("due", 100, 0, 2).await.unwrap();
        assert_eq!(limited, vec!["early", "alpha"]);

        let next_page = store.due_before("due", 100, 2, 2).await.unwrap();
        assert_eq!(next_page, vec!["zeta", "late"]);
    }

    #[tokio::test]
    async fn zadd_moves_existing_member() {
        let (_, store) = store();
        let add = |score| {
            Transaction::new().write(Write::ZAdd { set: "due".into(), member: "job".into(), score })
        };
        store.commit(add(100)).await.unwrap();
        store.commit(add(5)).await.unwrap();

        assert_eq!(store.score("due", "job").await.unwrap(), Some(5));
        assert_eq!(store.due_before("due", 10, 0, 10).await.unwrap(), vec!["job"]);
    }

    #[tokio::test]
    async fn failed_guard_writes_nothing() {
        let (_, store) = store();
        store
            .set_with_ttl("lease", "someone-else".into(), StdDuration::from_secs(30))
            .await
            .unwrap();

        let txn = Transaction::new()
            .guard(Guard::Absent("lease".into()))
            .write(Write::Put { key: "doc".into(), value: "x".into() })
            .write(Write::ZAdd { set: "due".into(), member: "doc".into(), score: 1 });
        assert_eq!(store.commit(txn).await.unwrap(), Commit::Conflict);

        assert!(store.get("doc").await.unwrap().is_none());
        assert!(store.score("due", "doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_values_are_dropped_on_commit() {
        let (clock, store) = store();
        store
            .set_with_ttl("lease", "owner".into(), StdDuration::from_secs(10))
            .await
            .unwrap();
        store
            .set_with_ttl("other", "owner".into(), StdDuration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::seconds(10));
        store
            .commit(Transaction::new().write(Write::Put { key: "doc".into(), value: "x".into() }))
            .await
            .unwrap();

        let inner = store.inner.lock().unwrap();
        assert!(!inner.values.contains_key("lease"));
        assert!(inner.values.contains_key("other"));
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let (_, store) = store();
        store.set_available(false);

        assert!(store.ping().await.unwrap_err().is_unavailable());
        assert!(store.due_before("due", 0, 0, 10).await.unwrap_err().is_unavailable());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
