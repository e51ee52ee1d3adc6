// Runs the Redis backend against a live server.
// `REDIS_URL=redis://127.0.0.1:6379 cargo test -p scheduler-store -- --ignored`

use std::time::Duration;

use scheduler_store::{Commit, Guard, RedisStore, Store, Transaction, TtlExtension, Write};

async fn connect() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisStore::connect(&url).await.expect("redis reachable")
}

fn unique(prefix: &str) -> String {
    format!("{{itest}}:{prefix}:{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "needs a running redis server"]
async fn versioned_documents_follow_compare_and_swap() {
    let store = connect().await;
    let key = unique("doc");

    assert_eq!(store.compare_and_swap(&key, None, "one".into()).await.unwrap(), Commit::Applied);
    assert_eq!(store.compare_and_swap(&key, None, "two".into()).await.unwrap(), Commit::Conflict);
    assert_eq!(store.compare_and_swap(&key, Some(1), "two".into()).await.unwrap(), Commit::Applied);

    let doc = store.get(&key).await.unwrap().unwrap();
    assert_eq!((doc.version, doc.value.as_str()), (2, "two"));

    store.commit(Transaction::new().write(Write::Delete { key: key.clone() })).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "needs a running redis server"]
async fn lease_style_transaction_is_exclusive() {
    let store = connect().await;
    let lease = unique("lease");

    let acquire = |token: &str| {
        Transaction::new()
            .guard(Guard::Absent(lease.clone()))
            .write(Write::SetWithTtl {
                key: lease.clone(),
                value: token.to_string(),
                ttl: Duration::from_millis(300),
            })
    };
    assert_eq!(store.commit(acquire("a")).await.unwrap(), Commit::Applied);
    assert_eq!(store.commit(acquire("b")).await.unwrap(), Commit::Conflict);

    let owner_only = Transaction::new()
        .guard(Guard::Equals { key: lease.clone(), value: "b".into() })
        .write(Write::Delete { key: lease.clone() });
    assert_eq!(store.commit(owner_only).await.unwrap(), Commit::Conflict);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.extend_ttl(&lease, Duration::from_secs(1)).await.unwrap(), TtlExtension::Expired);
    assert_eq!(store.commit(acquire("b")).await.unwrap(), Commit::Applied);
}

#[tokio::test]
#[ignore = "needs a running redis server"]
async fn due_before_breaks_ties_lexically() {
    let store = connect().await;
    let set = unique("due");

    let txn = Transaction::new()
        .write(Write::ZAdd { set: set.clone(), member: "b".into(), score: 10 })
        .write(Write::ZAdd { set: set.clone(), member: "a".into(), score: 10 })
        .write(Write::ZAdd { set: set.clone(), member: "c".into(), score: 5 })
        .write(Write::ZAdd { set: set.clone(), member: "d".into(), score: 99 });
    store.commit(txn).await.unwrap();

    assert_eq!(store.due_before(&set, 10, 0, 10).await.unwrap(), vec!["c", "a", "b"]);
    assert_eq!(store.due_before(&set, 10, 1, 1).await.unwrap(), vec!["a"]);
    assert_eq!(store.score(&set, "d").await.unwrap(), Some(99));

    store.commit(Transaction::new().write(Write::Delete { key: set })).await.unwrap();
}
