use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herdgate::{Detector, Fingerprint, Herd, Status, Storage, TokenBucketConfig};
use herdgate_redis::{RedisKeys, RedisStorage, TokenBucketRedis};
use redis::aio::ConnectionManager;

// Requires Redis running. If HERDGATE_TEST_REDIS_URL is unset, the tests skip.
async fn connect() -> Option<ConnectionManager> {
    let url = match std::env::var("HERDGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set HERDGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return None;
        }
    };
    let client = redis::Client::open(url.as_str())
        .unwrap_or_else(|e| panic!("invalid redis url '{}': {}", url, e));
    let conn = ConnectionManager::new(client)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e));
    Some(conn)
}

// Fresh namespace per test so runs never see each other's keys.
fn unique_keys(test: &str) -> RedisKeys {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    RedisKeys::new(format!("herdgate-test:{}:{}:{}", test, std::process::id(), nanos)).expect("valid prefix")
}

#[tokio::test]
async fn bucket_allows_burst_then_flags_herd() {
    let Some(conn) = connect().await else { return };
    let config = TokenBucketConfig::new(3, Duration::from_secs(60), Duration::from_secs(60)).unwrap();
    let detector = TokenBucketRedis::new(conn, config).unwrap().with_keys(unique_keys("burst"));
    let fp = Fingerprint::from("GET /burst");

    let mut flags = Vec::new();
    for _ in 0..5 {
        flags.push(detector.is_thundering_herd(&fp).await.unwrap());
    }
    assert_eq!(flags, vec![false, false, false, true, true]);

    // other fingerprints have their own bucket
    assert!(!detector.is_thundering_herd(&Fingerprint::from("GET /other")).await.unwrap());
}

#[tokio::test]
async fn cooldown_expires() {
    let Some(conn) = connect().await else { return };
    let config = TokenBucketConfig::default().with_cooldown_interval(Duration::from_millis(300));
    let detector = TokenBucketRedis::new(conn, config).unwrap().with_keys(unique_keys("cooldown"));
    let fp = Fingerprint::from("GET /cool");

    assert!(!detector.is_cool_down(&fp).await.unwrap());
    detector.cool_down(&fp).await.unwrap();
    assert!(detector.is_cool_down(&fp).await.unwrap());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!detector.is_cool_down(&fp).await.unwrap());
}

#[tokio::test]
async fn storage_lifecycle() {
    let Some(conn) = connect().await else { return };
    let storage = RedisStorage::new(conn).with_keys(unique_keys("storage"));
    let fp = Fingerprint::from(vec![0x00, 0xff, 0x10]);

    assert!(!storage.exists(&fp).await.unwrap());
    assert!(!storage.processed(&fp).await.unwrap());

    storage.store(&fp, false).await.unwrap();
    assert!(storage.exists(&fp).await.unwrap());
    assert!(!storage.processed(&fp).await.unwrap());

    storage.store(&fp, true).await.unwrap();
    assert!(storage.processed(&fp).await.unwrap());

    storage.remove(&fp).await.unwrap();
    assert!(!storage.exists(&fp).await.unwrap());
    // removing twice is fine
    storage.remove(&fp).await.unwrap();
}

#[tokio::test]
async fn record_ttl_releases_abandoned_claims() {
    let Some(conn) = connect().await else { return };
    let storage = RedisStorage::new(conn)
        .with_keys(unique_keys("lease"))
        .with_record_ttl(Duration::from_millis(300));
    let fp = Fingerprint::from("abandoned");

    assert!(storage.claim(&fp).await.unwrap());
    assert!(!storage.claim(&fp).await.unwrap());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!storage.exists(&fp).await.unwrap());
    assert!(storage.claim(&fp).await.unwrap());
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let Some(conn) = connect().await else { return };
    let storage = Arc::new(RedisStorage::new(conn).with_keys(unique_keys("claim")));
    let fp = Fingerprint::from("contended");

    let claims = futures::future::join_all((0..20).map(|_| {
        let storage = storage.clone();
        let fp = fp.clone();
        tokio::spawn(async move { storage.claim(&fp).await.unwrap() })
    }))
    .await;

    let winners = claims.into_iter().map(|r| r.unwrap()).filter(|won| *won).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn herd_over_redis() {
    let Some(conn) = connect().await else { return };
    let keys = unique_keys("herd");
    let config = TokenBucketConfig::new(1, Duration::from_secs(60), Duration::from_secs(60)).unwrap();
    let herd = Herd::new(
        TokenBucketRedis::new(conn.clone(), config).unwrap().with_keys(keys.clone()),
        RedisStorage::new(conn).with_keys(keys),
    );
    let request = Fingerprint::from("GET /report");

    assert_eq!(herd.evaluate(&request).await.unwrap(), Status::OpenGates);
    assert_eq!(herd.evaluate(&request).await.unwrap(), Status::Process);
    assert_eq!(herd.evaluate(&request).await.unwrap(), Status::Wait);

    herd.request_done(&request).await.unwrap();
    assert_eq!(herd.evaluate(&request).await.unwrap(), Status::OpenGates);
}
