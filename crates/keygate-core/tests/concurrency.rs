//! Concurrent first-use races against every store backend.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::Barrier;

use keygate_core::{
    EngineConfig, FixedClock, JsonFileStore, LicenseRecord, LicenseStore, MemoryStore, Outcome,
    Snapshot, VerificationEngine,
};

fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

fn engine_over(store: Arc<dyn LicenseStore>) -> Arc<VerificationEngine> {
    Arc::new(VerificationEngine::with_clock(
        store,
        Arc::new(FixedClock::new(at(2026, 10, 19))),
        EngineConfig::default(),
    ))
}

/// Race `contenders` first uses of the same key and return (hwid, outcome) pairs.
async fn race(engine: Arc<VerificationEngine>, key: &str, contenders: usize) -> Vec<(String, Outcome)> {
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for i in 0..contenders {
        let engine = engine.clone();
        let barrier = barrier.clone();
        let key = key.to_string();
        handles.push(tokio::spawn(async move {
            let hwid = format!("HW-{}", i);
            barrier.wait().await;
            let outcome = engine.verify(&key, Some(&hwid)).await.expect("verify failed");
            (hwid, outcome)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

/// Exactly one contender wins and the stored binding names the winner.
async fn assert_single_winner(store: Arc<dyn LicenseStore>, results: &[(String, Outcome)]) {
    let winners: Vec<&String> = results
        .iter()
        .filter(|(_, outcome)| outcome.is_valid())
        .map(|(hwid, _)| hwid)
        .collect();
    assert_eq!(winners.len(), 1, "expected a single winner, got {:?}", results);

    let losers = results
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Outcome::Bound { .. }))
        .count();
    assert_eq!(losers, results.len() - 1);

    let record = store.get("RACE").await.unwrap().unwrap();
    assert!(record.is_bound_to(winners[0]));
}

fn unbound_race_key() -> LicenseRecord {
    LicenseRecord::unbound("RACE", at(2099, 1, 1))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_machines_race_memory_store() {
    for _ in 0..50 {
        let store: Arc<dyn LicenseStore> = Arc::new(MemoryStore::with_records([unbound_race_key()]));
        let results = race(engine_over(store.clone()), "RACE", 2).await;
        assert_single_winner(store, &results).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_machines_race_memory_store() {
    let store: Arc<dyn LicenseStore> = Arc::new(MemoryStore::with_records([unbound_race_key()]));
    let engine = engine_over(store.clone());
    let results = race(engine.clone(), "RACE", 32).await;
    assert_single_winner(store.clone(), &results).await;

    // Binding is stable under further reads
    let winner = results.iter().find(|(_, o)| o.is_valid()).unwrap().0.clone();
    for _ in 0..5 {
        assert!(engine.verify("RACE", Some(&winner)).await.unwrap().is_valid());
        assert!(store.get("RACE").await.unwrap().unwrap().is_bound_to(&winner));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_machines_race_json_store() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("licenses.json");

    let json_store = JsonFileStore::open(&path).await.unwrap();
    let mut seed = Snapshot::new();
    seed.insert("RACE".to_string(), unbound_race_key());
    json_store.persist_all(&seed).await.unwrap();

    let store: Arc<dyn LicenseStore> = Arc::new(json_store);
    let results = race(engine_over(store.clone()), "RACE", 16).await;
    assert_single_winner(store.clone(), &results).await;

    // The durable copy agrees with memory
    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert_eq!(reopened.load_all().await.unwrap(), store.load_all().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_keys_bind_independently() {
    let records: Vec<LicenseRecord> = (0..20)
        .map(|i| LicenseRecord::unbound(format!("K{}", i), at(2099, 1, 1)))
        .collect();
    let store: Arc<dyn LicenseStore> = Arc::new(MemoryStore::with_records(records));
    let engine = engine_over(store.clone());

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .verify(&format!("K{}", i), Some(&format!("HW-{}", i)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Outcome::Valid { newly_bound: true, .. }));
    }

    for i in 0..20 {
        let record = store.get(&format!("K{}", i)).await.unwrap().unwrap();
        assert!(record.is_bound_to(&format!("HW-{}", i)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_verify_keeps_binding_json_store() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("licenses.json");

    let json_store = JsonFileStore::open(&path).await.unwrap();
    let mut seed = Snapshot::new();
    seed.insert("RACE".to_string(), unbound_race_key());
    json_store.persist_all(&seed).await.unwrap();

    let store: Arc<dyn LicenseStore> = Arc::new(json_store);
    let engine = engine_over(store.clone());

    // The first machine's request goes away mid-write
    tokio::select! {
        biased;
        _ = engine.verify("RACE", Some("HW-A")) => {}
        _ = tokio::task::yield_now() => {}
    }

    let second = engine.verify("RACE", Some("HW-B")).await.unwrap();
    assert!(matches!(second, Outcome::Bound { .. }), "second machine got {:?}", second);
    assert!(store.get("RACE").await.unwrap().unwrap().is_bound_to("HW-A"));

    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert!(reopened.get("RACE").await.unwrap().unwrap().is_bound_to("HW-A"));
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_machines_race_sqlite_store() {
    use keygate_core::SqliteStore;

    let temp_dir = tempfile::TempDir::new().unwrap();
    let sqlite = SqliteStore::new(temp_dir.path().join("licenses.db")).await.unwrap();
    let mut seed = Snapshot::new();
    seed.insert("RACE".to_string(), unbound_race_key());
    sqlite.persist_all(&seed).await.unwrap();

    let store: Arc<dyn LicenseStore> = Arc::new(sqlite);
    let results = race(engine_over(store.clone()), "RACE", 16).await;
    assert_single_winner(store, &results).await;
}
