use std::time::Duration;

use compcache_service::hashing::Digest;
use compcache_service::lookup::Verdict;
use compcache_service::storage::remote::{AccessMode, Secondary, SecondaryStorageConfig};
use compcache_service::storage::stats::Counter;
use compcache_service::storage::{Limits, LocalStorage, Storage, StorageKey};
use compcache_test::{self as test, BlobServer};
use url::Url;

use crate::{Project, cache_in, count, inputs};

fn secondary(url: Url, mode: AccessMode, timeout: Duration) -> Secondary {
    let config = SecondaryStorageConfig {
        mode,
        timeout,
        ..SecondaryStorageConfig::new(url)
    };
    Secondary::from_config(&config).unwrap()
}

fn storage_with(dir: &test::TempDir, secondaries: Vec<Secondary>) -> Storage {
    let primary =
        LocalStorage::new(dir.path(), 2, Limits::unlimited(), Duration::from_secs(1)).unwrap();
    Storage::new(primary, secondaries)
}

fn key() -> StorageKey {
    StorageKey::result(Digest::of(b"some result"))
}

#[tokio::test]
async fn test_secondary_hit_is_promoted() {
    test::setup();
    let server = BlobServer::new();
    server.insert(&key().to_string(), "remote blob");

    let cache_dir = test::tempdir();
    let storage = storage_with(
        &cache_dir,
        vec![secondary(server.url("cache/"), AccessMode::ReadWrite, Duration::from_secs(2))],
    );

    assert!(!storage.primary().contains(&key()));
    let blob = storage.get(&key()).await.unwrap();
    assert_eq!(blob.as_deref(), Some(&b"remote blob"[..]));
    assert!(storage.primary().contains(&key()));
    assert_eq!(server.accesses(), 1);

    // served from the primary now
    let blob = storage.get(&key()).await.unwrap();
    assert_eq!(blob.as_deref(), Some(&b"remote blob"[..]));
    assert_eq!(server.accesses(), 0);

    let summary = storage.summary().unwrap();
    assert_eq!(summary.counters.get(Counter::SecondaryHits), 1);
    assert_eq!(summary.counters.get(Counter::FilesInCache), 1);
}

#[tokio::test]
async fn test_put_writes_through() {
    test::setup();
    let writable = BlobServer::new();
    let read_only = BlobServer::new();

    let cache_dir = test::tempdir();
    let storage = storage_with(
        &cache_dir,
        vec![
            secondary(read_only.url("cache/"), AccessMode::ReadOnly, Duration::from_secs(2)),
            secondary(writable.url("cache/"), AccessMode::WriteOnly, Duration::from_secs(2)),
        ],
    );

    storage.put(&key(), b"blob").await.unwrap();
    assert!(storage.primary().contains(&key()));
    assert_eq!(writable.blob(&key().to_string()).as_deref(), Some(&b"blob"[..]));
    assert!(read_only.keys().is_empty());

    // write-only backends are never read
    storage.remove(&key()).unwrap();
    writable.accesses();
    assert_eq!(storage.get(&key()).await.unwrap(), None);
    assert_eq!(writable.accesses(), 0);
    assert_eq!(read_only.accesses(), 1);
}

#[tokio::test]
async fn test_failing_secondary_is_demoted() {
    test::setup();
    let server = BlobServer::new();

    let cache_dir = test::tempdir();
    let storage = storage_with(
        &cache_dir,
        vec![secondary(server.url("fail/"), AccessMode::ReadWrite, Duration::from_secs(2))],
    );

    assert_eq!(storage.get(&key()).await.unwrap(), None);
    assert!(!storage.secondaries()[0].is_available());
    assert_eq!(server.accesses(), 1);

    // skipped for the rest of the process, and the primary keeps working
    assert_eq!(storage.get(&key()).await.unwrap(), None);
    storage.put(&key(), b"blob").await.unwrap();
    assert_eq!(server.accesses(), 0);
    assert_eq!(storage.get(&key()).await.unwrap().as_deref(), Some(&b"blob"[..]));

    let summary = storage.summary().unwrap();
    assert_eq!(summary.counters.get(Counter::SecondaryErrors), 1);
    assert_eq!(summary.counters.get(Counter::SecondaryTimeouts), 0);
}

#[tokio::test]
async fn test_slow_secondary_times_out() {
    test::setup();
    let server = BlobServer::new();

    let cache_dir = test::tempdir();
    let storage = storage_with(
        &cache_dir,
        vec![
            secondary(server.url("delay/1h/"), AccessMode::ReadOnly, Duration::from_millis(100)),
            secondary(server.url("cache/"), AccessMode::ReadWrite, Duration::from_secs(2)),
        ],
    );
    server.insert(&key().to_string(), "blob");

    let blob = storage.get(&key()).await.unwrap();
    assert_eq!(blob.as_deref(), Some(&b"blob"[..]));
    assert!(!storage.secondaries()[0].is_available());
    assert!(storage.secondaries()[1].is_available());

    let summary = storage.summary().unwrap();
    assert_eq!(summary.counters.get(Counter::SecondaryTimeouts), 1);
    assert_eq!(summary.counters.get(Counter::SecondaryHits), 1);
}

#[tokio::test]
async fn test_shared_directory_between_caches() {
    test::setup();
    let shared = test::tempdir();
    let shared_url = Url::from_directory_path(shared.path()).unwrap();
    let project = Project::new("#include \"foo.h\"\nint x;\n", "int y;\n");
    let compilation = project.compilation();

    let configure = |config: &mut compcache_service::config::Config| {
        config.secondary_storage = vec![SecondaryStorageConfig::new(shared_url.clone())];
    };

    let first_dir = test::tempdir();
    let first = cache_in(first_dir.path(), configure);
    let outcome = first.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::Miss);

    // a second machine with an empty primary finds everything in the shared directory
    let second_dir = test::tempdir();
    let second = cache_in(second_dir.path(), configure);
    let outcome = second.lookup(&inputs(), &compilation).await.unwrap();
    assert_eq!(outcome.verdict, Verdict::DirectHit);
    assert_eq!(compilation.compile_calls(), 1);
    assert_eq!(count(&second, Counter::SecondaryHits), 2);
}
