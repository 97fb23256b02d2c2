mod common;

use std::{fs, time::{Duration, SystemTime}};

use camino::Utf8Path;
use filetime::FileTime;
use futures::TryStreamExt;
use imgsrch_core::store::{fingerprint::FileState, EmbeddingStore, StoreError};

use common::{open_store, temp_dir, write_image, BLUE, DIMENSION, RED};

#[tokio::test(flavor = "multi_thread")]
async fn storing_twice_keeps_one_record() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let path = images.path.join("a.png");
    write_image(&path, RED);

    store.store(&path, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    store.store(&path, &[0.0, 1.0, 0.0, 0.0]).await.unwrap();

    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(store.get(&path).await.unwrap(), Some(vec![0.0, 1.0, 0.0, 0.0]));
    assert!(store.exists(&path).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn embeddings_round_trip_exactly() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    let vector = vec![0.1f32, -1.0 / 3.0, f32::EPSILON, 12345.678];

    store.store(Utf8Path::new("/nowhere/it's.png"), &vector).await.unwrap();

    let stored = store.get(Utf8Path::new("/nowhere/it's.png")).await.unwrap().unwrap();
    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&stored), bits(&vector));
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_dimension_is_rejected() {
    let data = temp_dir();
    let store = open_store(&data.path).await;

    let result = store.store(Utf8Path::new("/x.png"), &[1.0, 2.0]).await;
    assert!(matches!(result, Err(StoreError::InvalidVectorLength { actual: 2, expected: DIMENSION })));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reopening_with_another_dimension_fails() {
    let data = temp_dir();
    drop(open_store(&data.path).await);

    let reopened = EmbeddingStore::open(&data.path, "image_embeddings", DIMENSION + 1).await;
    assert!(matches!(reopened, Err(StoreError::Open(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_record_needs_reindexing() {
    let data = temp_dir();
    let store = open_store(&data.path).await;

    assert!(store.needs_reindexing(Utf8Path::new("missing.jpg")).await);
    assert_eq!(store.get(Utf8Path::new("missing.jpg")).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn content_change_makes_record_stale() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let path = images.path.join("a.png");
    write_image(&path, RED);

    store.store(&path, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    assert!(!store.needs_reindexing(&path).await);

    // keep the old mtime so only the fingerprint differs
    let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
    fs::write(&path, b"different bytes").unwrap();
    filetime::set_file_mtime(&path, mtime).unwrap();

    assert!(store.needs_reindexing(&path).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_mtime_makes_record_stale() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let path = images.path.join("a.png");
    write_image(&path, RED);

    store.store(&path, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    assert!(!store.needs_reindexing(&path).await);

    let later = SystemTime::now() + Duration::from_secs(60);
    filetime::set_file_mtime(&path, FileTime::from_system_time(later)).unwrap();

    assert!(store.needs_reindexing(&path).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_file_needs_reindexing() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let path = images.path.join("a.png");
    write_image(&path, RED);
    store.store(&path, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();

    fs::remove_file(&path).unwrap();
    assert!(store.needs_reindexing(&path).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_file_is_stored_but_stays_stale() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    let path = Utf8Path::new("/does/not/exist.png");

    store.store(path, &[0.5, 0.5, 0.5, 0.5]).await.unwrap();

    let record = store.get_record(path).await.unwrap().unwrap();
    assert_eq!(record.content_fingerprint, "");
    assert!(store.needs_reindexing(path).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_removes_exactly_the_missing_files() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;

    let paths: Vec<_> = (0..5).map(|i| images.path.join(format!("{i}.png"))).collect();
    for path in &paths {
        write_image(path, RED);
        store.store(path, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    }
    fs::remove_file(&paths[1]).unwrap();
    fs::remove_file(&paths[3]).unwrap();

    assert_eq!(store.cleanup_missing().await.unwrap(), 2);
    assert_eq!(store.count().await.unwrap(), 3);
    assert!(!store.exists(&paths[1]).await.unwrap());
    assert!(store.exists(&paths[4]).await.unwrap());
    assert_eq!(store.cleanup_missing().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_and_clear() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    for name in ["/a.png", "/b.png", "/c.png"] {
        store.store(Utf8Path::new(name), &[1.0, 1.0, 1.0, 1.0]).await.unwrap();
    }

    store.remove(Utf8Path::new("/b.png")).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    assert!(!store.exists(Utf8Path::new("/b.png")).await.unwrap());

    store.clear().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
    let remaining: Vec<_> = store.all().await.unwrap().try_collect().await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn all_is_restartable() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    store.store(Utf8Path::new("/a.png"), &[1.0, 0.0, 0.0, 0.0]).await.unwrap();

    let first: Vec<_> = store.all().await.unwrap().try_collect().await.unwrap();
    store.store(Utf8Path::new("/b.png"), &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
    let second: Vec<_> = store.all().await.unwrap().try_collect().await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_report_counts_and_location() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    store.store(Utf8Path::new("/a.png"), &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    store.store(Utf8Path::new("/b.png"), &[0.0, 1.0, 0.0, 0.0]).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_embeddings, 2);
    assert_eq!(stats.recent_embeddings, 2);
    assert!(stats.database_path.starts_with(&data.path));
    assert!(stats.database_size_mb > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_rewritten_while_embedding_stays_stale() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let path = images.path.join("a.png");
    write_image(&path, RED);

    // state taken before the image was decoded and embedded
    let before = FileState::read(&path).unwrap();
    write_image(&path, BLUE);
    store.store_with_state(&path, &[1.0, 0.0, 0.0, 0.0], before.clone()).await.unwrap();

    let record = store.get_record(&path).await.unwrap().unwrap();
    assert_eq!(record.content_fingerprint, before.fingerprint);
    assert!(store.needs_reindexing(&path).await);

    store.store(&path, &[0.0, 0.0, 1.0, 0.0]).await.unwrap();
    assert!(!store.needs_reindexing(&path).await);
}
