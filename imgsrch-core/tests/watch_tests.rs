mod common;

use std::{fs, sync::Arc, time::Duration};

use camino::Utf8Path;
use imgsrch_core::{store::EmbeddingStore, watch::FolderWatcher};
use tokio::{runtime::Handle, time::sleep};

use common::{open_store, spawn_worker, temp_dir, write_image, BLUE, RED};

const DEBOUNCE: Duration = Duration::from_millis(100);

async fn wait_for(store: &EmbeddingStore, path: &Utf8Path) -> bool {
    for _ in 0..100 {
        if store.exists(path).await.unwrap() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

fn watcher(store: Arc<EmbeddingStore>) -> Arc<FolderWatcher> {
    Arc::new(FolderWatcher::new(store, spawn_worker(), Handle::current(), DEBOUNCE))
}

async fn stop(watcher: Arc<FolderWatcher>) {
    tokio::task::spawn_blocking(move || watcher.stop_all()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn new_images_are_indexed() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let watcher = watcher(store.clone());
    fs::create_dir(images.path.join("sub")).unwrap();

    assert!(watcher.watch(&images.path).unwrap());
    let created = images.path.join("fresh.png");
    write_image(&created, RED);
    let nested = images.path.join("sub/nested.png");
    write_image(&nested, BLUE);
    fs::write(images.path.join("notes.txt"), b"not an image").unwrap();

    assert!(wait_for(&store, &created).await, "created image was never indexed");
    assert!(wait_for(&store, &nested).await, "image in subfolder was never indexed");

    let vector = store.get(&created).await.unwrap().unwrap();
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);

    stop(watcher).await;
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn watching_twice_is_a_no_op() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let watcher = watcher(store);

    assert!(watcher.watch(&images.path).unwrap());
    assert!(!watcher.watch(&images.path).unwrap());
    assert!(watcher.is_watching(&images.path));

    stop(watcher.clone()).await;
    assert!(!watcher.is_watching(&images.path));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_folder_cannot_be_watched() {
    let data = temp_dir();
    let store = open_store(&data.path).await;
    let watcher = watcher(store);

    assert!(watcher.watch(&data.path.join("nope")).is_err());
    assert!(!watcher.is_watching(&data.path.join("nope")));
}

#[tokio::test]
async fn dropping_live_watcher_inside_the_runtime_returns() {
    let data = temp_dir();
    let images = temp_dir();
    let store = open_store(&data.path).await;
    let watcher = watcher(store.clone());
    assert!(watcher.watch(&images.path).unwrap());

    drop(watcher);

    // the current-thread runtime is still usable
    assert_eq!(store.count().await.unwrap(), 0);
}
