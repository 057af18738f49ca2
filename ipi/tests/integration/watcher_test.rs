use ipi::engine::Engine;
use ipi_config::shared::WatchBackend;
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::watcher::ManualFileWatcher;
use ipi::test_utils::{offline_config, wait_until, write_dataset};
use ipi_telemetry::tracing::init_test_tracing;

const KEY: &str = "203.0.113.9";

fn dataset(tag: &str) -> MockDataset {
    MockDataset::new(tag)
        .with_properties(["Country", "City"])
        .with_tagged_record(KEY)
}

#[tokio::test(flavor = "multi_thread")]
async fn file_change_triggers_reload_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.file_watch.enabled = true;
    let (watcher, trigger) = ManualFileWatcher::new();
    let engine = Engine::builder(config, MockLoader::new())
        .watcher(Box::new(watcher))
        .start()
        .await
        .unwrap();

    assert_eq!(trigger.watched_paths(), vec![path.clone()]);
    wait_until("the watcher runs", || trigger.is_running()).await;

    dataset("v2").write_to(&path).unwrap();
    assert_eq!(trigger.trigger(), 1);
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    assert_eq!(engine.file_changes_observed(), 1);
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("City"), Some(("v2:City", 1.0)));

    engine.stop().await.unwrap();
    assert!(trigger.is_stopped());

    // Changes reported after stop are counted but never reloaded.
    trigger.trigger();
    assert_eq!(engine.reloads_completed(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_is_ignored_when_file_watching_is_disabled_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let (watcher, trigger) = ManualFileWatcher::new();
    let engine = Engine::builder(offline_config(&path), MockLoader::new())
        .watcher(Box::new(watcher))
        .start()
        .await
        .unwrap();

    assert!(trigger.watched_paths().is_empty());
    assert!(!trigger.is_running());

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_watcher_detects_replaced_file_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.file_watch.enabled = true;
    config.file_watch.backend = WatchBackend::Polling;
    config.file_watch.poll_interval_ms = 20;
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();

    // Let the watcher take its first snapshot.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    dataset("v2-replaced").write_to(&path).unwrap();
    wait_until("the replaced file is serving", || {
        engine.reloads_completed() >= 1
    })
    .await;

    assert!(engine.file_changes_observed() >= 1);
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(
        values.get_value_weight("City"),
        Some(("v2-replaced:City", 1.0))
    );

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn os_notifications_trigger_reload_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.file_watch.enabled = true;
    config.file_watch.debounce_ms = 50;
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();

    // Let the watcher subscribe to the directory.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    dataset("v2").write_to(&path).unwrap();
    wait_until("the replaced file is serving", || {
        engine.reloads_completed() >= 1
    })
    .await;

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("City"), Some(("v2:City", 1.0)));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_watcher_is_restarted_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.file_watch.enabled = true;
    let (watcher, trigger) = ManualFileWatcher::new();
    trigger.panic_next_runs(1);
    let engine = Engine::builder(config, MockLoader::new())
        .watcher(Box::new(watcher))
        .start()
        .await
        .unwrap();

    wait_until("the watcher runs again", || trigger.is_running()).await;
    assert_eq!(trigger.runs(), 2);

    dataset("v2").write_to(&path).unwrap();
    assert_eq!(trigger.trigger(), 1);
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("City"), Some(("v2:City", 1.0)));

    // The crash stays in the log.
    engine.stop().await.unwrap();
    assert!(trigger.is_stopped());
}
