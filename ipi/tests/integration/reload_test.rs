use ipi::engine::Engine;
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::{offline_config, wait_until, within_timeout, write_dataset};
use ipi::workers::reload::ReloadState;
use ipi_telemetry::tracing::init_test_tracing;

const KEY: &str = "192.0.2.1";

fn dataset(tag: &str) -> MockDataset {
    MockDataset::new(tag)
        .with_properties(["Country", "City"])
        .with_tagged_record(KEY)
}

fn files_in(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_reload_keeps_serving_previous_data_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let loader = MockLoader::new();
    let stats = loader.stats();
    let engine = Engine::start(offline_config(&path), loader).await.unwrap();

    stats.fail_next_reload();
    dataset("v2").write_to(&path).unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the failed reload finishes", || {
        stats.reloads() == 1 && engine.reload_state() == ReloadState::Idle
    })
    .await;

    assert_eq!(engine.generation(), Some(1));
    assert_eq!(engine.reloads_completed(), 0);
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));

    // The next reload of the same file succeeds.
    engine.reload_now().await.unwrap();
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v2:Country", 1.0)));

    engine.stop().await.unwrap();
    assert_eq!(stats.handles_released(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_file_keeps_serving_previous_data_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let loader = MockLoader::new();
    let stats = loader.stats();
    let engine = Engine::start(offline_config(&path), loader).await.unwrap();

    std::fs::write(&path, b"not a data file").unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the failed reload finishes", || {
        stats.reloads() == 1 && engine.reload_state() == ReloadState::Idle
    })
    .await;

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("City"), Some(("v1:City", 1.0)));

    engine.stop().await.unwrap();
    assert_eq!(stats.handles_released(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_to_file_without_configured_property_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.properties = vec!["Country".to_string(), "City".to_string()];
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();
    assert!(engine.properties().unwrap().index_of("Country").is_some());

    MockDataset::new("v2")
        .with_properties(["City"])
        .with_tagged_record(KEY)
        .write_to(&path)
        .unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    let cache = engine.properties().unwrap();
    assert_eq!(cache.index_of("Country"), None);
    assert_eq!(cache.len(), 1);

    let values = engine.process(KEY).await.unwrap();
    assert!(!values.contains("Country"));
    assert_eq!(values.get_value_weight("City"), Some(("v2:City", 1.0)));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn temp_copies_are_replaced_and_removed_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let temp_dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.temp_copy.directory = Some(temp_dir.path().to_path_buf());
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();

    let first = engine.data_file_in_use().unwrap();
    assert!(first.starts_with(temp_dir.path()));
    assert_eq!(files_in(temp_dir.path()), 1);

    for (expected, tag) in [(1, "v2"), (2, "v3")] {
        dataset(tag).write_to(&path).unwrap();
        engine.reload_now().await.unwrap();
        wait_until("the reload completes", || {
            engine.reloads_completed() == expected
        })
        .await;
    }

    assert!(!first.exists());
    assert_eq!(files_in(temp_dir.path()), 1);

    engine.stop().await.unwrap();
    assert_eq!(files_in(temp_dir.path()), 0);
    assert!(temp_dir.path().exists());
    assert!(path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_owned_temp_directory_is_deleted_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let engine = Engine::start(offline_config(&path), MockLoader::new())
        .await
        .unwrap();
    let copy = engine.data_file_in_use().unwrap();
    let temp_dir = copy.parent().unwrap().to_path_buf();
    assert_ne!(temp_dir, dir.path());

    engine.stop().await.unwrap();
    assert!(!temp_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_in_place_without_temp_copies_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.temp_copy.enabled = false;
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();
    assert_eq!(engine.data_file_in_use(), Some(path.clone()));

    dataset("v2").write_to(&path).unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    assert_eq!(engine.data_file_in_use(), Some(path.clone()));
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v2:Country", 1.0)));

    engine.stop().await.unwrap();
    assert!(path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_state_subscribers_see_transitions_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let engine = Engine::start(offline_config(&path), MockLoader::new())
        .await
        .unwrap();
    let mut state_rx = engine.subscribe_reload_state();
    assert!(!state_rx.has_changed().unwrap());
    assert_eq!(*state_rx.borrow_and_update(), ReloadState::Idle);

    dataset("v2").write_to(&path).unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    // Transitions were published even if the pipeline is already idle again.
    assert!(state_rx.has_changed().unwrap());
    within_timeout(state_rx.wait_for(|state| *state == ReloadState::Idle))
        .await
        .unwrap();
    assert_eq!(engine.generation(), Some(2));

    engine.stop().await.unwrap();
}
