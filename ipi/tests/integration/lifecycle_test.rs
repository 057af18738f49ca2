use std::sync::Arc;
use std::time::Duration;

use ipi::engine::Engine;
use ipi::error::ErrorKind;
use ipi::test_utils::fetcher::{ScriptedFetcher, ScriptedStep};
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::watcher::ManualFileWatcher;
use ipi::test_utils::{offline_config, wait_until, within_timeout, write_dataset};
use ipi_telemetry::tracing::init_test_tracing;
use secrecy::SecretString;

use crate::logs::CapturedLogs;

const KEY: &str = "192.0.2.1";

fn dataset(tag: &str) -> MockDataset {
    MockDataset::new(tag)
        .with_properties(["Country", "City"])
        .with_tagged_record(KEY)
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_process_known_key_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let engine = Engine::start(offline_config(&path), MockLoader::new())
        .await
        .unwrap();

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));
    assert_eq!(values.get_value_weight("City"), Some(("v1:City", 1.0)));
    assert_eq!(engine.generation(), Some(1));
    assert_eq!(
        engine.published_date(),
        Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    );

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configuration_fails_start_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let err = Engine::start(offline_config(""), MockLoader::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    // Distributor mode with automatic updates needs a license key.
    let mut config = offline_config(&path);
    config.update.enabled = true;
    let loader = MockLoader::new();
    let stats = loader.stats();
    let err = Engine::start(config, loader).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(stats.inits(), 0);

    let mut config = offline_config(&path);
    config.update.enabled = true;
    config.update.url = Some("ftp://updates.example.com/data".to_string());
    let err = Engine::start(config, MockLoader::new()).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_releases_everything_exactly_once_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.pool_size = Some(3);
    config.file_watch.enabled = true;
    config.update.enabled = true;
    config.update.license_key = Some(SecretString::from("secret-key"));

    let loader = MockLoader::new();
    let stats = loader.stats();
    let (watcher, trigger) = ManualFileWatcher::new();
    let engine = Engine::builder(config, loader)
        .fetcher(Arc::new(ScriptedFetcher::new([])))
        .watcher(Box::new(watcher))
        .start()
        .await
        .unwrap();

    let url = engine.data_update_url().unwrap();
    assert!(url.contains("LicenseKeys=***"));
    assert!(!url.contains("secret-key"));

    wait_until("the watcher runs", || trigger.is_running()).await;

    // One reload, so two handles were created.
    dataset("v2").write_to(&path).unwrap();
    trigger.trigger();
    wait_until("the reload completes", || engine.reloads_completed() == 1).await;

    within_timeout(engine.stop()).await.unwrap();

    assert!(trigger.is_stopped());
    assert_eq!(stats.handles_released(), 2);
    assert_eq!(stats.live_handles(), 0);
    assert_eq!(stats.double_releases(), 0);
    assert_eq!(stats.results_released(), 3);

    within_timeout(engine.stop()).await.unwrap();
    assert_eq!(stats.handles_released(), 2);
    assert_eq!(stats.results_released(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_waits_for_in_flight_queries_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let loader = MockLoader::new();
    let stats = loader.stats();
    stats.set_query_delay(Duration::from_millis(200));
    let engine = Arc::new(
        Engine::start(offline_config(&path), loader)
            .await
            .unwrap(),
    );

    let query = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.process(KEY).await })
    };
    wait_until("the query runs", || stats.queries() == 1).await;

    within_timeout(engine.stop()).await.unwrap();

    let values = query.await.unwrap().unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));
    assert_eq!(stats.handles_released(), 1);
    assert_eq!(stats.double_releases(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_on_start_downloads_missing_data_file_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.ipi");

    let mut config = offline_config(&path);
    config.update.enabled = true;
    config.update.url = Some("https://updates.example.com/data".to_string());
    config.update.update_on_start = true;

    let fetcher = Arc::new(ScriptedFetcher::new([ScriptedStep::Dataset(dataset(
        "downloaded",
    ))]));
    let engine = Engine::builder(config.clone(), MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(
        values.get_value_weight("Country"),
        Some(("downloaded:Country", 1.0))
    );
    assert_eq!(fetcher.calls(), 1);
    engine.stop().await.unwrap();

    // Without a file to fall back to, a failed download is fatal.
    std::fs::remove_file(&path).unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new([ScriptedStep::Fail]));
    let err = Engine::builder(config, MockLoader::new())
        .fetcher(fetcher)
        .start()
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::FetchFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_update_on_start_falls_back_to_existing_file_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.update.enabled = true;
    config.update.url = Some("https://updates.example.com/data".to_string());
    config.update.update_on_start = true;

    let engine = Engine::builder(config, MockLoader::new())
        .fetcher(Arc::new(ScriptedFetcher::new([ScriptedStep::Fail])))
        .start()
        .await
        .unwrap();

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn disabled_logging_silences_the_engine_test() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let logs = CapturedLogs::default();
    let _guard = tracing::dispatcher::set_default(&logs.dispatch());

    let mut config = offline_config(&path);
    config.logging = false;
    let engine = Engine::start(config, MockLoader::new()).await.unwrap();
    engine.process(KEY).await.unwrap();
    engine.stop().await.unwrap();

    assert_eq!(logs.contents(), "");
}

#[tokio::test]
async fn custom_log_dispatch_receives_engine_events_test() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let logs = CapturedLogs::default();
    let mut config = offline_config(&path);
    config.logging = false;
    let engine = Engine::builder(config, MockLoader::new())
        .log_dispatch(logs.dispatch())
        .start()
        .await
        .unwrap();
    engine.stop().await.unwrap();

    let contents = logs.contents();
    assert!(contents.contains("engine started"));
    assert!(contents.contains("engine stopped"));
}
