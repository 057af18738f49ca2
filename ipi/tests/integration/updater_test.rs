use std::sync::Arc;
use std::time::{Duration, Instant};

use ipi::engine::Engine;
use ipi::test_utils::fetcher::{ScriptedFetcher, ScriptedStep};
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::{offline_config, wait_until, write_dataset};
use ipi_config::shared::EngineConfig;
use ipi_telemetry::tracing::init_test_tracing;

use crate::logs::CapturedLogs;

const KEY: &str = "198.51.100.7";

fn dataset(tag: &str) -> MockDataset {
    MockDataset::new(tag)
        .with_properties(["Country", "City"])
        .with_tagged_record(KEY)
}

fn scheduled_config(path: &std::path::Path) -> EngineConfig {
    let mut config = offline_config(path);
    config.update.enabled = true;
    config.update.url = Some("https://updates.example.com/data".to_string());
    config.update.polling_interval_secs = 1;
    config.update.randomization_secs = 0;
    config.update.max_retries = 3;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn updater_keeps_serving_through_failures_and_applies_download_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let fetcher = Arc::new(ScriptedFetcher::new([
        ScriptedStep::Fail,
        ScriptedStep::Fail,
        ScriptedStep::Fail,
        ScriptedStep::Dataset(dataset("v2")),
    ]));
    let fetched = fetcher.fetched();

    let engine = Engine::builder(scheduled_config(&path), MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(
        engine.data_update_url().as_deref(),
        Some("https://updates.example.com/data")
    );

    for _ in 0..3 {
        fetched.notified().await;
        let values = engine.process(KEY).await.unwrap();
        assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));
    }
    assert_eq!(engine.reloads_completed(), 0);

    wait_until("the downloaded file is serving", || {
        engine.reloads_completed() == 1
    })
    .await;
    assert_eq!(fetcher.calls(), 4);

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v2:Country", 1.0)));
    assert_eq!(MockDataset::read_from(&path).unwrap().tag, "v2");

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn updater_sends_time_of_last_download_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let fetcher = Arc::new(ScriptedFetcher::new([
        ScriptedStep::Dataset(dataset("v2")),
        ScriptedStep::NotModified,
    ]));
    let fetched = fetcher.fetched();

    let engine = Engine::builder(scheduled_config(&path), MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();

    fetched.notified().await;
    fetched.notified().await;

    let seen = fetcher.last_modified_seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], None);
    assert!(seen[1].is_some());

    // A file that was not modified leaves the current generation in place.
    wait_until("the download is serving", || engine.reloads_completed() == 1).await;
    assert_eq!(engine.generation(), Some(2));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn updater_survives_panicking_fetches_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let fetcher = Arc::new(ScriptedFetcher::new([
        ScriptedStep::Panic,
        ScriptedStep::Dataset(dataset("v2")),
    ]));

    let engine = Engine::builder(scheduled_config(&path), MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();

    wait_until("the download after the panic is serving", || {
        engine.reloads_completed() == 1
    })
    .await;
    assert_eq!(fetcher.calls(), 2);

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_are_logged_once_test() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let fetcher = Arc::new(ScriptedFetcher::new([
        ScriptedStep::Fail,
        ScriptedStep::Fail,
        ScriptedStep::Fail,
        ScriptedStep::Dataset(dataset("v2")),
    ]));

    let logs = CapturedLogs::default();
    let engine = Engine::builder(scheduled_config(&path), MockLoader::new())
        .fetcher(fetcher.clone())
        .log_dispatch(logs.dispatch())
        .start()
        .await
        .unwrap();

    wait_until("the download after the retries is serving", || {
        engine.reloads_completed() == 1
    })
    .await;
    engine.stop().await.unwrap();

    assert_eq!(fetcher.calls(), 4);
    assert_eq!(logs.count("will retry on the next cycle"), 3);
    assert_eq!(logs.count("failed too many times in a row"), 1);
    assert_eq!(logs.count("consecutive_failures=3 max_retries=3"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_does_not_wait_for_a_stalled_fetch_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let fetcher = Arc::new(ScriptedFetcher::new([ScriptedStep::Stall]));
    let fetched = fetcher.fetched();

    let mut config = scheduled_config(&path);
    config.update.fetch_timeout_secs = 600;
    let engine = Engine::builder(config, MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();

    fetched.notified().await;

    let started = Instant::now();
    engine.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(engine.reloads_completed(), 0);
}
