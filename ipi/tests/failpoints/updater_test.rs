use std::sync::Arc;

use ipi::engine::Engine;
use ipi::failpoints::UPDATER_BEFORE_FETCH;
use ipi::test_utils::failpoints::FailPointScenario;
use ipi::test_utils::fetcher::{ScriptedFetcher, ScriptedStep};
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::{offline_config, wait_until, write_dataset};
use ipi_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn updater_loop_survives_panicking_cycles_test() {
    init_test_tracing();
    let scenario = FailPointScenario::setup(&[(UPDATER_BEFORE_FETCH, "2*panic")]);

    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &MockDataset::new("v1"));

    let mut config = offline_config(&path);
    config.update.enabled = true;
    config.update.url = Some("https://updates.example.com/data".to_string());
    config.update.polling_interval_secs = 1;
    config.update.randomization_secs = 0;

    let fetcher = Arc::new(ScriptedFetcher::new([ScriptedStep::Dataset(
        MockDataset::new("v2"),
    )]));
    let engine = Engine::builder(config, MockLoader::new())
        .fetcher(fetcher.clone())
        .start()
        .await
        .unwrap();

    wait_until("the third cycle's download is serving", || {
        engine.reloads_completed() == 1
    })
    .await;
    assert_eq!(fetcher.calls(), 1);

    engine.stop().await.unwrap();
    scenario.teardown();
}
