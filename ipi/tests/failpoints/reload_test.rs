use std::sync::Arc;

use ipi::engine::Engine;
use ipi::error::ErrorKind;
use ipi::failpoints::RELOAD_BEFORE_INIT;
use ipi::temp::TempStore;
use ipi::test_utils::failpoints::FailPointScenario;
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::{offline_config, wait_until, write_dataset};
use ipi::workers::reload::{ReloadEvent, ReloadOrigin, ReloadPipeline};
use ipi_telemetry::tracing::init_test_tracing;

const KEY: &str = "192.0.2.44";

fn dataset(tag: &str) -> MockDataset {
    MockDataset::new(tag)
        .with_properties(["Country"])
        .with_tagged_record(KEY)
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_panic_keeps_serving_previous_data_test() {
    init_test_tracing();
    let scenario = FailPointScenario::setup(&[(RELOAD_BEFORE_INIT, "1*panic")]);

    let dir = tempfile::tempdir().unwrap();
    let temp_dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));

    let mut config = offline_config(&path);
    config.temp_copy.directory = Some(temp_dir.path().to_path_buf());
    let loader = MockLoader::new();
    let stats = loader.stats();
    let engine = Engine::start(config, loader).await.unwrap();

    dataset("v2").write_to(&path).unwrap();
    // The first event hits the panic, the second one reloads.
    engine.reload_now().await.unwrap();
    engine.reload_now().await.unwrap();
    wait_until("the second reload completes", || engine.reloads_completed() == 1).await;

    assert_eq!(stats.reloads(), 1);
    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.get_value_weight("Country"), Some(("v2:Country", 1.0)));

    engine.stop().await.unwrap();
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    assert_eq!(stats.handles_released(), 2);
    assert_eq!(stats.double_releases(), 0);

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn injected_reload_error_is_returned_test() {
    init_test_tracing();
    let scenario = FailPointScenario::setup(&[(RELOAD_BEFORE_INIT, "1*return")]);

    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &dataset("v1"));
    let mut config = offline_config(&path);
    config.temp_copy.enabled = false;

    let temp = TempStore::prepare(&config.temp_copy).unwrap();
    let pipeline = ReloadPipeline::new(Arc::new(MockLoader::new()), &config, temp);
    pipeline.load_initial().await.unwrap();

    let event = ReloadEvent::new(path.clone(), ReloadOrigin::Manual);
    let err = pipeline.reload(&event).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailpointInjected);
    assert_eq!(pipeline.current().unwrap().number(), 1);

    pipeline.reload(&event).await.unwrap();
    assert_eq!(pipeline.current().unwrap().number(), 2);

    assert!(pipeline.shutdown().await);
    scenario.teardown();
}
