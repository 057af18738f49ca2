use std::sync::Arc;
use std::time::Duration;

use ipi::engine::Engine;
use ipi::test_utils::mock::{MockDataset, MockLoader};
use ipi::test_utils::{offline_config, wait_until, within_timeout, write_dataset};
use ipi_telemetry::tracing::init_test_tracing;

const KEY: &str = "192.0.2.1";
const PROPERTIES: [&str; 3] = ["Country", "City", "Latitude"];

fn version(number: u32) -> MockDataset {
    MockDataset::new(format!("v{number}"))
        .with_index_offset(number * 10)
        .with_properties(PROPERTIES)
        .with_tagged_record(KEY)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_mix_generations_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &version(1));

    let mut config = offline_config(&path);
    config.pool_size = Some(4);
    let loader = MockLoader::new();
    let stats = loader.stats();
    stats.set_query_delay(Duration::from_millis(1));
    let engine = Arc::new(Engine::start(config, loader).await.unwrap());

    let mut callers = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        callers.push(tokio::spawn(async move {
            for _ in 0..40 {
                let values = engine.process(KEY).await.unwrap();
                assert_eq!(values.len(), PROPERTIES.len());

                let tags: Vec<&str> = values
                    .iter()
                    .map(|(_, values)| values[0].value.split(':').next().unwrap())
                    .collect();
                assert!(
                    tags.iter().all(|tag| *tag == tags[0]),
                    "one lookup mixed data files: {tags:?}"
                );
            }
        }));
    }

    for number in 2..=5 {
        version(number).write_to(&path).unwrap();
        engine.reload_now().await.unwrap();
        let expected = u64::from(number - 1);
        wait_until("the reload completes", || {
            engine.reloads_completed() == expected
        })
        .await;
    }

    for caller in callers {
        within_timeout(caller).await.unwrap();
    }

    assert_eq!(engine.generation(), Some(5));
    engine.stop().await.unwrap();
    assert_eq!(stats.handles_released(), 5);
    assert_eq!(stats.double_releases(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_of_four_serves_ten_callers_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &version(1));

    let mut config = offline_config(&path);
    config.pool_size = Some(4);
    let loader = MockLoader::new();
    loader.stats().set_query_delay(Duration::from_millis(20));
    let engine = Arc::new(Engine::start(config, loader).await.unwrap());
    assert_eq!(engine.pool_size(), 4);

    let callers: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process(KEY).await })
        })
        .collect();

    for caller in callers {
        let values = within_timeout(caller).await.unwrap().unwrap();
        assert_eq!(values.get_value_weight("Country"), Some(("v1:Country", 1.0)));
    }

    let counts = engine.pool_counts();
    assert_eq!((counts.borrowed, counts.resting, counts.size), (0, 4, 4));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_property_list_filters_results_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &version(3));

    let mut config = offline_config(&path);
    config.properties = vec!["Latitude".to_string(), "Country".to_string()];
    let loader = MockLoader::new();
    let stats = loader.stats();
    let engine = Engine::start(config.clone(), loader).await.unwrap();

    assert_eq!(stats.last_required(), Some(Some(config.properties.clone())));

    let cache = engine.properties().unwrap();
    for name in &config.properties {
        let index = cache.index_of(name).unwrap();
        assert_eq!(cache.name_of(index), Some(name.as_str()));
    }
    assert_eq!(cache.query_indices(), &[32, 30]);

    let values = engine.process(KEY).await.unwrap();
    assert_eq!(values.len(), 2);
    assert!(values.contains("Latitude"));
    assert!(!values.contains("City"));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn all_properties_mode_returns_every_property_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_dataset(dir.path(), "data.ipi", &version(1));

    let loader = MockLoader::new();
    let stats = loader.stats();
    let engine = Engine::start(offline_config(&path), loader).await.unwrap();

    assert_eq!(stats.last_required(), Some(None));
    let cache = engine.properties().unwrap();
    assert_eq!(cache.len(), PROPERTIES.len());
    assert!(cache.query_indices().is_empty());

    let values = engine.process(KEY).await.unwrap();
    let mut properties: Vec<&str> = values.properties().collect();
    properties.sort_unstable();
    assert_eq!(properties, vec!["City", "Country", "Latitude"]);

    engine.stop().await.unwrap();
}
