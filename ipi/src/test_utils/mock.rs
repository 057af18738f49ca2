//! In-memory native layer backed by JSON data files.
//!
//! A [`MockDataset`] written with [`MockDataset::write_to`] can be loaded by [`MockLoader`] like a
//! real data file. Every native call is counted in a shared [`MockStats`], which lets tests assert
//! on releases and reloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::native::{
    LoadSettings, NativeError, NativeResult, PropertyIndex, QueryResults, RawValue,
    ResourceHandle, ResourceLoader,
};

/// Key whose lookup always fails.
pub const FAILING_KEY: &str = "fail";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockValue {
    pub property: String,
    pub value: String,
    pub raw_weight: u16,
}

/// Contents of a mock data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDataset {
    pub tag: String,
    pub published: NaiveDate,
    pub properties: Vec<String>,
    pub index_offset: PropertyIndex,
    pub records: HashMap<String, Vec<MockValue>>,
}

impl MockDataset {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            published: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            properties: Vec::new(),
            index_offset: 0,
            records: HashMap::new(),
        }
    }

    pub fn with_published(mut self, published: NaiveDate) -> Self {
        self.published = published;
        self
    }

    /// Shifts every property index, simulating a data file with a different schema layout.
    pub fn with_index_offset(mut self, index_offset: PropertyIndex) -> Self {
        self.index_offset = index_offset;
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a value for `key`, declaring `property` if needed.
    pub fn with_record(mut self, key: &str, property: &str, value: &str, raw_weight: u16) -> Self {
        if !self.properties.iter().any(|known| known == property) {
            self.properties.push(property.to_string());
        }

        self.records
            .entry(key.to_string())
            .or_default()
            .push(MockValue {
                property: property.to_string(),
                value: value.to_string(),
                raw_weight,
            });
        self
    }

    /// Adds a fully weighted value `{tag}:{property}` for every declared property of `key`.
    pub fn with_tagged_record(mut self, key: &str) -> Self {
        let values = self
            .properties
            .iter()
            .map(|property| MockValue {
                property: property.clone(),
                value: format!("{}:{property}", self.tag),
                raw_weight: u16::MAX,
            })
            .collect();
        self.records.insert(key.to_string(), values);
        self
    }

    /// Writes the dataset to `path`, replacing the file atomically.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let partial = path.with_extension(format!("{}.partial", Uuid::new_v4().simple()));
        std::fs::write(&partial, bytes)?;
        std::fs::rename(&partial, path)
    }

    pub fn read_from(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    fn index_of(&self, name: &str) -> Option<PropertyIndex> {
        self.properties
            .iter()
            .position(|property| property == name)
            .map(|position| self.index_offset + position as PropertyIndex)
    }

    fn name_of(&self, index: PropertyIndex) -> Option<&str> {
        let position = index.checked_sub(self.index_offset)? as usize;
        self.properties.get(position).map(String::as_str)
    }
}

/// Counters shared by every object of one mock native layer.
#[derive(Debug, Default)]
pub struct MockStats {
    inits: AtomicUsize,
    reloads: AtomicUsize,
    queries: AtomicUsize,
    handles_released: AtomicUsize,
    double_releases: AtomicUsize,
    results_released: AtomicUsize,
    fail_next_reload: AtomicBool,
    panic_on_property_listing: AtomicBool,
    query_delay_ms: AtomicU64,
    last_required: Mutex<Option<Option<Vec<String>>>>,
    last_settings: Mutex<Option<LoadSettings>>,
}

impl MockStats {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// Number of handles built by `reload` or `reload_from_original_file`, failed ones included.
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn handles_released(&self) -> usize {
        self.handles_released.load(Ordering::SeqCst)
    }

    /// Releases of an already released handle.
    pub fn double_releases(&self) -> usize {
        self.double_releases.load(Ordering::SeqCst)
    }

    pub fn results_released(&self) -> usize {
        self.results_released.load(Ordering::SeqCst)
    }

    /// Handles created and not yet released.
    pub fn live_handles(&self) -> usize {
        (self.inits() + self.reloads()).saturating_sub(self.handles_released())
    }

    /// Makes the next reload fail as if the data file was corrupt.
    pub fn fail_next_reload(&self) {
        self.fail_next_reload.store(true, Ordering::SeqCst);
    }

    /// Makes every property enumeration panic, as a crashing native layer would.
    pub fn panic_on_property_listing(&self) {
        self.panic_on_property_listing.store(true, Ordering::SeqCst);
    }

    /// Delays every query, keeping generations borrowed for longer.
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Property restriction passed to the last `init`.
    pub fn last_required(&self) -> Option<Option<Vec<String>>> {
        self.last_required.lock().clone()
    }

    pub fn last_settings(&self) -> Option<LoadSettings> {
        self.last_settings.lock().clone()
    }
}

/// Reusable result object of the mock native layer.
#[derive(Debug)]
pub struct MockResults {
    values: Vec<RawValue>,
    stats: Arc<MockStats>,
    released: bool,
}

impl MockResults {
    pub fn new(stats: Arc<MockStats>) -> Self {
        Self {
            values: Vec::new(),
            stats,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl QueryResults for MockResults {
    fn values(&self) -> &[RawValue] {
        &self.values
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.values.clear();
            self.stats.results_released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Handle over one loaded [`MockDataset`].
#[derive(Debug)]
pub struct MockHandle {
    dataset: MockDataset,
    original: PathBuf,
    stats: Arc<MockStats>,
    released: AtomicBool,
}

impl MockHandle {
    /// Builds a handle that was not loaded from a file.
    pub fn from_dataset(dataset: MockDataset) -> Self {
        Self::with_stats(dataset, Arc::new(MockStats::default()))
    }

    pub fn with_stats(dataset: MockDataset, stats: Arc<MockStats>) -> Self {
        Self {
            dataset,
            original: PathBuf::new(),
            stats,
            released: AtomicBool::new(false),
        }
    }

    pub fn tag(&self) -> &str {
        &self.dataset.tag
    }

    pub fn dataset(&self) -> &MockDataset {
        &self.dataset
    }

    fn load(path: &Path, stats: Arc<MockStats>) -> Result<Self, String> {
        let dataset = MockDataset::read_from(path).map_err(|err| err.to_string())?;

        Ok(Self {
            dataset,
            original: path.to_path_buf(),
            stats,
            released: AtomicBool::new(false),
        })
    }
}

impl ResourceHandle for MockHandle {
    type Results = MockResults;

    fn reload(&self, path: &Path) -> NativeResult<Self> {
        self.stats.reloads.fetch_add(1, Ordering::SeqCst);

        let reload_error = |reason: String| NativeError::Reload {
            path: path.to_path_buf(),
            reason,
        };

        if self.stats.fail_next_reload.swap(false, Ordering::SeqCst) {
            return Err(reload_error("injected reload failure".to_string()));
        }

        Self::load(path, self.stats.clone()).map_err(reload_error)
    }

    fn reload_from_original_file(&self) -> NativeResult<Self> {
        self.reload(&self.original)
    }

    fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            self.stats.double_releases.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.handles_released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn query(
        &self,
        results: &mut MockResults,
        key: &str,
        indices: &[PropertyIndex],
    ) -> NativeResult<()> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);

        let delay = self.stats.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        if self.released.load(Ordering::SeqCst) {
            return Err(NativeError::Released);
        }

        if key == FAILING_KEY {
            return Err(NativeError::Query {
                key: key.to_string(),
                reason: "lookup rejected by the data set".to_string(),
            });
        }

        results.values.clear();
        let Some(record) = self.dataset.records.get(key) else {
            return Ok(());
        };

        for value in record {
            let Some(index) = self.dataset.index_of(&value.property) else {
                continue;
            };
            if !indices.is_empty() && !indices.contains(&index) {
                continue;
            }

            results.values.push(RawValue {
                property_index: index,
                value: value.value.clone(),
                raw_weight: value.raw_weight,
            });
        }

        Ok(())
    }

    fn property_index(&self, name: &str) -> Option<PropertyIndex> {
        self.dataset.index_of(name)
    }

    fn property_name(&self, index: PropertyIndex) -> Option<String> {
        self.dataset.name_of(index).map(str::to_string)
    }

    fn property_names(&self) -> Vec<String> {
        if self.stats.panic_on_property_listing.load(Ordering::SeqCst) {
            panic!("native property enumeration crashed");
        }
        self.dataset.properties.clone()
    }

    fn published_date(&self) -> NaiveDate {
        self.dataset.published
    }
}

/// Loader of [`MockDataset`] files.
#[derive(Debug, Clone, Default)]
pub struct MockLoader {
    stats: Arc<MockStats>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

impl ResourceLoader for MockLoader {
    type Results = MockResults;
    type Handle = MockHandle;

    fn init(
        &self,
        path: &Path,
        settings: &LoadSettings,
        required: Option<&[String]>,
    ) -> NativeResult<MockHandle> {
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_required.lock() = Some(required.map(<[String]>::to_vec));
        *self.stats.last_settings.lock() = Some(settings.clone());

        MockHandle::load(path, self.stats.clone()).map_err(|reason| NativeError::Init {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn create_results(&self) -> MockResults {
        MockResults::new(self.stats.clone())
    }
}
