use std::collections::HashMap;

use tracing::warn;

use crate::native::{PropertyIndex, ResourceHandle};

/// Bidirectional property name/index lookup built once per loaded data file.
///
/// The cache is immutable and travels with the handle it was built from, so indices never leak
/// across a reload.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndexCache {
    by_name: HashMap<String, PropertyIndex>,
    by_index: HashMap<PropertyIndex, String>,
    names: Vec<String>,
    query_indices: Vec<PropertyIndex>,
}

impl PropertyIndexCache {
    /// Resolves `requested` against `handle`.
    ///
    /// With an empty `requested` list every property of the data file is cached and
    /// [`PropertyIndexCache::query_indices`] stays empty, which asks the native layer for all
    /// properties. Requested names the data file does not define are skipped.
    pub fn build<H: ResourceHandle>(handle: &H, requested: &[String]) -> Self {
        if requested.is_empty() {
            let mut cache = Self::default();
            for name in handle.property_names() {
                if let Some(index) = handle.property_index(&name) {
                    cache.insert(name, index);
                }
            }
            return cache;
        }

        let mut cache = Self::default();
        for name in requested {
            if cache.by_name.contains_key(name) {
                continue;
            }

            match handle.property_index(name) {
                Some(index) => {
                    cache.insert(name.clone(), index);
                    cache.query_indices.push(index);
                }
                None => {
                    warn!(property = %name, "property is not defined by the data file, skipping");
                }
            }
        }

        cache
    }

    fn insert(&mut self, name: String, index: PropertyIndex) {
        self.by_name.insert(name.clone(), index);
        self.by_index.insert(index, name.clone());
        self.names.push(name);
    }

    /// Returns the index of `name`, or `None` when the property is unknown.
    pub fn index_of(&self, name: &str) -> Option<PropertyIndex> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, index: PropertyIndex) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    /// Indices passed to queries, in the configured order. Empty in all-properties mode.
    pub fn query_indices(&self) -> &[PropertyIndex] {
        &self.query_indices
    }

    /// Cached property names, in resolution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
