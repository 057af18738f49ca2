use std::collections::HashMap;
use std::collections::hash_map;

use serde::Serialize;

use crate::native::MAX_RAW_WEIGHT;

/// A property value paired with the confidence the data file assigns to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedValue {
    pub value: String,
    /// Confidence in `[0, 1]`.
    pub weight: f64,
}

impl WeightedValue {
    pub fn new(value: impl Into<String>, weight: f64) -> Self {
        Self {
            value: value.into(),
            weight: weight.clamp(0.0, 1.0),
        }
    }

    /// Builds a value from the native 16 bit weighting.
    pub fn from_raw(value: impl Into<String>, raw_weight: u16) -> Self {
        Self {
            value: value.into(),
            weight: normalize_weight(raw_weight),
        }
    }
}

/// Maps a native weighting onto `[0, 1]`.
pub fn normalize_weight(raw_weight: u16) -> f64 {
    f64::from(raw_weight) / f64::from(MAX_RAW_WEIGHT)
}

/// Values returned by one lookup, keyed by property name.
///
/// Each property holds its candidate values in the order the native layer returned them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Values(HashMap<String, Vec<WeightedValue>>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, property: &str) -> Option<&[WeightedValue]> {
        self.0.get(property).map(Vec::as_slice)
    }

    /// Returns the first value of `property` and its weight.
    pub fn get_value_weight(&self, property: &str) -> Option<(&str, f64)> {
        self.0
            .get(property)
            .and_then(|values| values.first())
            .map(|value| (value.value.as_str(), value.weight))
    }

    pub fn append(&mut self, property: impl Into<String>, value: impl Into<String>, weight: f64) {
        self.0
            .entry(property.into())
            .or_default()
            .push(WeightedValue::new(value, weight));
    }

    /// Registers `property` with no values, keeping existing values untouched.
    pub fn init_property(&mut self, property: impl Into<String>) {
        self.0.entry(property.into()).or_default();
    }

    pub fn contains(&self, property: &str) -> bool {
        self.0.contains_key(property)
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, Vec<WeightedValue>> {
        self.0.iter()
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl IntoIterator for Values {
    type Item = (String, Vec<WeightedValue>);
    type IntoIter = hash_map::IntoIter<String, Vec<WeightedValue>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = (&'a String, &'a Vec<WeightedValue>);
    type IntoIter = hash_map::Iter<'a, String, Vec<WeightedValue>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
