//! Labeled 0-D measurement containers.
//!
//! A viewer acquisition returns one [`ScalarGroup`] per channel group. Each
//! group carries parallel `labels` and `data`, where every entry of `data`
//! is a single-element array holding one scalar reading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dimensionality of a data bundle as understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataDim {
    /// One scalar per label.
    #[default]
    Data0D,
}

/// Named bundle of labeled scalar readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarGroup {
    /// Group name (e.g. `channel00`)
    pub name: String,

    /// One label per data entry (channel names)
    pub labels: Vec<String>,

    /// One single-element array per label
    pub data: Vec<Vec<f64>>,

    /// Dimensionality, always `Data0D` for scalar groups
    pub dim: DataDim,

    /// Acquisition time
    pub timestamp: DateTime<Utc>,
}

impl ScalarGroup {
    /// Start an empty group stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
            data: Vec::new(),
            dim: DataDim::Data0D,
            timestamp: Utc::now(),
        }
    }

    /// Append one scalar reading under `label`.
    pub fn push(&mut self, label: impl Into<String>, value: f64) {
        self.labels.push(label.into());
        self.data.push(vec![value]);
    }

    /// Zero-valued preview with the given labels.
    ///
    /// Hosts use it to size their display when a channel selection changes.
    pub fn placeholder<S: AsRef<str>>(name: impl Into<String>, labels: &[S]) -> Self {
        let mut group = Self::new(name);
        for label in labels {
            group.push(label.as_ref(), 0.0);
        }
        group
    }

    /// Reading for `label`, if present.
    pub fn value(&self, label: &str) -> Option<f64> {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| self.data.get(i))
            .and_then(|arr| arr.first().copied())
    }

    /// Number of labeled readings.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the group holds no readings.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_labels_and_data_parallel() {
        let mut group = ScalarGroup::new("channel00");
        group.push("x", 1.5e-3);
        group.push("phase", 42.0);

        assert_eq!(group.len(), 2);
        assert_eq!(group.data, vec![vec![1.5e-3], vec![42.0]]);
        assert_eq!(group.value("phase"), Some(42.0));
        assert_eq!(group.value("mag"), None);
    }

    #[test]
    fn placeholder_is_zero_filled() {
        let group = ScalarGroup::placeholder("channel01", &["x", "y"]);
        assert_eq!(group.dim, DataDim::Data0D);
        assert_eq!(group.labels, vec!["x", "y"]);
        assert!(group.data.iter().all(|d| d == &vec![0.0]));
    }
}
