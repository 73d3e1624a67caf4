//! Named, read-only identifier lists loaded once per run
//!
//! A dataset file holds one identifier per line. Lines are trimmed and blank
//! lines are skipped. The loaded items are shared by every VU through an
//! `Arc<[String]>`; nothing writes to them after loading.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{StrainError, StrainResult};

/// Where a dataset is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub path: PathBuf,
    /// A missing optional file yields an empty dataset instead of an error.
    #[serde(default)]
    pub optional: bool,
}

/// Immutable sequence of identifiers.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: Arc<str>,
    items: Arc<[String]>,
}

impl Dataset {
    /// Builds a dataset from raw text lines.
    pub fn from_lines<I, S>(name: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<String> = lines
            .into_iter()
            .filter_map(|line| {
                let line = line.as_ref().trim();
                (!line.is_empty()).then(|| line.to_string())
            })
            .collect();
        Self {
            name: Arc::from(name),
            items: items.into(),
        }
    }

    /// An empty dataset.
    pub fn empty(name: &str) -> Self {
        Self::from_lines(name, std::iter::empty::<&str>())
    }

    /// Reads a dataset file.
    pub fn load(name: &str, path: &Path) -> StrainResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| StrainError::Dataset {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        let dataset = Self::from_lines(name, text.lines());
        info!(dataset = name, items = dataset.len(), path = %path.display(), "Loaded dataset");
        Ok(dataset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(String::as_str)
    }

    /// Uniformly random item, `None` for an empty dataset.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        self.get(rng.gen_range(0..self.items.len()))
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }
}

/// All datasets of a run, keyed by name. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Datasets {
    inner: Arc<HashMap<String, Dataset>>,
}

impl Datasets {
    pub fn new(datasets: impl IntoIterator<Item = Dataset>) -> Self {
        let inner = datasets
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Loads every configured dataset. Fails on the first required file that
    /// cannot be read.
    pub fn load_all(configs: &BTreeMap<String, DatasetConfig>) -> StrainResult<Self> {
        let mut loaded = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            match Dataset::load(name, &config.path) {
                Ok(dataset) => loaded.push(dataset),
                Err(StrainError::Dataset { source, .. })
                    if config.optional && source.kind() == std::io::ErrorKind::NotFound =>
                {
                    warn!(
                        dataset = %name,
                        path = %config.path.display(),
                        "Optional dataset file not found, using an empty dataset"
                    );
                    loaded.push(Dataset::empty(name));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Self::new(loaded))
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.inner.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Random item of the named dataset.
    pub fn sample<R: Rng + ?Sized>(&self, name: &str, rng: &mut R) -> Option<&str> {
        self.get(name).and_then(|d| d.sample(rng))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }
}
