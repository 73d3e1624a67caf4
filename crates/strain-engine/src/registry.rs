//! Weighted action registry
//!
//! Selection uses an ordered list of cumulative weights and a binary search.
//! The table VUs select from is immutable and published through a `watch`
//! channel, so a reweight never changes a table in the middle of a selection:
//! VUs pick up the new table at the start of their next iteration.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use strain_core::{StrainError, StrainResult};
use tokio::sync::watch;

use crate::probe::Probe;

/// A named, weighted probe.
#[derive(Clone)]
pub struct Action {
    pub name: Arc<str>,
    pub weight: f64,
    pub probe: Arc<dyn Probe>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Immutable selection table.
#[derive(Debug, Clone, Default)]
pub struct SelectionTable {
    actions: Vec<Action>,
    /// `cumulative[i]` is the sum of weights `0..=i`.
    cumulative: Vec<f64>,
}

impl SelectionTable {
    fn build(actions: Vec<Action>) -> Self {
        let cumulative = actions
            .iter()
            .scan(0.0, |sum, action| {
                *sum += action.weight;
                Some(*sum)
            })
            .collect();
        Self {
            actions,
            cumulative,
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Draws uniformly in `[0, total)` and selects the matching action.
    pub fn select_weighted<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Action> {
        let total = self.total_weight();
        if self.actions.is_empty() || total <= 0.0 {
            return None;
        }
        self.select_at(rng.gen_range(0.0..total))
    }

    /// Action owning `draw`. A draw exactly on a boundary belongs to the
    /// lower-indexed action.
    pub fn select_at(&self, draw: f64) -> Option<&Action> {
        if self.actions.is_empty() {
            return None;
        }
        let index = self.cumulative.partition_point(|&c| c < draw);
        self.actions.get(index.min(self.actions.len() - 1))
    }
}

/// Named, weighted probes for one scenario.
pub struct ActionRegistry {
    entries: Mutex<Vec<Action>>,
    table: watch::Sender<Arc<SelectionTable>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let (table, _) = watch::channel(Arc::new(SelectionTable::default()));
        Self {
            entries: Mutex::new(Vec::new()),
            table,
        }
    }

    /// Adds an action. Names must be unique, weights positive and finite.
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        weight: f64,
        probe: Arc<dyn Probe>,
    ) -> StrainResult<()> {
        let name = name.into();
        check_weight(&name, weight)?;

        let mut entries = self.entries.lock();
        if entries.iter().any(|a| a.name == name) {
            return Err(StrainError::configuration(format!(
                "action `{name}` is registered twice"
            )));
        }
        entries.push(Action {
            name,
            weight,
            probe,
        });
        self.publish(&entries);
        Ok(())
    }

    /// Changes the weight of one action.
    pub fn reweight(&self, name: &str, weight: f64) -> StrainResult<()> {
        let mut weights = BTreeMap::new();
        weights.insert(name.to_string(), weight);
        self.apply_weights(&weights)
    }

    /// Changes several weights at once. All-or-nothing: on error no weight changes.
    pub fn apply_weights(&self, weights: &BTreeMap<String, f64>) -> StrainResult<()> {
        let mut entries = self.entries.lock();
        for (name, weight) in weights {
            check_weight(name, *weight)?;
            if !entries.iter().any(|a| &*a.name == name.as_str()) {
                return Err(StrainError::configuration(format!(
                    "cannot reweight unknown action `{name}`"
                )));
            }
        }

        for action in entries.iter_mut() {
            if let Some(weight) = weights.get(&*action.name) {
                action.weight = *weight;
            }
        }
        self.publish(&entries);
        Ok(())
    }

    /// Receiver that always holds the latest table.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SelectionTable>> {
        self.table.subscribe()
    }

    pub fn current(&self) -> Arc<SelectionTable> {
        Arc::clone(&self.table.borrow())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> HashSet<String> {
        self.entries.lock().iter().map(|a| a.name.to_string()).collect()
    }

    fn publish(&self, entries: &[Action]) {
        self.table
            .send_replace(Arc::new(SelectionTable::build(entries.to_vec())));
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_weight(name: &str, weight: f64) -> StrainResult<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(StrainError::configuration(format!(
            "action `{name}` has invalid weight {weight} (must be > 0 and finite)"
        )));
    }
    Ok(())
}
