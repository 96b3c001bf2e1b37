//! Completion progress per (provider, model, survey).
//!
//! The ledger at `<output>/progress.csv` is a cache: [`ProgressTracker::reconstruct`]
//! rebuilds it from the row counts of the output tables at any time, and
//! [`ProgressTracker::update`] advances it after each persisted completion.
//! A run always starts from a reconstruction, so completions appended by a
//! process that died before updating the ledger are still counted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::ModelEntry;
use crate::store::{count_rows, table_mtime, DataKind, OutputLayout, StoreError};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("progress ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write progress ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "{provider}/{model}: requested {requested} completions per survey but {}",
        describe_shortfalls(.shortfalls)
    )]
    CapacityExceeded {
        provider: String,
        model: String,
        requested: u32,
        shortfalls: Vec<Shortfall>,
    },
}

/// A survey that cannot absorb the requested number of completions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub survey: String,
    pub completions_left: i64,
}

fn describe_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(|s| format!("{} has {} left", s.survey, s.completions_left))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ledger totals, plus which models and APIs have produced anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerReport {
    pub entries: usize,
    pub done: usize,
    pub completions: u64,
    /// `provider/model` with at least one completion.
    pub models_with_data: Vec<String>,
    /// `provider/model` whose every survey reached the target.
    pub models_done: Vec<String>,
    pub apis_without_data: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgressKey {
    pub provider: String,
    pub model: String,
    pub survey: String,
}

impl ProgressKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, survey: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            survey: survey.into(),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub provider: String,
    pub model: String,
    pub api: String,
    pub survey: String,
    pub completions: u32,
    pub min_iterations: u32,
    pub completions_left: i64,
    pub done: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProgressEntry {
    fn new(key: &ProgressKey, api: &str, completions: u32, min_iterations: u32) -> Self {
        let mut entry = Self {
            provider: key.provider.clone(),
            model: key.model.clone(),
            api: api.to_string(),
            survey: key.survey.clone(),
            completions,
            min_iterations,
            completions_left: 0,
            done: false,
            last_updated: None,
        };
        entry.recompute();
        entry
    }

    fn recompute(&mut self) {
        self.completions_left = i64::from(self.min_iterations) - i64::from(self.completions);
        self.done = self.completions_left <= 0;
    }

    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(&self.provider, &self.model, &self.survey)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    path: PathBuf,
    min_iterations: u32,
    entries: BTreeMap<ProgressKey, ProgressEntry>,
}

impl ProgressTracker {
    /// Empty tracker persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, min_iterations: u32) -> Self {
        Self {
            path: path.into(),
            min_iterations,
            entries: BTreeMap::new(),
        }
    }

    /// Rebuild the ledger from the output tables and overwrite it.
    ///
    /// Each entry's `last_updated` is its policies table's modification time,
    /// so repeated reconstruction over unchanged tables yields the same ledger.
    pub fn reconstruct(
        layout: &OutputLayout,
        models: &[ModelEntry],
        surveys: &[String],
        min_iterations: u32,
    ) -> Result<Self, ProgressError> {
        let mut tracker = Self::new(layout.progress_path(), min_iterations);
        for model in models {
            for survey in surveys {
                let key = ProgressKey::new(&model.provider, &model.model, survey);
                let table = layout.table_path(&key.provider, &key.model, &key.survey, DataKind::Policies);
                let rows = count_rows(&table)?;
                let mut entry = ProgressEntry::new(&key, &model.api, rows, min_iterations);
                entry.last_updated = table_mtime(&table)?;
                debug!(provider = %key.provider, model = %key.model, survey = %key.survey, rows, "reconstructed");
                tracker.entries.insert(key, entry);
            }
        }
        tracker.save()?;
        info!(
            entries = tracker.entries.len(),
            path = %tracker.path.display(),
            "progress ledger rebuilt"
        );
        Ok(tracker)
    }

    /// Read an existing ledger.
    pub fn load(path: impl Into<PathBuf>, min_iterations: u32) -> Result<Self, ProgressError> {
        let path = path.into();
        let ledger_err = |source| ProgressError::Ledger {
            path: path.clone(),
            source,
        };
        let mut reader = csv::Reader::from_path(&path).map_err(ledger_err)?;
        let mut entries = BTreeMap::new();
        for row in reader.deserialize::<ProgressEntry>() {
            let entry = row.map_err(ledger_err)?;
            entries.insert(entry.key(), entry);
        }
        Ok(Self {
            path,
            min_iterations,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_iterations(&self) -> u32 {
        self.min_iterations
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProgressEntry> {
        self.entries.values()
    }

    pub fn get(&self, key: &ProgressKey) -> Option<&ProgressEntry> {
        self.entries.get(key)
    }

    /// Aggregate view of the ledger for operator output.
    pub fn report(&self) -> LedgerReport {
        let mut models: BTreeMap<(String, String), (bool, bool)> = BTreeMap::new();
        let mut apis: BTreeMap<String, bool> = BTreeMap::new();
        let mut report = LedgerReport::default();

        for e in self.entries.values() {
            report.entries += 1;
            report.done += usize::from(e.done);
            report.completions += u64::from(e.completions);

            let (has_data, all_done) = models
                .entry((e.provider.clone(), e.model.clone()))
                .or_insert((false, true));
            *has_data |= e.completions > 0;
            *all_done &= e.done;

            if !e.api.is_empty() {
                *apis.entry(e.api.clone()).or_insert(false) |= e.completions > 0;
            }
        }

        for ((provider, model), (has_data, all_done)) in models {
            let name = format!("{provider}/{model}");
            if has_data {
                report.models_with_data.push(name.clone());
            }
            if all_done {
                report.models_done.push(name);
            }
        }
        report.apis_without_data = apis
            .into_iter()
            .filter(|(_, has_data)| !has_data)
            .map(|(api, _)| api)
            .collect();
        report
    }

    /// Entries that have not reached their target.
    pub fn pending(&self) -> impl Iterator<Item = &ProgressEntry> {
        self.entries.values().filter(|e| !e.done)
    }

    /// Record one persisted completion and write the ledger.
    pub fn update(&mut self, provider: &str, model: &str, survey: &str) -> Result<&ProgressEntry, ProgressError> {
        let key = ProgressKey::new(provider, model, survey);
        let now = Utc::now();
        let min_iterations = self.min_iterations;
        let entry = self
            .entries
            .entry(key.clone())
            .and_modify(|e| {
                e.completions = e.completions.saturating_add(1);
                e.recompute();
            })
            .or_insert_with(|| ProgressEntry::new(&key, "", 1, min_iterations));
        entry.last_updated = Some(now);

        self.save()?;
        // Present: inserted or modified above.
        Ok(&self.entries[&key])
    }

    /// Fail if any of `surveys` has fewer than `requested` completions left.
    pub fn check_capacity(
        &self,
        provider: &str,
        model: &str,
        surveys: &[String],
        requested: u32,
    ) -> Result<(), ProgressError> {
        let shortfalls: Vec<Shortfall> = surveys
            .iter()
            .filter_map(|survey| {
                let key = ProgressKey::new(provider, model, survey);
                let left = self
                    .entries
                    .get(&key)
                    .map(|e| e.completions_left)
                    .unwrap_or_else(|| i64::from(self.min_iterations));
                (left < i64::from(requested)).then(|| Shortfall {
                    survey: survey.clone(),
                    completions_left: left,
                })
            })
            .collect();

        if shortfalls.is_empty() {
            return Ok(());
        }
        Err(ProgressError::CapacityExceeded {
            provider: provider.to_string(),
            model: model.to_string(),
            requested,
            shortfalls,
        })
    }

    /// Write the ledger atomically (temp file, then rename).
    pub fn save(&self) -> Result<(), ProgressError> {
        let io_err = |path: &Path, source| ProgressError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(|source| ProgressError::Ledger {
                path: tmp.clone(),
                source,
            })?;
            for entry in self.entries.values() {
                writer.serialize(entry).map_err(|source| ProgressError::Ledger {
                    path: tmp.clone(),
                    source,
                })?;
            }
            writer.flush().map_err(|e| io_err(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn update_creates_missing_entry() {
        let dir = tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path().join("progress.csv"), 3);
        let entry = tracker.update("openai", "gpt-4o", "acp").unwrap();
        assert_eq!(entry.completions, 1);
        assert_eq!(entry.completions_left, 2);
        assert!(!entry.done);
        assert!(entry.last_updated.is_some());
        assert!(tracker.path().exists());
    }

    #[test]
    fn done_when_target_reached_and_past_it() {
        let dir = tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path().join("progress.csv"), 2);
        tracker.update("p", "m", "s").unwrap();
        let entry = tracker.update("p", "m", "s").unwrap();
        assert_eq!(entry.completions_left, 0);
        assert!(entry.done);
        let entry = tracker.update("p", "m", "s").unwrap();
        assert_eq!(entry.completions_left, -1);
        assert!(entry.done);
    }

    #[test]
    fn capacity_uses_full_target_for_unknown_surveys() {
        let tracker = ProgressTracker::new("unused.csv", 5);
        let surveys = vec!["a".to_string()];
        assert!(tracker.check_capacity("p", "m", &surveys, 5).is_ok());
        assert!(tracker.check_capacity("p", "m", &surveys, 6).is_err());
    }

    #[test]
    fn capacity_lists_every_offender() {
        let dir = tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path().join("progress.csv"), 3);
        tracker.update("p", "m", "a").unwrap();
        tracker.update("p", "m", "b").unwrap();
        tracker.update("p", "m", "b").unwrap();

        let surveys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = tracker.check_capacity("p", "m", &surveys, 2).unwrap_err();
        match err {
            ProgressError::CapacityExceeded { shortfalls, .. } => {
                assert_eq!(
                    shortfalls,
                    vec![Shortfall {
                        survey: "b".into(),
                        completions_left: 1
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = tracker.check_capacity("p", "m", &surveys, 3).unwrap_err();
        assert!(err.to_string().contains("a has 2 left, b has 1 left"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let mut tracker = ProgressTracker::new(&path, 4);
        tracker.update("xai", "grok-3-mini-r=low", "acp").unwrap();
        tracker.update("openai", "gpt-4o", "bio").unwrap();

        let loaded = ProgressTracker::load(&path, 4).unwrap();
        let a: Vec<_> = tracker.entries().cloned().collect();
        let b: Vec<_> = loaded.entries().cloned().collect();
        assert_eq!(a, b);
        assert!(!dir.path().join("progress.csv.tmp").exists());
    }

    #[test]
    fn pending_excludes_done() {
        let dir = tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path().join("progress.csv"), 1);
        tracker.update("p", "m", "a").unwrap();
        let mut other = ProgressTracker::new(dir.path().join("other.csv"), 2);
        other.update("p", "m", "b").unwrap();
        assert_eq!(tracker.pending().count(), 0);
        assert_eq!(other.pending().count(), 1);
    }

    #[test]
    fn report_groups_by_model_and_api() {
        let dir = tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path().join("progress.csv"), 1);
        for (provider, model, api, survey) in [
            ("openai", "gpt-4o", "openai", "a"),
            ("openai", "gpt-4o", "openai", "b"),
            ("xai", "grok-3", "xai", "a"),
            ("meta", "llama3.1", "ollama", "a"),
        ] {
            let key = ProgressKey::new(provider, model, survey);
            let entry = ProgressEntry::new(&key, api, 0, 1);
            tracker.entries.insert(key, entry);
        }
        tracker.update("openai", "gpt-4o", "a").unwrap();
        tracker.update("openai", "gpt-4o", "b").unwrap();
        tracker.update("xai", "grok-3", "a").unwrap();
        tracker.update("xai", "grok-3", "a").unwrap();

        let report = tracker.report();
        assert_eq!((report.entries, report.done, report.completions), (4, 3, 4));
        assert_eq!(report.models_with_data, vec!["openai/gpt-4o", "xai/grok-3"]);
        assert_eq!(report.models_done, vec!["openai/gpt-4o", "xai/grok-3"]);
        assert_eq!(report.apis_without_data, vec!["ollama"]);
    }
}
