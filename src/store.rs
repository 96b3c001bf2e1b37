//! Append-only output tables.
//!
//! Layout under the output root:
//!
//! ```text
//! <root>/progress.csv
//! <root>/request_log.csv
//! <root>/exec_log.csv
//! <root>/<provider>/<model>/<survey>/{policies,considerations,reasons}.csv
//! ```
//!
//! Every table row starts with [`META_COLUMNS`]. Rows are never rewritten, so the
//! row count of a `policies` table is the number of persisted completions.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::response::TokenUsage;
use crate::survey::{Statement, Survey};

pub const META_COLUMNS: [&str; 7] = [
    "cuid",
    "created_at",
    "provider",
    "model",
    "temperature",
    "input_tokens",
    "output_tokens",
];

pub const REASON_COLUMN: &str = "reason";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("another run holds {0}")]
    Locked(PathBuf),
    #[error("record for `{survey}` has {got} {kind} values, table expects {expected}")]
    Shape {
        survey: String,
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which of the three per-survey tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Policies,
    Considerations,
    Reasons,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [DataKind::Policies, DataKind::Considerations, DataKind::Reasons];

    pub fn file_stem(&self) -> &'static str {
        match self {
            DataKind::Policies => "policies",
            DataKind::Considerations => "considerations",
            DataKind::Reasons => "reasons",
        }
    }
}

// =============================================================================
// Layout
// =============================================================================

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn survey_dir(&self, provider: &str, model: &str, survey: &str) -> PathBuf {
        self.root.join(provider).join(model).join(survey)
    }

    pub fn table_path(&self, provider: &str, model: &str, survey: &str, kind: DataKind) -> PathBuf {
        self.survey_dir(provider, model, survey)
            .join(format!("{}.csv", kind.file_stem()))
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join("progress.csv")
    }

    pub fn request_log_path(&self) -> PathBuf {
        self.root.join("request_log.csv")
    }

    pub fn exec_log_path(&self) -> PathBuf {
        self.root.join("exec_log.csv")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".run.lock")
    }
}

/// Exclusive advisory lock on `<root>/.run.lock`, held for the life of a run.
pub struct RunLock {
    _file: std::fs::File,
}

impl RunLock {
    /// Take the lock or fail immediately if another process holds it.
    pub fn acquire(layout: &OutputLayout) -> Result<Self, StoreError> {
        fs::create_dir_all(layout.root()).map_err(|e| StoreError::io(layout.root(), e))?;
        let path = layout.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.clone()))?;
        Ok(Self { _file: file })
    }
}

// =============================================================================
// Records
// =============================================================================

/// A validated completion in canonical statement order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub usage: TokenUsage,
    pub ratings: Vec<u32>,
    pub ranks: Vec<u32>,
    pub reasoning: String,
}

impl CompletionRecord {
    fn meta_fields(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.provider.clone(),
            self.model.clone(),
            self.temperature.to_string(),
            self.usage.input_tokens.to_string(),
            self.usage.output_tokens.to_string(),
        ]
    }
}

fn statement_columns(statements: &[Statement]) -> Vec<String> {
    statements
        .iter()
        .map(|s| format!("{}{}. {}", s.kind.prefix(), s.index + 1, s.text))
        .collect()
}

/// Header row for one table of `survey`.
pub fn table_header(survey: &Survey, kind: DataKind) -> Vec<String> {
    let mut header: Vec<String> = META_COLUMNS.iter().map(|c| c.to_string()).collect();
    match kind {
        DataKind::Policies => header.extend(statement_columns(survey.policies())),
        DataKind::Considerations => header.extend(statement_columns(survey.considerations())),
        DataKind::Reasons => header.push(REASON_COLUMN.to_string()),
    }
    header
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct OutputStore {
    layout: OutputLayout,
}

impl OutputStore {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Create the survey directory and any missing table with its header.
    pub fn ensure_tables(&self, provider: &str, model: &str, survey: &Survey) -> Result<(), StoreError> {
        let dir = self.layout.survey_dir(provider, model, survey.name());
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        for kind in DataKind::ALL {
            let path = self.layout.table_path(provider, model, survey.name(), kind);
            let header = table_header(survey, kind);
            if path.exists() {
                if read_header(&path)? != header {
                    warn!(path = %path.display(), "existing table header differs from survey; appending anyway");
                }
                continue;
            }
            debug!(path = %path.display(), "creating output table");
            let mut writer = csv::Writer::from_path(&path).map_err(|e| StoreError::csv(&path, e))?;
            writer
                .write_record(&header)
                .map_err(|e| StoreError::csv(&path, e))?;
            writer.flush().map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    /// Append one record to all three tables of `survey`.
    pub fn append(&self, survey: &Survey, record: &CompletionRecord) -> Result<(), StoreError> {
        check_shape(survey, "policy", survey.policies().len(), record.ranks.len())?;
        check_shape(
            survey,
            "consideration",
            survey.considerations().len(),
            record.ratings.len(),
        )?;

        let meta = record.meta_fields();
        let rows = [
            (DataKind::Policies, to_fields(&record.ranks)),
            (DataKind::Considerations, to_fields(&record.ratings)),
            (DataKind::Reasons, vec![record.reasoning.clone()]),
        ];
        for (kind, values) in rows {
            let path = self
                .layout
                .table_path(&record.provider, &record.model, survey.name(), kind);
            let mut row = meta.clone();
            row.extend(values);
            append_row(&path, &row)?;
        }
        Ok(())
    }

    pub fn completed_rows(&self, provider: &str, model: &str, survey: &str) -> Result<u32, StoreError> {
        count_rows(&self.layout.table_path(provider, model, survey, DataKind::Policies))
    }
}

fn check_shape(survey: &Survey, kind: &'static str, expected: usize, got: usize) -> Result<(), StoreError> {
    if expected != got {
        return Err(StoreError::Shape {
            survey: survey.name().to_string(),
            kind,
            expected,
            got,
        });
    }
    Ok(())
}

fn to_fields(values: &[u32]) -> Vec<String> {
    values.iter().map(u32::to_string).collect()
}

fn read_header(path: &Path) -> Result<Vec<String>, StoreError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    let header = reader.headers().map_err(|e| StoreError::csv(path, e))?;
    Ok(header.iter().map(str::to_string).collect())
}

/// Append a single row to an existing CSV table.
pub(crate) fn append_row(path: &Path, row: &[String]) -> Result<(), StoreError> {
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer
        .write_record(row)
        .map_err(|e| StoreError::csv(path, e))?;
    writer.flush().map_err(|e| StoreError::io(path, e))
}

/// Append a row, writing `header` first if the file does not exist yet.
pub(crate) fn append_row_with_header(
    path: &Path,
    header: &[String],
    row: &[String],
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    if !path.exists() {
        let mut writer = csv::Writer::from_path(path).map_err(|e| StoreError::csv(path, e))?;
        writer
            .write_record(header)
            .map_err(|e| StoreError::csv(path, e))?;
        writer.flush().map_err(|e| StoreError::io(path, e))?;
    }
    append_row(path, row)
}

/// Data rows (excluding the header) of a table; 0 if it does not exist.
pub fn count_rows(path: &Path) -> Result<u32, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| StoreError::csv(path, e))?;
    let mut rows = 0u32;
    for record in reader.records() {
        record.map_err(|e| StoreError::csv(path, e))?;
        rows += 1;
    }
    Ok(rows)
}

/// Modification time of a table, `None` if it does not exist.
pub fn table_mtime(path: &Path) -> Result<Option<DateTime<Utc>>, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified: SystemTime = meta.modified().map_err(|e| StoreError::io(path, e))?;
            Ok(Some(DateTime::<Utc>::from(modified)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn survey() -> Survey {
        Survey::new(
            "acp",
            vec!["Ban cars".into(), "Build trams".into()],
            vec!["Air matters".into(), "Cost, too".into(), "Jobs".into()],
            10,
            false,
        )
        .unwrap()
    }

    fn record(provider: &str, model: &str) -> CompletionRecord {
        CompletionRecord {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            temperature: 0.0,
            usage: TokenUsage::new(120, 9),
            ratings: vec![3, 7, 5],
            ranks: vec![2, 1],
            reasoning: "Trams, because \"cheap\".\nSecond line".into(),
        }
    }

    #[test]
    fn headers_prefix_statements() {
        let header = table_header(&survey(), DataKind::Considerations);
        assert_eq!(&header[..7], &META_COLUMNS.map(String::from));
        assert_eq!(header[7], "C1. Air matters");
        assert_eq!(header[8], "C2. Cost, too");
        assert_eq!(table_header(&survey(), DataKind::Reasons)[7], "reason");
    }

    #[test]
    fn append_and_count() {
        let dir = tempdir().unwrap();
        let store = OutputStore::new(OutputLayout::new(dir.path()));
        let s = survey();

        store.ensure_tables("openai", "gpt-4o", &s).unwrap();
        assert_eq!(store.completed_rows("openai", "gpt-4o", "acp").unwrap(), 0);

        store.append(&s, &record("openai", "gpt-4o")).unwrap();
        store.append(&s, &record("openai", "gpt-4o")).unwrap();
        // Idempotent header creation.
        store.ensure_tables("openai", "gpt-4o", &s).unwrap();

        assert_eq!(store.completed_rows("openai", "gpt-4o", "acp").unwrap(), 2);
        let reasons = store
            .layout()
            .table_path("openai", "gpt-4o", "acp", DataKind::Reasons);
        assert_eq!(count_rows(&reasons).unwrap(), 2);

        let mut reader = csv::Reader::from_path(
            store
                .layout()
                .table_path("openai", "gpt-4o", "acp", DataKind::Policies),
        )
        .unwrap();
        let first = reader.records().next().unwrap().unwrap();
        assert_eq!(&first[2], "openai");
        assert_eq!(&first[7], "2");
        assert_eq!(&first[8], "1");
    }

    #[test]
    fn append_rejects_wrong_shape() {
        let dir = tempdir().unwrap();
        let store = OutputStore::new(OutputLayout::new(dir.path()));
        let s = survey();
        store.ensure_tables("p", "m", &s).unwrap();
        let mut bad = record("p", "m");
        bad.ranks.push(3);
        assert!(matches!(store.append(&s, &bad), Err(StoreError::Shape { .. })));
        assert_eq!(store.completed_rows("p", "m", "acp").unwrap(), 0);
    }

    #[test]
    fn missing_table_counts_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.csv");
        assert_eq!(count_rows(&path).unwrap(), 0);
        assert!(table_mtime(&path).unwrap().is_none());
    }

    #[test]
    fn second_run_lock_fails_fast() {
        let dir = tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().join("out"));
        let first = RunLock::acquire(&layout).unwrap();
        assert!(matches!(RunLock::acquire(&layout), Err(StoreError::Locked(_))));
        drop(first);
        assert!(RunLock::acquire(&layout).is_ok());
    }

    #[test]
    fn header_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("log.csv");
        let header = vec!["a".to_string(), "b".to_string()];
        append_row_with_header(&path, &header, &["1".into(), "2".into()]).unwrap();
        append_row_with_header(&path, &header, &["3".into(), "4".into()]).unwrap();
        assert_eq!(count_rows(&path).unwrap(), 2);
    }
}
