//! Survey definitions and where they come from.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::validate::SurveyConstraints;

/// Upper bound of the rating scale when a survey does not set one.
pub const DEFAULT_SCALE_MAX: u32 = 10;

/// Survey reserved for authoring new surveys; never run.
pub const TEMPLATE_SURVEY: &str = "template";

#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("survey `{0}` not found")]
    NotFound(String),
    #[error("survey `{name}` is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("failed to read surveys: {0}")]
    Io(#[from] std::io::Error),
}

impl SurveyError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Policy,
    Consideration,
}

impl StatementKind {
    /// Column prefix in the output tables (`P1. ...`, `C1. ...`).
    pub fn prefix(&self) -> char {
        match self {
            StatementKind::Policy => 'P',
            StatementKind::Consideration => 'C',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Stable 0-based position in the survey's canonical order.
    pub index: usize,
    pub text: String,
}

/// A deliberative mini-public: policies to rank and considerations to rate.
#[derive(Debug, Clone)]
pub struct Survey {
    name: String,
    policies: Vec<Statement>,
    considerations: Vec<Statement>,
    scale_max: u32,
    q_method: bool,
}

impl Survey {
    pub fn new(
        name: impl Into<String>,
        policies: Vec<String>,
        considerations: Vec<String>,
        scale_max: u32,
        q_method: bool,
    ) -> Result<Self, SurveyError> {
        let name = name.into();
        if scale_max < 1 {
            return Err(SurveyError::malformed(&name, "scale_max must be at least 1"));
        }
        if policies.is_empty() {
            return Err(SurveyError::malformed(&name, "no policies"));
        }
        if considerations.is_empty() {
            return Err(SurveyError::malformed(&name, "no considerations"));
        }

        let into_statements = |kind, texts: Vec<String>| {
            texts
                .into_iter()
                .enumerate()
                .map(|(index, text)| Statement { kind, index, text })
                .collect::<Vec<_>>()
        };

        Ok(Self {
            policies: into_statements(StatementKind::Policy, policies),
            considerations: into_statements(StatementKind::Consideration, considerations),
            name,
            scale_max,
            q_method,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policies(&self) -> &[Statement] {
        &self.policies
    }

    pub fn considerations(&self) -> &[Statement] {
        &self.considerations
    }

    pub fn scale_max(&self) -> u32 {
        self.scale_max
    }

    pub fn q_method(&self) -> bool {
        self.q_method
    }

    pub fn constraints(&self) -> SurveyConstraints {
        SurveyConstraints {
            considerations: self.considerations.len(),
            policies: self.policies.len(),
            scale_max: self.scale_max,
            q_method: self.q_method,
        }
    }
}

/// Whether a survey name takes part in batch runs. Names starting with `~`
/// are parked, and the template is never run.
pub fn is_runnable(name: &str) -> bool {
    !name.starts_with('~') && name != TEMPLATE_SURVEY
}

/// Anything that can list and load surveys by name.
pub trait SurveySource: Send + Sync {
    fn names(&self) -> Result<Vec<String>, SurveyError>;
    fn load(&self, name: &str) -> Result<Survey, SurveyError>;
}

// =============================================================================
// JSON directory source
// =============================================================================

#[derive(Debug, Deserialize)]
struct SurveyFile {
    policies: Vec<String>,
    considerations: Vec<String>,
    #[serde(default)]
    policies_order: Option<Vec<i64>>,
    #[serde(default)]
    considerations_order: Option<Vec<i64>>,
    #[serde(default)]
    scale_max: Option<u32>,
    #[serde(default, alias = "q-method")]
    q_method: Option<bool>,
}

/// Surveys stored as `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct JsonSurveyDirectory {
    dir: PathBuf,
}

impl JsonSurveyDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl SurveySource for JsonSurveyDirectory {
    fn names(&self) -> Result<Vec<String>, SurveyError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, name: &str) -> Result<Survey, SurveyError> {
        let path = self.path_for(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SurveyError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let file: SurveyFile = serde_json::from_str(&raw)
            .map_err(|e| SurveyError::malformed(name, format!("invalid JSON: {e}")))?;

        let policies = sort_by_order(name, file.policies, file.policies_order, "policies")?;
        let considerations = sort_by_order(
            name,
            file.considerations,
            file.considerations_order,
            "considerations",
        )?;

        Survey::new(
            name,
            policies,
            considerations,
            file.scale_max.unwrap_or(DEFAULT_SCALE_MAX),
            file.q_method.unwrap_or(false),
        )
    }
}

/// Stable sort of statements by their authoring order keys.
fn sort_by_order(
    name: &str,
    statements: Vec<String>,
    order: Option<Vec<i64>>,
    field: &str,
) -> Result<Vec<String>, SurveyError> {
    let Some(order) = order else {
        return Ok(statements);
    };
    if order.len() != statements.len() {
        return Err(SurveyError::malformed(
            name,
            format!(
                "{field}_order has {} entries for {} {field}",
                order.len(),
                statements.len()
            ),
        ));
    }
    let mut paired: Vec<(i64, String)> = order.into_iter().zip(statements).collect();
    paired.sort_by_key(|(key, _)| *key);
    Ok(paired.into_iter().map(|(_, s)| s).collect())
}
