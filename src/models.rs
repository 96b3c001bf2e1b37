//! Model catalog and tagged model specifications.
//!
//! The catalog is a CSV file with at least `provider,model,api` columns. Any
//! other columns (prices, notes) are ignored. A catalog model name may carry a
//! reasoning suffix such as `grok-3-mini-r=low`; [`ModelSpec::parse`] splits it
//! once so downstream code only ever sees the tagged form.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read model catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("model `{0}` not found in catalog")]
    UnknownModel(String),
    #[error("invalid reasoning effort `{0}` (expected low, medium, high or true)")]
    InvalidEffort(String),
}

// =============================================================================
// Reasoning effort
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    /// Reasoning switched on without a graded effort.
    Enabled,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Enabled => "true",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "true" | "on" => Ok(ReasoningEffort::Enabled),
            _ => Err(CatalogError::InvalidEffort(s.to_string())),
        }
    }
}

// =============================================================================
// Model spec
// =============================================================================

const EFFORT_SUFFIXES: &[&str] = &["-r=", "-think="];

/// Model configuration as sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSpec {
    /// Catalog name, used for output paths and ledger keys.
    pub name: String,
    /// Name the provider API expects.
    pub base_model: String,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ModelSpec {
    pub fn plain(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            base_model: name.clone(),
            name,
            reasoning_effort: None,
        }
    }

    pub fn parse(name: &str) -> Result<Self, CatalogError> {
        for suffix in EFFORT_SUFFIXES {
            if let Some(idx) = name.rfind(suffix) {
                let effort = name[idx + suffix.len()..].parse()?;
                return Ok(Self {
                    name: name.to_string(),
                    base_model: name[..idx].to_string(),
                    reasoning_effort: Some(effort),
                });
            }
        }
        Ok(Self::plain(name))
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelEntry {
    /// Model vendor; names the output directory.
    pub provider: String,
    pub model: String,
    /// Adapter used to reach the model.
    pub api: String,
}

impl ModelEntry {
    pub fn spec(&self) -> Result<ModelSpec, CatalogError> {
        ModelSpec::parse(&self.model)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let read_err = |source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_err)?;
        let mut entries = Vec::new();
        for row in reader.deserialize::<ModelEntry>() {
            entries.push(row.map_err(read_err)?);
        }
        entries.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn find(&self, model: &str) -> Result<&ModelEntry, CatalogError> {
        self.entries
            .iter()
            .find(|e| e.model == model)
            .ok_or_else(|| CatalogError::UnknownModel(model.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_reasoning_suffix() {
        let spec = ModelSpec::parse("grok-3-mini-r=low").unwrap();
        assert_eq!(spec.name, "grok-3-mini-r=low");
        assert_eq!(spec.base_model, "grok-3-mini");
        assert_eq!(spec.reasoning_effort, Some(ReasoningEffort::Low));

        let spec = ModelSpec::parse("qwen3-think=true").unwrap();
        assert_eq!(spec.base_model, "qwen3");
        assert_eq!(spec.reasoning_effort, Some(ReasoningEffort::Enabled));
    }

    #[test]
    fn plain_names_pass_through() {
        let spec = ModelSpec::parse("gpt-4o").unwrap();
        assert_eq!(spec, ModelSpec::plain("gpt-4o"));
        assert!(spec.reasoning_effort.is_none());
    }

    #[test]
    fn rejects_unknown_effort() {
        assert!(matches!(
            ModelSpec::parse("grok-r=extreme"),
            Err(CatalogError::InvalidEffort(_))
        ));
    }

    #[test]
    fn loads_catalog_ignoring_extra_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider,model,api,price_1M_input").unwrap();
        writeln!(file, "openai, gpt-4o ,openai,2.5").unwrap();
        writeln!(file, "xai,grok-3-mini-r=high,xai,0.3").unwrap();
        let catalog = ModelCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.entries().len(), 2);

        let entry = catalog.find("gpt-4o").unwrap();
        assert_eq!(entry.provider, "openai");

        let spec = catalog.find("grok-3-mini-r=high").unwrap().spec().unwrap();
        assert_eq!(spec.reasoning_effort, Some(ReasoningEffort::High));

        assert!(matches!(
            catalog.find("missing"),
            Err(CatalogError::UnknownModel(_))
        ));
    }
}
