//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs all calls through a UsageSink. This decouples the gateway
//! from any specific storage backend:
//! - The CLI uses CsvRequestLog (appends to `<output>/request_log.csv`)
//! - Debugging sessions can use StderrUsageSink
//! - Tests use NoopUsageSink or a recording sink

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::response::TurnKind;
use crate::store::append_row_with_header;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Adapter name: "openai", "xai", "ollama", etc.
    pub api: String,
    pub endpoint: &'static str,
    /// Model name as requested.
    pub model: String,
    /// Model version the provider reports having served.
    pub model_version: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub completion_id: Option<Uuid>,
    pub survey: Option<String>,
    pub turn: Option<TurnKind>,
    /// Provider request ID (for debugging).
    pub request_id: Option<String>,
    /// Last message sent, which carries the presented order.
    pub prompt: Option<String>,
    /// Raw response text, kept for auditing parse failures.
    pub response: Option<String>,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        api: impl Into<String>,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            api: api.into(),
            endpoint,
            model: model.into(),
            model_version: None,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            completion_id: None,
            survey: None,
            turn: None,
            request_id: None,
            prompt: None,
            response: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn completion(mut self, id: Option<Uuid>) -> Self {
        self.completion_id = id;
        self
    }

    pub fn survey(mut self, survey: Option<String>) -> Self {
        self.survey = survey;
        self
    }

    pub fn turn(mut self, turn: Option<TurnKind>) -> Self {
        self.turn = turn;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn model_version(mut self, version: Option<String>) -> Self {
        self.model_version = version;
        self
    }

    pub fn prompt(mut self, text: impl Into<String>) -> Self {
        self.prompt = Some(text.into());
        self
    }

    pub fn response(mut self, text: impl Into<String>) -> Self {
        self.response = Some(text.into());
        self
    }
}

/// Trait for recording provider call usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {
        // Discard
    }
}

/// Usage sink that writes to stderr as JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let line = serde_json::json!({
            "api": record.api,
            "endpoint": record.endpoint,
            "model": record.model,
            "tokens": record.input_tokens.saturating_add(record.output_tokens),
            "status": record.status.as_str(),
            "error_code": record.error_code,
            "caller": record.caller,
            "survey": record.survey,
            "turn": record.turn.map(|t| t.as_str()),
        });
        eprintln!("{line}");
    }
}

// =============================================================================
// CSV request log
// =============================================================================

pub const REQUEST_LOG_COLUMNS: [&str; 15] = [
    "completion_id",
    "timestamp",
    "api",
    "model",
    "model_version",
    "survey",
    "turn",
    "status",
    "error_code",
    "input_tokens",
    "output_tokens",
    "latency_ms",
    "request_id",
    "prompt",
    "response",
];

/// Appends one row per provider call to a CSV file.
#[derive(Debug)]
pub struct CsvRequestLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvRequestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row(record: &ProviderCallRecord) -> Vec<String> {
        vec![
            record
                .completion_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            record.api.clone(),
            record.model.clone(),
            record.model_version.clone().unwrap_or_default(),
            record.survey.clone().unwrap_or_default(),
            record
                .turn
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            record.status.as_str().to_string(),
            record.error_code.clone().unwrap_or_default(),
            record.input_tokens.to_string(),
            record.output_tokens.to_string(),
            record.latency_ms.to_string(),
            record.request_id.clone().unwrap_or_default(),
            record.prompt.clone().unwrap_or_default(),
            record.response.clone().unwrap_or_default(),
        ]
    }
}

#[async_trait]
impl UsageSink for CsvRequestLog {
    async fn record(&self, record: ProviderCallRecord) {
        let header: Vec<String> = REQUEST_LOG_COLUMNS.iter().map(|c| c.to_string()).collect();
        let row = Self::row(&record);
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = append_row_with_header(&self.path, &header, &row) {
            warn!(error = %err, "failed to append request log");
        }
    }
}
