#![forbid(unsafe_code)]

//! # minipublic-harness
//!
//! Collects rating and ranking judgments from LLMs for deliberative
//! mini-public surveys and keeps them comparable across providers.
//!
//! Each completion is a short conversation: the model rates a survey's
//! considerations on a Likert scale, ranks its policies, and optionally
//! explains itself in one line. Statements are shown in a seeded random order.
//! Answers are parsed from free text, validated, mapped back to canonical
//! order and appended to per-(provider, model, survey) CSV tables. A progress
//! ledger tracks how many completions each cell still needs, and can always
//! be rebuilt from the tables themselves.

pub mod config;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod response;
pub mod shuffle;
pub mod store;
pub mod survey;
pub mod validate;

pub use config::HarnessConfig;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, ProviderRegistry, UsageSink};
pub use models::{ModelCatalog, ModelEntry, ModelSpec, ReasoningEffort};
pub use orchestrator::{
    AttemptOutcome, CompletionOrchestrator, RunConfig, RunContext, RunError, RunSummary,
};
pub use progress::{ProgressEntry, ProgressError, ProgressTracker};
pub use response::{extract_reasoning, parse_ranks, TurnKind};
pub use shuffle::{OrderShuffler, PresentationOrder};
pub use store::{CompletionRecord, OutputLayout, OutputStore};
pub use survey::{JsonSurveyDirectory, Survey, SurveySource};
pub use validate::{validate, SurveyConstraints, Validation, Violation};
