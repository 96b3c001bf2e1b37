//! One completion attempt, and a batch of them.
//!
//! An attempt is a single conversation with the model:
//!
//! ```text
//! SHUFFLE -> CONSIDERATIONS -> POLICIES -> [REASONING] -> VALIDATE -> PERSIST | REJECT
//! ```
//!
//! A provider failure at any turn ends the attempt as an error. Nothing is
//! written for rejected or failed attempts, and progress only moves after the
//! record has been appended to the output tables.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ProviderError};
use crate::models::{ModelEntry, ModelSpec};
use crate::progress::{ProgressError, ProgressTracker};
use crate::prompts::{SurveyPrompts, DEFAULT_PROMPTS, REASONING_NOT_REQUESTED};
use crate::response::{
    extract_reasoning, parse_ranks, strip_reasoning, RawCompletion, TokenUsage, TurnKind,
};
use crate::shuffle::{OrderShuffler, ShuffleError};
use crate::store::{append_row_with_header, CompletionRecord, OutputStore, StoreError};
use crate::survey::{is_runnable, Survey, SurveyError, SurveySource};
use crate::validate::{validate, Validation};

const CALLER: &str = "orchestrator::attempt";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Survey(#[from] SurveyError),
    #[error(transparent)]
    Shuffle(#[from] ShuffleError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("survey `{0}` is a template or parked and cannot be run")]
    NotRunnable(String),
}

// =============================================================================
// Run state
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub temperature: f32,
    /// Ask for a one-line rationale as a third turn.
    pub reasoning_turn: bool,
    pub cooldown: Duration,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub prompts: SurveyPrompts,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            reasoning_turn: true,
            cooldown: crate::config::DEFAULT_COOLDOWN,
            system_prompt: None,
            max_tokens: None,
            prompts: DEFAULT_PROMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurveyTally {
    pub attempted: u32,
    pub succeeded: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    /// Provider round trips issued.
    pub requests: u32,
    pub successes: u32,
    pub invalid: u32,
    pub errors: u32,
    /// Tokens spent on all attempts, including rejected ones.
    pub usage: TokenUsage,
    pub per_survey: BTreeMap<String, SurveyTally>,
}

impl RunCounters {
    /// Attempts that produced a full answer (valid or not).
    pub fn completions(&self) -> u32 {
        self.successes + self.invalid
    }

    fn tally(&mut self, survey: &str) -> &mut SurveyTally {
        self.per_survey.entry(survey.to_string()).or_default()
    }
}

/// Everything mutable during a run, owned in one place.
pub struct RunContext {
    pub tracker: ProgressTracker,
    pub shuffler: OrderShuffler,
    pub counters: RunCounters,
}

impl RunContext {
    pub fn new(tracker: ProgressTracker, seed: u64) -> Self {
        Self {
            tracker,
            shuffler: OrderShuffler::seeded(seed),
            counters: RunCounters::default(),
        }
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Persisted(CompletionRecord),
    Rejected(Validation),
    Failed { turn: TurnKind, error: ProviderError },
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct CompletionOrchestrator {
    gateway: Arc<dyn ChatGateway>,
    store: OutputStore,
    entry: ModelEntry,
    spec: ModelSpec,
    config: RunConfig,
}

impl CompletionOrchestrator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: OutputStore,
        entry: ModelEntry,
        spec: ModelSpec,
        config: RunConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            entry,
            spec,
            config,
        }
    }

    pub fn provider(&self) -> &str {
        &self.entry.provider
    }

    pub fn model(&self) -> &str {
        &self.entry.model
    }

    /// One provider turn. The answer, without any reasoning block, is appended
    /// to `messages` so the next turn sees the whole conversation.
    async fn turn(
        &self,
        ctx: &mut RunContext,
        messages: &mut Vec<Message>,
        prompt: String,
        kind: TurnKind,
        completion_id: Uuid,
        survey: &str,
    ) -> Result<RawCompletion, ProviderError> {
        messages.push(Message::user(prompt));

        let attribution = Attribution::new(CALLER)
            .with_completion(completion_id)
            .with_survey(survey)
            .with_turn(kind);
        let mut req = ChatRequest::new(self.spec.clone(), messages.clone(), attribution)
            .temperature(self.config.temperature);
        if let Some(max) = self.config.max_tokens {
            req = req.max_tokens(max);
        }

        ctx.counters.requests += 1;
        let resp = self.gateway.chat(req).await?;
        let usage = resp.usage();
        ctx.counters.usage.add(usage);
        messages.push(Message::assistant(strip_reasoning(&resp.content).trim()));
        Ok(RawCompletion::new(kind, resp.content, usage))
    }

    /// Run one attempt against `survey` and account for it in `ctx`.
    ///
    /// Provider failures and invalid answers are outcomes, not errors; only
    /// store and ledger failures abort.
    pub async fn attempt(&self, ctx: &mut RunContext, survey: &Survey) -> Result<AttemptOutcome, RunError> {
        let completion_id = Uuid::new_v4();
        let created_at = Utc::now();
        ctx.counters.tally(survey.name()).attempted += 1;

        let (shown_policies, policy_order) = ctx.shuffler.shuffle(survey.policies());
        let (shown_considerations, consideration_order) = ctx.shuffler.shuffle(survey.considerations());

        let mut messages = Vec::new();
        if let Some(system) = &self.config.system_prompt {
            messages.push(Message::system(system.clone()));
        }

        let prompts = &self.config.prompts;
        let mut turns = vec![
            (
                TurnKind::Consideration,
                prompts.consideration_prompt(&shown_considerations, survey.scale_max(), survey.q_method()),
            ),
            (TurnKind::Policy, prompts.policy_prompt(&shown_policies)),
        ];
        if self.config.reasoning_turn {
            turns.push((TurnKind::Reasoning, prompts.reasoning_prompt().to_string()));
        }

        let mut usage = TokenUsage::default();
        let mut answers = Vec::with_capacity(turns.len());
        for (kind, prompt) in turns {
            match self
                .turn(ctx, &mut messages, prompt, kind, completion_id, survey.name())
                .await
            {
                Ok(raw) => {
                    usage.add(raw.usage);
                    answers.push(raw);
                }
                Err(error) => {
                    ctx.counters.errors += 1;
                    return Ok(AttemptOutcome::Failed { turn: kind, error });
                }
            }
        }

        let mut ratings = Vec::new();
        let mut ranks = Vec::new();
        let mut reasoning = REASONING_NOT_REQUESTED.to_string();
        for raw in &answers {
            match raw.kind {
                TurnKind::Consideration => ratings = parse_ranks(&raw.text),
                TurnKind::Policy => ranks = parse_ranks(&raw.text),
                TurnKind::Reasoning => reasoning = extract_reasoning(&raw.text),
            }
        }

        // Checks run on the answers as given; only a valid answer is reordered.
        let validation = validate(&ratings, &ranks, &survey.constraints());
        if !validation.is_valid() {
            ctx.counters.invalid += 1;
            return Ok(AttemptOutcome::Rejected(validation));
        }

        let record = CompletionRecord {
            id: completion_id,
            created_at,
            provider: self.entry.provider.clone(),
            model: self.entry.model.clone(),
            temperature: self.config.temperature,
            usage,
            ratings: consideration_order.deshuffle(&ratings)?,
            ranks: policy_order.deshuffle(&ranks)?,
            reasoning,
        };

        self.store.append(survey, &record)?;
        ctx.tracker
            .update(&self.entry.provider, &self.entry.model, survey.name())?;

        ctx.counters.successes += 1;
        ctx.counters.tally(survey.name()).succeeded += 1;
        Ok(AttemptOutcome::Persisted(record))
    }

    /// Resolve the surveys to run, check capacity, then run `iterations`
    /// attempts per survey in sequence.
    pub async fn run_batch(
        &self,
        ctx: &mut RunContext,
        source: &dyn SurveySource,
        only_survey: Option<&str>,
        iterations: u32,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let names: Vec<String> = match only_survey {
            Some(name) if !is_runnable(name) => return Err(RunError::NotRunnable(name.to_string())),
            Some(name) => vec![name.to_string()],
            None => source
                .names()?
                .into_iter()
                .filter(|name| is_runnable(name))
                .collect(),
        };

        ctx.tracker
            .check_capacity(self.provider(), self.model(), &names, iterations)?;

        info!(
            provider = self.provider(),
            model = self.model(),
            temperature = self.config.temperature,
            surveys = names.len(),
            iterations,
            "starting batch"
        );

        let mut executed = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let survey = match source.load(name) {
                Ok(survey) => survey,
                Err(err @ SurveyError::Malformed { .. }) => {
                    warn!(survey = %name, error = %err, "skipping malformed survey");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            info!(
                survey = %name,
                position = i + 1,
                of = names.len(),
                scale_max = survey.scale_max(),
                q_method = survey.q_method(),
                "survey"
            );
            self.store.ensure_tables(self.provider(), self.model(), &survey)?;
            executed.push(name.clone());

            for iteration in 1..=iterations {
                let attempt_start = Instant::now();
                match self.attempt(ctx, &survey).await? {
                    AttemptOutcome::Persisted(record) => {
                        info!(
                            survey = %name,
                            iteration,
                            cuid = %record.id,
                            elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                            "completion persisted"
                        );
                    }
                    AttemptOutcome::Rejected(validation) => {
                        warn!(survey = %name, iteration, reasons = %validation.reasons(), "invalid completion");
                    }
                    AttemptOutcome::Failed { turn, error } => {
                        warn!(
                            survey = %name,
                            iteration,
                            turn = turn.as_str(),
                            code = error.code(),
                            error = %error,
                            "provider error"
                        );
                        continue;
                    }
                }
                if !self.config.cooldown.is_zero() {
                    sleep(self.config.cooldown).await;
                }
            }

            let tally = ctx.counters.per_survey.get(name).copied().unwrap_or_default();
            info!(
                survey = %name,
                attempted = tally.attempted,
                success_rate = percent(tally.succeeded, tally.attempted),
                "survey finished"
            );
        }

        Ok(RunSummary {
            provider: self.entry.provider.clone(),
            model: self.entry.model.clone(),
            temperature: self.config.temperature,
            iterations,
            surveys: executed,
            counters: ctx.counters.clone(),
            elapsed: started.elapsed(),
        })
    }
}

fn percent(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        0
    } else {
        (u64::from(part) * 100 / u64::from(whole)) as u32
    }
}

// =============================================================================
// Summary
// =============================================================================

pub const EXEC_LOG_COLUMNS: [&str; 15] = [
    "finished_at",
    "provider",
    "model",
    "temperature",
    "num_surveys",
    "num_iterations",
    "num_completions",
    "num_requests",
    "input_tokens",
    "output_tokens",
    "num_errors",
    "num_invalid",
    "num_success",
    "success_rate",
    "survey_success_rates",
];

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub iterations: u32,
    /// Surveys actually run, in order.
    pub surveys: Vec<String>,
    pub counters: RunCounters,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Successes as a percentage of full answers (valid or not).
    pub fn success_rate(&self) -> u32 {
        percent(self.counters.successes, self.counters.completions())
    }

    pub fn time_per_completion(&self) -> Duration {
        match self.counters.completions() {
            0 => Duration::ZERO,
            n => self.elapsed / n,
        }
    }

    /// Per-survey success as a percentage of the attempts made on it.
    pub fn survey_success_rates(&self) -> Vec<(String, u32)> {
        self.surveys
            .iter()
            .map(|s| {
                let tally = self.survey_tally(s);
                (s.clone(), percent(tally.succeeded, tally.attempted))
            })
            .collect()
    }

    pub fn survey_tally(&self, survey: &str) -> SurveyTally {
        self.counters.per_survey.get(survey).copied().unwrap_or_default()
    }

    /// Append one row to the execution log, creating it if needed.
    pub fn append_to(&self, path: &Path) -> Result<(), StoreError> {
        let header: Vec<String> = EXEC_LOG_COLUMNS.iter().map(|c| c.to_string()).collect();
        let rates = self
            .survey_success_rates()
            .into_iter()
            .map(|(s, r)| format!("{s}:{r}"))
            .collect::<Vec<_>>()
            .join(";");
        let c = &self.counters;
        let row = vec![
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.provider.clone(),
            self.model.clone(),
            self.temperature.to_string(),
            self.surveys.len().to_string(),
            self.iterations.to_string(),
            c.completions().to_string(),
            c.requests.to_string(),
            c.usage.input_tokens.to_string(),
            c.usage.output_tokens.to_string(),
            c.errors.to_string(),
            c.invalid.to_string(),
            c.successes.to_string(),
            self.success_rate().to_string(),
            rates,
        ];
        append_row_with_header(path, &header, &row)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        let secs = self.elapsed.as_secs();
        writeln!(f, "=============== S U M M A R Y ===============")?;
        writeln!(f, "Execution complete for {}/{}", self.provider, self.model)?;
        writeln!(f, "Temperature: {}", self.temperature)?;
        writeln!(f, "Surveys: {}", self.surveys.len())?;
        writeln!(f, "Iterations per survey: {}", self.iterations)?;
        writeln!(f, "Total LLM completions: {}", c.completions())?;
        writeln!(f, "Total LLM requests: {}", c.requests)?;
        writeln!(f, "Tokens: {} input, {} output", c.usage.input_tokens, c.usage.output_tokens)?;
        writeln!(f, "Invalid LLM completions: {}", c.invalid)?;
        writeln!(f, "Data generation errors: {}", c.errors)?;
        writeln!(f, "Successful LLM completions: {}", c.successes)?;
        writeln!(f, "Success rate: {}%", self.success_rate())?;
        for (survey, rate) in self.survey_success_rates() {
            let tally = self.survey_tally(&survey);
            writeln!(f, "  {survey}: {rate}% ({}/{})", tally.succeeded, tally.attempted)?;
        }
        writeln!(
            f,
            "Elapsed time: {}h {}m {}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )?;
        writeln!(
            f,
            "Average time per completion: {:.2}s",
            self.time_per_completion().as_secs_f64()
        )?;
        write!(f, "=============================================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(successes: u32, invalid: u32) -> RunSummary {
        let mut counters = RunCounters {
            successes,
            invalid,
            ..Default::default()
        };
        counters.per_survey.insert(
            "acp".into(),
            SurveyTally {
                attempted: 4,
                succeeded: successes,
            },
        );
        RunSummary {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            temperature: 0.0,
            iterations: 4,
            surveys: vec!["acp".into()],
            counters,
            elapsed: Duration::from_secs(8),
        }
    }

    #[test]
    fn rates_and_timing() {
        let s = summary(3, 1);
        assert_eq!(s.success_rate(), 75);
        assert_eq!(s.time_per_completion(), Duration::from_secs(2));
        assert_eq!(s.survey_success_rates(), vec![("acp".to_string(), 75)]);
    }

    #[test]
    fn empty_run_has_zero_rates() {
        let s = summary(0, 0);
        assert_eq!(s.success_rate(), 0);
        assert_eq!(s.time_per_completion(), Duration::ZERO);
    }

    #[test]
    fn display_mentions_counts() {
        let text = summary(3, 1).to_string();
        assert!(text.contains("Execution complete for openai/gpt-4o"));
        assert!(text.contains("Success rate: 75%"));
        assert!(text.contains("acp: 75% (3/4)"));
    }

    #[test]
    fn survey_rates_use_attempts_made() {
        // A context reused across two batches of 4 accumulates 8 attempts.
        let mut s = summary(6, 2);
        s.counters.per_survey.insert(
            "acp".into(),
            SurveyTally {
                attempted: 8,
                succeeded: 6,
            },
        );
        s.surveys.push("bio".into());
        assert_eq!(
            s.survey_success_rates(),
            vec![("acp".to_string(), 75), ("bio".to_string(), 0)]
        );
        assert!(s.to_string().contains("bio: 0% (0/0)"));
    }

    #[test]
    fn exec_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec_log.csv");
        summary(3, 1).append_to(&path).unwrap();
        summary(1, 0).append_to(&path).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][14], "acp:75");
    }
}
