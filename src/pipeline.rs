//! Query Orchestrator
//!
//! Drives one question end to end: interpret the question against the GTFS
//! vocabulary, synthesize a query, execute it, repair on failure up to a
//! bounded number of attempts, then summarize the result. Every transition
//! publishes a diagnostic event as it happens, so an observer on the event
//! bus sees the run live.

use crate::events::EventBus;
use crate::llm::{ActiveBackend, BackendRegistry, CompletionOptions};
use crate::prompts;
use crate::store::{DatasetStore, RowSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Pipeline stage names, used in events and failure payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Interpreting,
    Synthesizing,
    Executing,
    Repairing,
    Summarizing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Interpreting => "interpreting",
            Stage::Synthesizing => "synthesizing",
            Stage::Executing => "executing",
            Stage::Repairing => "repairing",
            Stage::Summarizing => "summarizing",
        }
    }
}

/// One turn of a chat-style request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A question to answer, optionally with history and an explicit backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AnswerRequest {
    pub fn question(text: impl Into<String>) -> Self {
        Self {
            question: Some(text.into()),
            ..Self::default()
        }
    }

    /// The question is the explicit field or the last user message; anything
    /// before it is history for the synthesis prompt.
    fn split(&self) -> Option<(Vec<(String, String)>, String)> {
        if let Some(q) = &self.question {
            return Some((Vec::new(), q.clone()));
        }
        let last_user = self
            .messages
            .iter()
            .rposition(|m| m.role == "user")?;
        let history = self.messages[..last_user]
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();
        Some((history, self.messages[last_user].content.clone()))
    }
}

/// Terminal result of one pipeline run, returned as data — pipeline-level
/// failures are never `Err` to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        summary: String,
        query: String,
        attempts: u32,
    },
    Failed {
        stage: String,
        message: String,
        last_query: Option<String>,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum query-correction retries after the initial execution.
    pub repair_limit: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { repair_limit: 2 }
    }
}

/// Per-run mutable state. One per `answer()` call, never shared.
struct PipelineRun {
    id: String,
    question: String,
    history: Vec<(String, String)>,
    query: String,
    attempts: u32,
    empty_repair_used: bool,
}

pub struct QueryOrchestrator {
    store: Arc<DatasetStore>,
    registry: Arc<BackendRegistry>,
    events: EventBus,
    config: PipelineConfig,
}

impl QueryOrchestrator {
    pub fn new(
        store: Arc<DatasetStore>,
        registry: Arc<BackendRegistry>,
        events: EventBus,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            config,
        }
    }

    /// Answer a natural-language question against the active dataset.
    ///
    /// The completion backend is captured once here; a concurrent
    /// `set_active` does not affect this run.
    pub async fn answer(&self, request: &AnswerRequest) -> PipelineOutcome {
        let Some((history, question)) = request.split() else {
            return self.fail(
                &short_id(),
                Stage::Interpreting,
                "no question provided".to_string(),
                None,
                0,
            );
        };

        let mut run = PipelineRun {
            id: short_id(),
            question,
            history,
            query: String::new(),
            attempts: 0,
            empty_repair_used: false,
        };

        let backend = match self
            .registry
            .resolve(request.provider.as_deref(), request.model.as_deref())
        {
            Ok(b) => b,
            Err(e) => {
                return self.fail(&run.id, Stage::Interpreting, e.to_string(), None, 0)
            }
        };

        self.emit(
            &run.id,
            Stage::Interpreting,
            format!(
                "question: \"{}\" (backend {} / {})",
                run.question, backend.provider, backend.model
            ),
        );
        info!(run = %run.id, "answering: {}", run.question);

        // Stage: Interpreting — which GTFS concepts does the question touch?
        let lookup = prompts::spec_lookup(&run.question);
        let interpretation = match backend
            .complete(&lookup.system, &lookup.user, &CompletionOptions::short())
            .await
        {
            Ok(text) => text,
            Err(e) => {
                return self.fail(&run.id, Stage::Interpreting, e.to_string(), None, 0)
            }
        };
        self.emit(
            &run.id,
            Stage::Interpreting,
            format!("interpretation: {}", interpretation),
        );

        // Stage: Synthesizing — one executable query, nothing else.
        let schema = match self.store.schema() {
            Ok(s) => s,
            Err(e) => {
                return self.fail(&run.id, Stage::Synthesizing, e.to_string(), None, 0)
            }
        };
        if schema.is_empty() {
            return self.fail(
                &run.id,
                Stage::Synthesizing,
                "no dataset has been ingested yet".to_string(),
                None,
                0,
            );
        }

        let synth = prompts::synthesis(&schema, &interpretation, &run.history, &run.question);
        run.query = match backend
            .complete(&synth.system, &synth.user, &CompletionOptions::default())
            .await
        {
            Ok(text) => prompts::clean_sql(&text),
            Err(e) => {
                return self.fail(&run.id, Stage::Synthesizing, e.to_string(), None, 0)
            }
        };
        self.emit(
            &run.id,
            Stage::Synthesizing,
            format!("synthesized query: {}", run.query),
        );

        // Stage: Executing / Repairing loop.
        let result = loop {
            run.attempts += 1;
            self.emit(
                &run.id,
                Stage::Executing,
                format!("attempt {}: {}", run.attempts, run.query),
            );

            match self.store.execute(&run.query) {
                Ok(result) if result.rows.is_empty() && !result.columns.is_empty() => {
                    self.emit(
                        &run.id,
                        Stage::Executing,
                        "query succeeded with 0 rows".to_string(),
                    );
                    if run.empty_repair_used || run.attempts > self.config.repair_limit {
                        break result;
                    }
                    run.empty_repair_used = true;
                    self.emit(
                        &run.id,
                        Stage::Repairing,
                        "loosening query that matched nothing".to_string(),
                    );
                    let loosen = prompts::empty_result_repair(&schema, &run.query);
                    match backend
                        .complete(&loosen.system, &loosen.user, &CompletionOptions::default())
                        .await
                    {
                        Ok(text) => {
                            run.query = prompts::clean_sql(&text);
                            continue;
                        }
                        Err(e) => {
                            // The empty result is still a valid answer.
                            warn!(run = %run.id, "empty-result repair unavailable: {}", e);
                            self.emit(
                                &run.id,
                                Stage::Repairing,
                                format!("loosening skipped: {}", e),
                            );
                            break result;
                        }
                    }
                }
                Ok(result) => {
                    self.emit(
                        &run.id,
                        Stage::Executing,
                        format!("query returned {} rows", result.row_count()),
                    );
                    break result;
                }
                Err(e) => {
                    let error_text = e.to_string();
                    self.emit(
                        &run.id,
                        Stage::Executing,
                        format!("attempt {} failed: {}", run.attempts, error_text),
                    );
                    if run.attempts > self.config.repair_limit {
                        return self.fail(
                            &run.id,
                            Stage::Executing,
                            error_text,
                            Some(run.query),
                            run.attempts,
                        );
                    }

                    self.emit(
                        &run.id,
                        Stage::Repairing,
                        format!("requesting correction (attempt {})", run.attempts),
                    );
                    let fix = prompts::repair(&schema, &run.query, &error_text);
                    match backend
                        .complete(&fix.system, &fix.user, &CompletionOptions::default())
                        .await
                    {
                        Ok(text) => {
                            run.query = prompts::clean_sql(&text);
                            self.emit(
                                &run.id,
                                Stage::Repairing,
                                format!("corrected query: {}", run.query),
                            );
                        }
                        Err(e) => {
                            return self.fail(
                                &run.id,
                                Stage::Repairing,
                                e.to_string(),
                                Some(run.query),
                                run.attempts,
                            );
                        }
                    }
                }
            }
        };

        // Stage: Summarizing — failure here degrades, never fails the run.
        let summary = self.summarize(&run, &backend, &result).await;

        self.emit(
            &run.id,
            Stage::Summarizing,
            format!("run complete: {} rows after {} attempts", result.row_count(), run.attempts),
        );
        PipelineOutcome::Success {
            columns: result.columns,
            rows: result.rows,
            summary,
            query: run.query,
            attempts: run.attempts,
        }
    }

    async fn summarize(
        &self,
        run: &PipelineRun,
        backend: &ActiveBackend,
        result: &RowSet,
    ) -> String {
        let prompt = prompts::humanize(&run.question, result);
        match backend
            .complete(&prompt.system, &prompt.user, &CompletionOptions::short())
            .await
        {
            Ok(text) => {
                self.emit(&run.id, Stage::Summarizing, format!("summary: {}", text));
                text
            }
            Err(e) => {
                warn!(run = %run.id, "summary degraded: {}", e);
                self.emit(
                    &run.id,
                    Stage::Summarizing,
                    format!("summary unavailable, returning raw result: {}", e),
                );
                String::new()
            }
        }
    }

    fn fail(
        &self,
        run_id: &str,
        stage: Stage,
        message: String,
        last_query: Option<String>,
        attempts: u32,
    ) -> PipelineOutcome {
        warn!(run = %run_id, stage = stage.as_str(), "pipeline failed: {}", message);
        self.emit(run_id, stage, format!("pipeline failed: {}", message));
        PipelineOutcome::Failed {
            stage: stage.as_str().to_string(),
            message,
            last_query,
            attempts,
        }
    }

    fn emit(&self, run_id: &str, stage: Stage, message: String) {
        self.events
            .publish(stage.as_str(), format!("[{}] {}", run_id, message));
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
