//! Self-correcting answer evaluation for retrieval-augmented question answering.
//!
//! An initial answer built from document search is reviewed step by step by a
//! [`DecisionProvider`], which may ask for more documents, a web search, or a
//! refinement before the answer is returned. Every run is bounded by
//! iteration, query and time budgets and yields an [`EvaluationTrace`].

mod action;
mod answer;
mod config;
mod context;
pub mod decision;
mod error;
mod eval;
mod executor;
mod llm;
mod logging;
mod metrics;
mod orchestrator;
mod output;
mod pipeline;
pub mod retrieval;
mod scoring;
mod security;
mod sources;
mod state;
mod telemetry;
mod trace;
mod web;

pub use action::{ActionKind, ActionVocabulary, Budgets, EvaluationAction};
pub use answer::{
    AnswerRefiner, AnswerSynthesizer, DynRefiner, DynSynthesizer, LlmAnswerWriter, RefineRequest,
};
pub use config::{
    Config, ConfigLoader, EvaluationConfig, LlmConfig, LoggingConfig, RetrievalConfig,
    WebSearchConfig,
};
pub use context::{CompressedContext, Ledger, MemoryUpdate, SourceUsage, compress};
pub use decision::{
    Assessment, Completeness, Decision, DecisionInput, DecisionProvider, DynDecisionProvider,
    FALLBACK_REASON, LlmDecisionProvider, ScriptedDecisionProvider, ScriptedReply, parse_decision,
    render_reply,
};
pub use error::{DecisionError, RagLoopError};
pub use eval::{RunLogAnalyzer, RunLogEntry, RunLogStats};
pub use executor::{Dispatch, MAX_QUERIES_PER_STEP, Outcome};
pub use llm::{DynLanguageModel, LanguageModel, OpenAiChatModel};
pub use logging::{RunLogRecord, RunLogSettings, log_evaluation_run};
pub use metrics::record_evaluation_metrics;
pub use orchestrator::{AnswerEvaluator, Collaborators, EvaluationRequest};
pub use output::EvaluationOutput;
pub use pipeline::AnswerPipeline;
pub use retrieval::{
    DynRetriever, InMemoryRetriever, IngestDocument, RetrievalHit, RetrievalService, SearchOptions,
};
pub use scoring::{
    Confidence, ConfidenceFactor, ConfidenceScorer, DynScorer, HeuristicScorer, QuestionAnalysis,
    QuestionKind,
};
pub use security::{SecretValue, require_env};
pub use sources::{ContextSnippet, ResultSet, SourceKind, SourceRef};
pub use state::EvaluationState;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{
    EvaluationTrace, FinalAction, ResourceUsage, StepResult, TraceLine, TraceSummary, persist_trace,
};
pub use web::{
    DynWebSearch, TAVILY_SEARCH_URL, TavilySearch, WebResult, WebSearchOptions, WebSearchService,
};
