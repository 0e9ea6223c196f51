use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use ragloop_core::{
    ActionKind, AnswerEvaluator, AnswerRefiner, Collaborators, Confidence, DecisionInput,
    DecisionProvider, EvaluationAction, EvaluationConfig, EvaluationRequest, FALLBACK_REASON,
    FinalAction, QuestionAnalysis, RefineRequest, RetrievalHit, RetrievalService,
    ScriptedDecisionProvider, ScriptedReply, SearchOptions, SourceKind, WebResult,
    WebSearchOptions, WebSearchService,
};

fn hit(url: &str) -> RetrievalHit {
    RetrievalHit {
        url: url.to_string(),
        title: format!("Doc {url}"),
        text: format!("content of {url}"),
        score: 0.6,
    }
}

/// Tracks how many calls overlap in time.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    async fn hold(&self, latency: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Retriever returning canned hits per query and counting every call.
#[derive(Default)]
struct CountingRetriever {
    canned: HashMap<String, Vec<RetrievalHit>>,
    failing: Vec<String>,
    calls: AtomicUsize,
    latency: Duration,
    in_flight: InFlight,
}

impl CountingRetriever {
    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn with(mut self, query: &str, urls: &[&str]) -> Self {
        self.canned
            .insert(query.to_string(), urls.iter().map(|url| hit(url)).collect());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetrievalService for CountingRetriever {
    async fn search(&self, query: &str, _options: &SearchOptions) -> Result<Vec<RetrievalHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.hold(self.latency).await;
        if self.failing.iter().any(|failing| failing == query) {
            return Err(anyhow!("index unavailable"));
        }
        Ok(self
            .canned
            .get(query)
            .cloned()
            .unwrap_or_else(|| vec![hit(&format!("docs://{query}"))]))
    }
}

/// Web search that fails for one query and returns three results otherwise.
struct FlakyWeb {
    failing: String,
    calls: AtomicUsize,
    latency: Duration,
    in_flight: InFlight,
}

impl FlakyWeb {
    fn failing_on(query: &str) -> Self {
        Self {
            failing: query.to_string(),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
            in_flight: InFlight::default(),
        }
    }

    fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl WebSearchService for FlakyWeb {
    async fn search(&self, query: &str, _options: &WebSearchOptions) -> Result<Vec<WebResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.hold(self.latency).await;
        if query == self.failing {
            return Err(anyhow!("HTTP 502 from search provider"));
        }
        Ok((1..=3)
            .map(|idx| WebResult {
                title: format!("{query} result {idx}"),
                url: format!("https://example.com/{query}/{idx}"),
                content: format!("web content {idx}"),
                score: 0.5,
            })
            .collect())
    }
}

struct SuffixRefiner {
    fail: bool,
    requests: Mutex<Vec<RefineRequest>>,
}

impl SuffixRefiner {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AnswerRefiner for SuffixRefiner {
    async fn refine(&self, request: &RefineRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(anyhow!("model timed out"));
        }
        Ok(format!("{} +{}", request.current_answer, request.focus_areas.join(",")))
    }
}

/// Provider that never answers within any reasonable deadline.
struct StalledProvider;

#[async_trait]
impl DecisionProvider for StalledProvider {
    async fn decide(&self, _input: &DecisionInput) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

fn docs(queries: &[&str]) -> EvaluationAction {
    EvaluationAction::QueryMoreDocs {
        queries: queries.iter().map(|q| q.to_string()).collect(),
        reason: "coverage gap".into(),
    }
}

fn web(queries: &[&str]) -> EvaluationAction {
    EvaluationAction::SearchWeb {
        queries: queries.iter().map(|q| q.to_string()).collect(),
        reason: "not in the docs".into(),
    }
}

fn request(score: f32) -> EvaluationRequest {
    EvaluationRequest {
        question: QuestionAnalysis::analyze("How do I configure retries for the client?"),
        initial_answer: "Use the retry builder.".into(),
        initial_confidence: Confidence::new(score),
        initial_results: vec![hit("docs://a")],
    }
}

struct Harness {
    provider: Arc<ScriptedDecisionProvider>,
    retriever: Arc<CountingRetriever>,
    web: Arc<FlakyWeb>,
    refiner: Arc<SuffixRefiner>,
}

impl Harness {
    fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            provider: Arc::new(ScriptedDecisionProvider::new(replies)),
            retriever: Arc::new(CountingRetriever::default()),
            web: Arc::new(FlakyWeb::failing_on("bad")),
            refiner: Arc::new(SuffixRefiner::new(false)),
        }
    }

    fn actions(actions: Vec<EvaluationAction>) -> Self {
        Self::new(actions.into_iter().map(ScriptedReply::action).collect())
    }

    fn retriever(mut self, retriever: CountingRetriever) -> Self {
        self.retriever = Arc::new(retriever);
        self
    }

    fn refiner(mut self, refiner: SuffixRefiner) -> Self {
        self.refiner = Arc::new(refiner);
        self
    }

    fn web_search(mut self, web: FlakyWeb) -> Self {
        self.web = Arc::new(web);
        self
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.provider.clone(),
            self.retriever.clone(),
            self.refiner.clone(),
        )
    }

    fn evaluator(&self, config: EvaluationConfig) -> AnswerEvaluator {
        AnswerEvaluator::new(config, self.collaborators().with_web(self.web.clone()))
    }

    /// Evaluator built without any web search collaborator.
    fn evaluator_without_web(&self, config: EvaluationConfig) -> AnswerEvaluator {
        AnswerEvaluator::new(config, self.collaborators())
    }
}

#[tokio::test]
async fn confident_initial_answer_skips_the_loop() {
    let harness = Harness::actions(vec![docs(&["x"])]);
    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(90.0))
        .await;

    assert!(output.trace.steps.is_empty());
    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.answer, "Use the retry builder.");
    assert_eq!(output.trace.resources_used.llm_calls, 0);
    assert_eq!(harness.provider.calls(), 0);
    assert!(output.warnings.is_empty());
}

#[tokio::test]
async fn threshold_is_inclusive() {
    let harness = Harness::actions(vec![docs(&["x"])]);
    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(85.0))
        .await;
    assert!(output.trace.steps.is_empty());
    assert_eq!(harness.provider.calls(), 0);
}

#[tokio::test]
async fn query_then_return_counts_issued_queries() {
    let retriever = CountingRetriever::default()
        .with("x", &["docs://a", "docs://b"])
        .with("y", &["docs://b"]);
    let harness = Harness::actions(vec![
        docs(&["x", "y"]),
        EvaluationAction::return_answer("covered"),
    ])
    .retriever(retriever);

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(60.0))
        .await;

    assert_eq!(output.trace.steps.len(), 2);
    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.trace.resources_used.doc_queries, 2);
    assert_eq!(output.trace.resources_used.llm_calls, 2);
    assert_eq!(harness.retriever.calls(), 2);

    // docs://a was already present, docs://b arrives from both queries.
    let urls: Vec<&str> = output.sources.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(urls, vec!["docs://a", "docs://b"]);

    let inputs = harness.provider.inputs();
    assert!(inputs[0].memory.is_none());
    let memory = inputs[1].memory.as_ref().expect("memory after step one");
    assert_eq!(memory.queries_tried, vec!["x".to_string(), "y".to_string()]);
    assert!(memory.sources_used.iter().any(|s| s.url == "docs://b"));
    assert_eq!(inputs[1].budgets.doc_queries_remaining, 2);
}

#[tokio::test]
async fn endless_queries_stop_at_iteration_limit() {
    let harness = Harness::actions(vec![docs(&["x", "y"])]);
    let config = EvaluationConfig {
        max_iterations: 3,
        max_doc_queries: 10,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(40.0)).await;

    assert_eq!(output.trace.steps.len(), 3);
    assert_eq!(output.trace.final_action, FinalAction::MaxIterations);
    assert!(output.warnings.iter().any(|w| w.contains("iteration limit")));
    assert_eq!(output.trace.resources_used.llm_calls, 3);
    assert_eq!(output.trace.resources_used.doc_queries, 6);
    for (index, step) in output.trace.steps.iter().enumerate() {
        assert_eq!(step.step, index + 1);
    }
    // Re-running the same queries adds nothing new.
    assert_eq!(output.sources.len(), 3);
}

#[tokio::test]
async fn document_queries_never_exceed_budget() {
    let harness = Harness::actions(vec![docs(&["q1", "q2", "q3", "q4", "q5"])]);
    let config = EvaluationConfig {
        max_iterations: 5,
        max_doc_queries: 3,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(40.0)).await;

    assert_eq!(harness.retriever.calls(), 3);
    assert_eq!(output.trace.resources_used.doc_queries, 3);
    // Once the budget is spent the action leaves the vocabulary and the
    // scripted request is rejected.
    let inputs = harness.provider.inputs();
    assert!(!inputs[2].vocabulary.contains(ActionKind::QueryMoreDocs));
    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.trace.steps[2].action.reason(), FALLBACK_REASON);
    assert!(output.trace.resources_used.llm_calls <= 5);
}

#[tokio::test]
async fn disabled_web_search_is_never_offered_or_run() {
    let harness = Harness::new(vec![
        ScriptedReply::action(docs(&["x"])),
        ScriptedReply::action(EvaluationAction::RefineAnswer {
            focus_areas: vec!["timeouts".into()],
            reason: "vague".into(),
        }),
        ScriptedReply::action(web(&["retry policy"])),
    ]);
    let config = EvaluationConfig {
        max_iterations: 4,
        enable_web_search: false,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(50.0)).await;

    assert!(
        output
            .trace
            .steps
            .iter()
            .all(|step| step.action.kind() != ActionKind::SearchWeb)
    );
    assert!(
        harness
            .provider
            .inputs()
            .iter()
            .all(|input| !input.vocabulary.contains(ActionKind::SearchWeb))
    );
    assert!(!output.used_web_search);
    assert_eq!(output.trace.resources_used.web_searches, 0);
    assert_eq!(harness.web.calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.answer, "Use the retry builder. +timeouts");
}

#[tokio::test]
async fn web_search_without_a_collaborator_is_never_offered() {
    let harness = Harness::actions(vec![web(&["q"])]);
    let config = EvaluationConfig {
        enable_web_search: true,
        ..EvaluationConfig::default()
    };

    let output = harness
        .evaluator_without_web(config)
        .evaluate(request(50.0))
        .await;

    let inputs = harness.provider.inputs();
    assert!(!inputs.is_empty());
    assert!(
        inputs
            .iter()
            .all(|input| !input.vocabulary.contains(ActionKind::SearchWeb))
    );
    assert!(!output.used_web_search);
    assert_eq!(output.trace.resources_used.web_searches, 0);
    assert_eq!(harness.web.calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.answer, "Use the retry builder.");
}

#[tokio::test]
async fn document_queries_in_one_step_run_concurrently() {
    let harness = Harness::actions(vec![
        docs(&["x", "y"]),
        EvaluationAction::return_answer("covered"),
    ])
    .retriever(CountingRetriever::slow(Duration::from_millis(20)));

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(harness.retriever.calls(), 2);
    assert_eq!(harness.retriever.in_flight.peak(), 2);
    assert_eq!(output.trace.resources_used.doc_queries, 2);
}

#[tokio::test]
async fn web_searches_in_one_step_run_concurrently() {
    let harness = Harness::actions(vec![
        web(&["a", "b"]),
        EvaluationAction::return_answer("covered"),
    ])
    .web_search(FlakyWeb::failing_on("bad").slow(Duration::from_millis(20)));
    let config = EvaluationConfig {
        enable_web_search: true,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(50.0)).await;

    assert_eq!(harness.web.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.web.in_flight.peak(), 2);
    assert!(output.used_web_search);
    assert_eq!(output.trace.resources_used.web_searches, 2);
}

#[tokio::test]
async fn last_step_memory_records_its_own_queries() {
    let harness = Harness::actions(vec![docs(&["x"]), docs(&["y"]), docs(&["z"])]);
    let config = EvaluationConfig {
        max_iterations: 3,
        max_doc_queries: 10,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(40.0)).await;

    assert_eq!(output.trace.final_action, FinalAction::MaxIterations);
    let last = output.trace.steps.last().expect("three steps");
    assert_eq!(
        last.memory.queries_tried,
        vec!["x".to_string(), "y".to_string(), "z".to_string()]
    );
    for source in &output.sources {
        assert!(
            last.memory.sources_used.iter().any(|used| used.url == source.url),
            "{} missing from final memory",
            source.url
        );
    }
    // The snapshot shown to the provider at step three predates query z.
    let inputs = harness.provider.inputs();
    let shown = inputs[2].memory.as_ref().expect("memory before step three");
    assert!(!shown.queries_tried.contains(&"z".to_string()));
}

#[tokio::test]
async fn failing_web_query_becomes_a_warning() {
    let harness = Harness::actions(vec![
        web(&["good", "bad"]),
        EvaluationAction::return_answer("enough material"),
    ]);
    let config = EvaluationConfig {
        enable_web_search: true,
        ..EvaluationConfig::default()
    };

    let output = harness.evaluator(config).evaluate(request(50.0)).await;

    assert_eq!(output.warnings.len(), 1);
    assert!(output.warnings[0].contains("'bad'"));
    let web_sources: Vec<_> = output
        .sources
        .iter()
        .filter(|source| source.kind == SourceKind::Web)
        .collect();
    assert_eq!(web_sources.len(), 3);
    assert!(web_sources.iter().all(|s| s.url.contains("/good/")));
    assert!(output.used_web_search);
    assert_eq!(output.trace.resources_used.web_searches, 2);
    assert_eq!(output.trace.steps.len(), 2);
    assert_eq!(output.trace.final_action, FinalAction::Returned);
}

#[tokio::test]
async fn failing_document_query_keeps_the_other_results() {
    let retriever = CountingRetriever {
        failing: vec!["broken".into()],
        ..CountingRetriever::default()
    };
    let harness = Harness::actions(vec![
        docs(&["broken", "fine"]),
        EvaluationAction::return_answer("ok"),
    ])
    .retriever(retriever);

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.warnings.len(), 1);
    assert!(output.warnings[0].contains("'broken'"));
    assert!(output.sources.iter().any(|s| s.url == "docs://fine"));
    assert_eq!(output.trace.resources_used.doc_queries, 2);
}

#[tokio::test]
async fn malformed_decision_falls_back_to_return() {
    let harness = Harness::new(vec![ScriptedReply::Raw(
        "I think you should search more, probably.".into(),
    )]);

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert_eq!(output.trace.steps.len(), 1);
    assert_eq!(output.trace.steps[0].action.reason(), FALLBACK_REASON);
    assert_eq!(output.answer, "Use the retry builder.");
    assert_eq!(output.warnings.len(), 1);
    assert_eq!(output.trace.resources_used.llm_calls, 1);
}

#[tokio::test]
async fn provider_error_falls_back_to_return() {
    let harness = Harness::new(vec![ScriptedReply::Error("connection reset".into())]);

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.trace.final_action, FinalAction::Returned);
    assert!(output.warnings[0].contains("connection reset"));
    assert_eq!(output.trace.resources_used.llm_calls, 1);
}

#[tokio::test]
async fn refinement_uses_material_gathered_since_synthesis() {
    let harness = Harness::actions(vec![
        docs(&["x"]),
        EvaluationAction::RefineAnswer {
            focus_areas: vec!["backoff".into()],
            reason: "missing backoff".into(),
        },
        EvaluationAction::return_answer("done"),
    ]);

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.answer, "Use the retry builder. +backoff");
    assert_eq!(output.trace.resources_used.llm_calls, 4);
    assert_eq!(output.trace.resources_used.doc_queries, 1);

    let requests = harness.refiner.requests.lock().unwrap();
    let context_urls: Vec<&str> = requests[0]
        .additional_context
        .iter()
        .map(|snippet| snippet.url.as_str())
        .collect();
    assert_eq!(context_urls, vec!["docs://x"]);
    assert_eq!(
        output.trace.steps[2].current_answer,
        "Use the retry builder. +backoff"
    );
}

#[tokio::test]
async fn failed_refinement_keeps_current_answer() {
    let harness = Harness::actions(vec![
        EvaluationAction::RefineAnswer {
            focus_areas: vec![],
            reason: "polish".into(),
        },
        EvaluationAction::return_answer("done"),
    ])
    .refiner(SuffixRefiner::new(true));

    let output = harness
        .evaluator(EvaluationConfig::default())
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.answer, "Use the retry builder.");
    assert_eq!(output.warnings.len(), 1);
    assert!(output.warnings[0].contains("refinement failed"));
    assert_eq!(output.trace.resources_used.llm_calls, 3);
}

#[tokio::test]
async fn deadline_returns_last_known_answer() {
    let collaborators = Collaborators::new(
        Arc::new(StalledProvider),
        Arc::new(CountingRetriever::default()),
        Arc::new(SuffixRefiner::new(false)),
    );
    let config = EvaluationConfig {
        deadline_ms: 50,
        ..EvaluationConfig::default()
    };

    let output = AnswerEvaluator::new(config, collaborators)
        .evaluate(request(50.0))
        .await;

    assert_eq!(output.trace.final_action, FinalAction::Error);
    assert_eq!(output.answer, "Use the retry builder.");
    assert!(output.warnings.iter().any(|w| w.contains("deadline")));
    assert_eq!(output.trace.resources_used.llm_calls, 1);
}

#[tokio::test]
async fn every_run_gets_a_distinct_run_id() {
    let harness = Harness::actions(vec![EvaluationAction::return_answer("fine")]);
    let evaluator = harness.evaluator(EvaluationConfig::default());
    let first = evaluator.evaluate(request(50.0)).await;
    let second = evaluator.evaluate(request(50.0)).await;
    assert_ne!(first.trace.run_id, second.trace.run_id);
}
