use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

use crate::trace::{FinalAction, ResourceUsage};

struct EvaluationMetrics {
    runs: Counter<u64>,
    steps: Histogram<u64>,
    duration_ms: Histogram<f64>,
    collaborator_calls: Counter<u64>,
}

static METRICS: OnceCell<EvaluationMetrics> = OnceCell::new();

fn handles() -> &'static EvaluationMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("ragloop.evaluation");
        EvaluationMetrics {
            runs: meter
                .u64_counter("evaluation_runs_total")
                .with_description("Evaluation runs by final action")
                .init(),
            steps: meter
                .u64_histogram("evaluation_steps")
                .with_description("Decision steps taken per evaluation run")
                .init(),
            duration_ms: meter
                .f64_histogram("evaluation_duration_ms")
                .with_description("Evaluation loop wall-clock time in milliseconds")
                .init(),
            collaborator_calls: meter
                .u64_counter("evaluation_collaborator_calls_total")
                .with_description("Collaborator calls issued by the evaluation loop")
                .init(),
        }
    })
}

/// Record OTEL metrics for a finished run (no-op if no provider installed).
pub fn record_evaluation_metrics(
    final_action: FinalAction,
    steps: usize,
    duration_ms: u64,
    usage: &ResourceUsage,
) {
    let metrics = handles();
    let attrs = [KeyValue::new("final_action", final_action.as_str())];

    metrics.runs.add(1, &attrs);
    metrics.steps.record(steps as u64, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);

    for (kind, count) in [
        ("llm", usage.llm_calls),
        ("doc_query", usage.doc_queries),
        ("web_search", usage.web_searches),
    ] {
        if count > 0 {
            metrics
                .collaborator_calls
                .add(count as u64, &[KeyValue::new("kind", kind)]);
        }
    }
}
