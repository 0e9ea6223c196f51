use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ragloop_core::{
    AnswerPipeline, ConfigLoader, DynRetriever, InMemoryRetriever, IngestDocument, RunLogAnalyzer,
    TelemetryOptions, init_telemetry, persist_trace,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[cfg(feature = "qdrant-retriever")]
use ragloop_core::retrieval::{HybridRetriever, QdrantConfig};

const DOC_EXTENSIONS: [&str; 3] = ["md", "txt", "rst"];

#[derive(Parser, Debug)]
#[command(
    name = "ragloop",
    version,
    about = "Answer questions from documentation with a self-correcting evaluation loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a question against local documents or a Qdrant collection.
    Ask(AskArgs),
    /// Summarise a run log written by previous `ask` invocations.
    Stats(StatsArgs),
    /// Ingest local documents into a Qdrant collection.
    Ingest(IngestArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Question to answer.
    question: String,

    /// Path to `ragloop.toml` (defaults to `RAGLOOP_CONFIG` or `./ragloop.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// File or directory of documents to search in memory.
    #[arg(long)]
    docs: Option<PathBuf>,

    /// Recurse into subdirectories of `--docs`.
    #[arg(long, default_value_t = true)]
    recursive: bool,

    /// Qdrant endpoint; overrides `retrieval.qdrant_url`.
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Override `evaluation.max_iterations`.
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Enable web search for this run regardless of configuration.
    #[arg(long)]
    web: bool,

    /// Directory to persist the evaluation trace as JSON.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Also print the trace as a Mermaid flowchart.
    #[arg(long)]
    mermaid: bool,

    /// Print the full output as JSON instead of Markdown.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Path to a `runs.jsonl` file.
    #[arg(long)]
    log: PathBuf,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// File or directory to ingest (text files expected).
    #[arg(long)]
    path: PathBuf,

    /// Project namespace the documents belong to.
    #[arg(long, default_value = "default")]
    project: String,

    /// Recurse into subdirectories when ingesting.
    #[arg(long, default_value_t = true)]
    recursive: bool,

    /// Qdrant endpoint hosting the vector collection.
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Name of the Qdrant collection to upsert into.
    #[arg(long, default_value = "ragloop")]
    qdrant_collection: String,

    /// Maximum concurrent Qdrant operations.
    #[arg(long, default_value_t = 8)]
    qdrant_concurrency: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Ask(args) => ask_command(args).await?,
            Command::Stats(args) => {
                init_telemetry(TelemetryOptions::default())?;
                stats_command(args)?
            }
            Command::Ingest(args) => {
                init_telemetry(TelemetryOptions::default())?;
                ingest_command(args).await?
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn ask_command(args: AskArgs) -> Result<()> {
    let loaded = ConfigLoader::load(args.config.clone());
    let options = match &loaded {
        Ok(config) => config.logging.telemetry_options(),
        Err(_) => TelemetryOptions::default(),
    };
    init_telemetry(options)?;

    let mut config = loaded?;
    if let Some(max_iterations) = args.max_iterations {
        config.evaluation.max_iterations = max_iterations;
    }
    if args.web {
        config.evaluation.enable_web_search = true;
    }
    config.evaluation.validate()?;

    let qdrant_url = args
        .qdrant_url
        .clone()
        .or_else(|| config.retrieval.qdrant_url.clone());
    let retriever = build_retriever(&args, &config, qdrant_url).await?;

    info!(question = %args.question, "answering");
    let pipeline = AnswerPipeline::from_config(&config, retriever)?;
    let output = pipeline.answer(&args.question).await?;

    if let Some(dir) = &args.trace_dir {
        let path = persist_trace(dir, &output.trace)?;
        info!(path = %path.display(), "trace persisted");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let summary = output.trace.summary();
    println!("{}", output.render_markdown());
    println!("{}", summary.render_markdown());
    if args.mermaid {
        println!("```mermaid\n{}```", summary.render_mermaid());
    }
    Ok(())
}

#[cfg(feature = "qdrant-retriever")]
async fn build_retriever(
    args: &AskArgs,
    config: &ragloop_core::Config,
    qdrant_url: Option<String>,
) -> Result<DynRetriever> {
    if let Some(url) = qdrant_url {
        let retriever = HybridRetriever::new(QdrantConfig {
            url,
            collection: config.retrieval.qdrant_collection.clone(),
            concurrency_limit: config.retrieval.qdrant_concurrency,
        })
        .await?;
        return Ok(Arc::new(retriever));
    }
    in_memory_retriever(args, config.retrieval.project.as_deref())
}

#[cfg(not(feature = "qdrant-retriever"))]
async fn build_retriever(
    args: &AskArgs,
    config: &ragloop_core::Config,
    qdrant_url: Option<String>,
) -> Result<DynRetriever> {
    if qdrant_url.is_some() {
        warn!("qdrant retriever feature not enabled; falling back to in-memory retrieval");
    }
    in_memory_retriever(args, config.retrieval.project.as_deref())
}

fn in_memory_retriever(args: &AskArgs, project: Option<&str>) -> Result<DynRetriever> {
    let retriever = InMemoryRetriever::new();
    match &args.docs {
        Some(path) => {
            let documents = collect_documents(path, args.recursive)?;
            info!(count = documents.len(), path = %path.display(), "loaded documents");
            retriever.ingest(project, documents);
        }
        None => warn!("no --docs given and no Qdrant endpoint configured; retrieval is empty"),
    }
    Ok(Arc::new(retriever))
}

fn stats_command(args: StatsArgs) -> Result<()> {
    let stats = RunLogAnalyzer::analyze(&args.log)?;
    println!("{}", stats.summary());
    for (action, count) in &stats.by_final_action {
        println!("  {action}: {count}");
    }
    if !stats.failures.is_empty() {
        println!("  failed runs: {}", stats.failures.join(", "));
    }
    Ok(())
}

#[cfg(feature = "qdrant-retriever")]
async fn ingest_command(args: IngestArgs) -> Result<()> {
    let Some(qdrant_url) = args.qdrant_url else {
        warn!("no Qdrant URL provided; ingestion skipped");
        return Ok(());
    };

    let documents = collect_documents(&args.path, args.recursive)?;
    if documents.is_empty() {
        info!(path = %args.path.display(), "no documents matched ingestion criteria");
        return Ok(());
    }

    let retriever = HybridRetriever::new(QdrantConfig {
        url: qdrant_url,
        collection: args.qdrant_collection,
        concurrency_limit: args.qdrant_concurrency,
    })
    .await?;
    let count = documents.len();
    retriever.ingest(&args.project, documents).await?;
    info!(count, project = %args.project, "ingestion complete");
    Ok(())
}

#[cfg(not(feature = "qdrant-retriever"))]
async fn ingest_command(_args: IngestArgs) -> Result<()> {
    warn!(
        "qdrant retriever feature not enabled; ingestion requires building with `--features ragloop-cli/qdrant-retriever`"
    );
    Ok(())
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| DOC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn document_title(path: &Path, text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| path.display().to_string())
}

fn collect_documents(path: &Path, recursive: bool) -> Result<Vec<IngestDocument>> {
    let mut docs = Vec::new();
    let entries: Box<dyn Iterator<Item = PathBuf>> = if path.is_file() {
        Box::new(std::iter::once(path.to_path_buf()))
    } else {
        let walker = WalkDir::new(path)
            .min_depth(0)
            .max_depth(if recursive { usize::MAX } else { 1 });
        Box::new(
            walker
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| is_document(path)),
        )
    };

    for file in entries {
        let text = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        if text.trim().is_empty() {
            continue;
        }
        docs.push(IngestDocument {
            id: Uuid::new_v4().to_string(),
            url: format!("file://{}", file.display()),
            title: document_title(&file, &text),
            text,
        });
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_prefers_first_heading() {
        let path = Path::new("docs/runtime.md");
        assert_eq!(document_title(path, "intro\n# Runtime Guide\nbody"), "Runtime Guide");
        assert_eq!(document_title(path, "no heading here"), "runtime");
    }

    #[test]
    fn only_text_documents_are_collected() {
        assert!(is_document(Path::new("a/b.MD")));
        assert!(is_document(Path::new("notes.txt")));
        assert!(!is_document(Path::new("image.png")));
        assert!(!is_document(Path::new("Makefile")));
    }
}
