mod chat;
mod config;

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use finrag_core::{Chunker, CompanyRegistry, TokenizerKind};
use finrag_llm::{LlmClient, LlmProvider};
use finrag_rag::{
    build_index, build_reranker, Analyst, BuildOutcome, BuildSettings, ChunkStore,
    EmbeddingClient, QueryEngine,
};

use crate::chat::{run_chat, write_history};
use crate::config::{load_config, AppConfig, DEFAULT_CONFIG};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "finrag",
    version = VERSION,
    about = "Question answering over 10-K filings"
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Ingest every PDF in the PDF directory and index it, then exit.
    #[arg(long = "build-index", action = ArgAction::SetTrue)]
    build_index: bool,
    /// Reset the collection before indexing.
    #[arg(long, action = ArgAction::SetTrue)]
    rebuild: bool,
    /// Answer one question, print the response as JSON and exit.
    #[arg(long, conflicts_with = "build_index")]
    ask: Option<String>,
    #[arg(long = "pdf-dir")]
    pdf_dir: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    history: Option<PathBuf>,
    #[arg(long = "top-k")]
    top_k: Option<usize>,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    config.apply_env();
    apply_cli_overrides(&mut config, &cli);

    let registry = config.registry();
    let embedder = EmbeddingClient::from_settings(&config.embedding)?;
    let store = ChunkStore::open(&config.paths.db, &config.retrieval.collection, embedder)
        .with_context(|| format!("failed to open store {}", config.paths.db.display()))?;
    info!(
        db = %config.paths.db.display(),
        collection = store.collection(),
        embedding = %store.embedder().label(),
        "store ready"
    );

    if cli.build_index {
        return run_build(&config, &store, &registry, cli.rebuild);
    }

    let engine = QueryEngine::new(
        store,
        build_reranker(&config.rerank)?,
        build_analyst(&config, &registry),
        registry,
        config.engine_config(),
    );

    if let Some(question) = cli.ask.as_deref() {
        let response = engine.ask(question)?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if !engine.has_llm() {
        warn!("no LLM client available; every question will fail until one is configured");
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let turns = run_chat(stdin.lock(), BufWriter::new(stdout.lock()), |q| engine.ask(q))?;
    write_history(&config.paths.history, &turns)?;
    info!(
        turns = turns.len(),
        history = %config.paths.history.display(),
        "chat history saved"
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.pdf_dir {
        config.paths.pdf_dir = dir.clone();
    }
    if let Some(db) = &cli.db {
        config.paths.db = db.clone();
    }
    if let Some(history) = &cli.history {
        config.paths.history = history.clone();
    }
    if let Some(top_k) = cli.top_k {
        config.retrieval.top_k = top_k;
    }
}

fn run_build(
    config: &AppConfig,
    store: &ChunkStore,
    registry: &CompanyRegistry,
    rebuild: bool,
) -> Result<()> {
    let tokenizer = TokenizerKind::from_str(&config.chunking.tokenizer)?;
    let chunker = Chunker::new(tokenizer.build()?, config.chunk_config()?);
    let settings = BuildSettings {
        pdf_dir: config.paths.pdf_dir.clone(),
        artifacts_dir: config.paths.artifacts_dir.clone(),
        rebuild,
    };
    let mut out = io::stdout().lock();
    match build_index(store, &chunker, registry, &settings)? {
        BuildOutcome::EmptyCorpus { pdf_dir } => {
            writeln!(
                out,
                "No PDFs found in {}; nothing was indexed.",
                pdf_dir.display()
            )?;
        }
        BuildOutcome::Indexed(stats) => {
            writeln!(
                out,
                "Indexed {} filings ({} pages, {} chunks) into '{}'. Collection now holds {} chunks.",
                stats.filings,
                stats.pages,
                stats.chunks,
                store.collection(),
                store.count()?
            )?;
        }
    }
    Ok(())
}

/// A missing key or unknown provider leaves the engine without an LLM; the
/// query path then reports it instead of the process failing at startup.
fn build_analyst(config: &AppConfig, registry: &CompanyRegistry) -> Option<Analyst<LlmClient>> {
    let client = LlmProvider::from_str(&config.llm.provider).and_then(|provider| {
        let model = config
            .llm
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        LlmClient::new(provider, model)
    });
    match client {
        Ok(client) => {
            info!(provider = client.provider().as_str(), model = client.model(), "llm ready");
            Some(Analyst::new(client, registry.clone()))
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "llm not available");
            None
        }
    }
}
