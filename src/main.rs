use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use quarry_core::{Config, Quarry, resolve_config_path};
use quarry_index::{
    IndexError, IndexOptions, IndexingSession, RetrievalStrategy, RetrievedCode, format_as_context,
};
use quarry_llm::EmbeddingProvider;
use serde_json::json;

const SNIPPET_LINES: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(about = "Incremental semantic code index with lexical fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Config file (default: $QUARRY_CONFIG, then ./quarry.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a project; unchanged files are skipped
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Re-embed every file even if its content is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Index a project, then keep it fresh until interrupted
    Watch {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Search an indexed project
    Search {
        query: String,
        /// Any directory inside the project
        #[arg(long, short = 'p', default_value = ".")]
        path: PathBuf,
        #[arg(long, short = 'k', default_value_t = 10)]
        limit: usize,
        /// Print results as an XML context block
        #[arg(long)]
        context: bool,
    },
    /// Show index statistics and provider health
    Stats {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    config.validate().context("invalid configuration")?;
    let quarry = Quarry::build(config).await?;

    match cli.command {
        Command::Index { path, force } => run_index(&quarry, &path, force, cli.json).await,
        Command::Watch { path } => run_watch(&quarry, &path, cli.json).await,
        Command::Search {
            query,
            path,
            limit,
            context,
        } => run_search(&quarry, &path, &query, limit, context, cli.json).await,
        Command::Stats { path } => run_stats(&quarry, &path, cli.json).await,
    }
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn run_index(quarry: &Quarry, path: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    match quarry
        .coordinator()
        .index_project(path, IndexOptions { force })
        .await
    {
        Ok(session) => print_session(&session, json),
        Err(IndexError::SessionFailed { session, source }) => {
            print_session(&session, json)?;
            Err(anyhow::Error::new(*source).context("indexing failed"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_session(session: &IndexingSession, json: bool) -> anyhow::Result<()> {
    let elapsed_ms = u64::try_from(session.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
    if json {
        let errors: Vec<_> = session
            .errors()
            .iter()
            .map(|e| json!({ "path": e.path, "message": e.message }))
            .collect();
        let out = json!({
            "session": session.id.to_string(),
            "project": session.project_id,
            "status": session.status().as_str(),
            "files_found": session.files_found,
            "files_processed": session.files_processed,
            "files_skipped": session.files_skipped,
            "files_removed": session.files_removed,
            "chunks_created": session.chunks_created,
            "symbols_extracted": session.symbols_extracted,
            "embeddings": session.embeddings,
            "migrated": session.migrated,
            "elapsed_ms": elapsed_ms,
            "errors": errors,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("project   {}", session.project_id);
    println!("status    {}", session.status());
    println!(
        "files     {} found, {} processed, {} unchanged, {} removed",
        session.files_found, session.files_processed, session.files_skipped, session.files_removed
    );
    println!(
        "chunks    {} created, {} embedded, {} symbols",
        session.chunks_created, session.embeddings, session.symbols_extracted
    );
    if session.migrated {
        println!("model     changed; project re-embedded");
    }
    println!("elapsed   {elapsed_ms} ms");
    if session.is_degraded() {
        println!("errors    {}", session.errors().len());
        for error in session.errors() {
            println!("  {error}");
        }
    }
    Ok(())
}

async fn run_watch(quarry: &Quarry, path: &Path, json: bool) -> anyhow::Result<()> {
    run_index(quarry, path, false, json).await?;

    let watcher = quarry.watcher();
    let project = watcher.watch(path).await?;
    tracing::info!(
        project = %project.id,
        root = %project.workspace_root.display(),
        "watching for changes, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    watcher.shutdown().await;
    Ok(())
}

async fn run_search(
    quarry: &Quarry,
    path: &Path,
    query: &str,
    limit: usize,
    context: bool,
    json: bool,
) -> anyhow::Result<()> {
    let project = quarry.open_project(path).await?;
    let result = quarry.retriever().retrieve(&project.id, query, limit).await?;

    if result.strategy == RetrievalStrategy::LexicalOnly {
        tracing::warn!("no embedding provider available, showing keyword matches only");
    }
    if context {
        println!("{}", format_as_context(&result));
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&results_json(&result))?);
        return Ok(());
    }

    if result.chunks.is_empty() {
        println!("no results");
        return Ok(());
    }
    for (rank, chunk) in result.chunks.iter().enumerate() {
        let via = match (chunk.semantic, chunk.lexical) {
            (true, true) => "semantic+lexical",
            (true, false) => "semantic",
            _ => "lexical",
        };
        println!("{:>2}. {}  [{:.4}, {via}]", rank + 1, chunk.header(), chunk.score);
        for line in chunk.content.lines().take(SNIPPET_LINES) {
            println!("      {line}");
        }
    }
    Ok(())
}

fn results_json(result: &RetrievedCode) -> serde_json::Value {
    let strategy = match result.strategy {
        RetrievalStrategy::Hybrid => "hybrid",
        RetrievalStrategy::LexicalOnly => "lexical",
    };
    let chunks: Vec<_> = result
        .chunks
        .iter()
        .map(|c| {
            json!({
                "file": c.file_path,
                "start_line": c.start_line,
                "end_line": c.end_line,
                "symbol": c.symbol_name,
                "score": c.score,
                "semantic": c.semantic,
                "lexical": c.lexical,
                "content": c.content,
            })
        })
        .collect();
    json!({ "strategy": strategy, "results": chunks })
}

async fn run_stats(quarry: &Quarry, path: &Path, json: bool) -> anyhow::Result<()> {
    let project = quarry.open_project(path).await?;
    let status = quarry.coordinator().stats(&project.id).await?;
    let active = quarry.pipeline().active_signature();
    let providers: Vec<_> = quarry
        .pipeline()
        .providers()
        .iter()
        .map(|p| {
            let health = quarry.health().snapshot(p.name());
            json!({
                "provider": p.signature().to_string(),
                "state": health.state.to_string(),
                "failures": health.failure_count,
                "rate_limit_hits": health.rate_limit_hits,
                "concurrency": health.recommended_concurrency,
            })
        })
        .collect();

    if json {
        let out = json!({
            "project": project.id,
            "root": project.workspace_root,
            "status": status,
            "active_model": active.map(|s| s.to_string()),
            "providers": providers,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("project   {} ({})", project.name, project.id);
    println!("root      {}", project.workspace_root.display());
    println!(
        "store     {} files, {} chunks",
        status.store.total_files, status.store.total_chunks
    );
    if let Some(updated) = status.store.last_updated {
        println!("updated   {}", updated.to_rfc3339());
    }
    println!(
        "lexical   {} files, {} chunks, {} symbols",
        status.lexical.files, status.lexical.chunks, status.lexical.symbols
    );
    match active {
        Some(signature) => println!("model     {signature}"),
        None => println!("model     none available"),
    }
    for p in &providers {
        println!(
            "provider  {} {} (failures {}, concurrency {})",
            p["provider"].as_str().unwrap_or_default(),
            p["state"].as_str().unwrap_or_default(),
            p["failures"],
            p["concurrency"],
        );
    }
    Ok(())
}
