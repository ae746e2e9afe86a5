//! Rebuild the documentation corpus used for retrieval.
//!
//! Usage: `index_docs [DOCS_DIR]` (defaults to `docs/denmark-living`).
//! Reads the same environment as the server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use localdesk::config::ServerConfig;
use localdesk::indexer::DocumentIndexer;
use localdesk::llm::create_provider;
use localdesk::store::{Database, LibSqlBackend};

const DEFAULT_DOCS_DIR: &str = "docs/denmark-living";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let docs_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCS_DIR));
    let config = ServerConfig::from_env();
    let llm_config = config
        .llm_config()
        .context("OPENAI_API_KEY must be set to embed documentation")?;

    eprintln!("Indexing {}", docs_dir.display());
    eprintln!("   Embedding model: {}", llm_config.embedding_model);
    eprintln!("   Database: {}", config.db_path.display());

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let provider = create_provider(&llm_config).context("Failed to create embedding provider")?;

    let report = DocumentIndexer::new(provider, store)
        .index_directory(&docs_dir)
        .await
        .context("Indexing failed")?;

    eprintln!(
        "Done: {}/{} files, {} chunks stored, {} failed",
        report.files_indexed, report.files_found, report.chunks_indexed, report.chunks_failed
    );
    Ok(())
}
