use std::sync::Arc;

use anyhow::Context;
use localdesk::chat::ChatService;
use localdesk::config::ServerConfig;
use localdesk::llm::{LlmProvider, create_provider};
use localdesk::retrieval::EmbeddingRetriever;
use localdesk::server::build_router;
use localdesk::store::{Database, LibSqlBackend};
use localdesk::tools::{ModifyRoadmapTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env();

    eprintln!("localdesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Chat API: http://0.0.0.0:{}/chat", config.port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Tools ────────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    tools
        .register(Arc::new(ModifyRoadmapTool::new(Arc::clone(&db))))
        .await;

    // ── LLM + retrieval ──────────────────────────────────────────────────
    let mut service = ChatService::new(Arc::clone(&db), tools).with_max_steps(config.max_steps);
    match config.llm_config() {
        Some(llm_config) => {
            let provider =
                create_provider(&llm_config).context("Failed to create LLM provider")?;
            let retriever = EmbeddingRetriever::new(provider.clone(), Arc::clone(&db))
                .with_threshold(config.match_threshold)
                .with_count(config.match_count);
            service = service
                .with_provider(Some(provider as Arc<dyn LlmProvider>))
                .with_retriever(Arc::new(retriever));
        }
        None => {
            eprintln!("   Warning: OPENAI_API_KEY not set, /chat will return errors");
            tracing::warn!("OPENAI_API_KEY not configured");
        }
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = build_router(Arc::new(service), db);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
