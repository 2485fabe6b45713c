use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use atrium::clock::{Clock, SystemClock};
use atrium::config::Settings;
use atrium::embeddings::GeminiEmbeddings;
use atrium::governor::ToolUsageGovernor;
use atrium::http::{AppState, router};
use atrium::ingest::{Ingestor, PdfExtractor};
use atrium::limiter::RateLimiter;
use atrium::llm::gemini::GeminiChat;
use atrium::pipeline::ChatPipeline;
use atrium::retrieval::Retriever;
use atrium::store;
use atrium::store::context::ContextStore;
use atrium::store::sessions::SessionStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(err) = dotenvy::dotenv() {
        // Absent .env is the normal case in production.
        if !err.not_found() {
            eprintln!("warning: could not load .env: {err}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(addr = %settings.bind_addr, model = %settings.chat_model, "starting atrium");

    let pool = store::connect(&settings.database_url).await?;
    store::init_schema(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(RateLimiter::new(&settings.rate_limit, clock.clone()));
    let governor = Arc::new(ToolUsageGovernor::new(&settings.governor, clock.clone()));

    let embedder = Arc::new(GeminiEmbeddings::new(
        settings.gemini_api_key.clone(),
        settings.embedding_model.clone(),
    ));
    let model = Arc::new(GeminiChat::new(
        settings.gemini_api_key.clone(),
        settings.chat_model.clone(),
    ));

    let context = ContextStore::new(pool.clone());
    let sessions = SessionStore::new(pool.clone(), clock.clone());
    let retriever = Retriever::new(context.clone(), embedder.clone(), &settings.retrieval);
    let ingestor = Arc::new(Ingestor::new(
        context,
        embedder,
        Arc::new(PdfExtractor),
        settings.chunking.clone(),
    ));
    let pipeline = Arc::new(ChatPipeline::new(
        sessions.clone(),
        retriever,
        governor.clone(),
        model,
        settings.owner_name.clone(),
        settings.history_window,
        settings.max_tool_steps,
    ));

    spawn_sweeper(
        "rate limiter",
        settings.rate_limit.sweep_interval_secs,
        limiter.clone(),
        |limiter| limiter.sweep(),
    );
    spawn_sweeper(
        "tool governor",
        settings.governor.sweep_interval_secs,
        governor.clone(),
        |governor| governor.sweep(),
    );

    let app = router(AppState {
        limiter,
        governor,
        pipeline,
        sessions,
        ingestor,
    });

    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                error!(error = %err, "server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

/// Periodically evict expired in-memory entries.
fn spawn_sweeper<T>(
    name: &'static str,
    interval_secs: u64,
    target: Arc<T>,
    sweep: impl Fn(&T) -> usize + Send + 'static,
) where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep(&target);
            if removed > 0 {
                debug!(sweeper = name, removed, "evicted stale entries");
            }
        }
    });
}
