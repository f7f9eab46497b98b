//! Ember Server - HTTP API for local LLM inference

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use ember_core::{
    ByteTokenizer, Engine, EngineConfig, HfTokenizer, ModelSpec, ReferenceModel, ServerConfig,
    Tokenizer,
};
use state::AppState;

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    model: ModelSpec,
    /// Directory holding tokenizer.json (or vocab.json + merges.txt);
    /// without it the byte-level tokenizer is used.
    #[serde(default)]
    tokenizer_dir: Option<PathBuf>,
}

fn load_config() -> anyhow::Result<AppConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("ember").required(false))
        .add_source(config::Environment::with_prefix("EMBER").separator("__"))
        .build()?;
    Ok(config.try_deserialize()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_server=debug,ember_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Ember Server");
    let app_config = load_config()?;

    let tokenizer: Arc<dyn Tokenizer> = match &app_config.tokenizer_dir {
        Some(dir) => Arc::new(HfTokenizer::from_path(dir)?),
        None => Arc::new(ByteTokenizer::new()),
    };

    // The bundled model is the deterministic reference implementation;
    // kernel backends plug in through the `ember_core::Model` trait.
    let model = ReferenceModel::new(app_config.model.clone());
    let engine = Engine::new(Box::new(model), app_config.engine.clone())?;
    let state = AppState::new(engine, tokenizer);

    let mut app = api::create_router(state.clone()).layer(TraceLayer::new_for_http());
    if app_config.server.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down engine");
    state.engine.shutdown();
    Ok(())
}
