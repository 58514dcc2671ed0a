use std::sync::Arc;
use tracing::{error, info};

mod bus;
mod chat;
mod composer;
mod config;
mod controller;
mod entity;
mod error;
mod http;
mod llm;
mod store;

use llm::{assistant::AssistantProvisioner, openai::OpenAiClient, AssistantSpec, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Settings may come from the real environment instead.
        info!("No .env file loaded: {}", e);
    }

    // RUST_LOG wins; otherwise info and above.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Parley starting...");

    let config = config::Config::from_env()?;

    let bus = Arc::new(bus::EventBus::new());

    info!("Initializing store at {}", config.db_path.display());
    let store = store::SqliteStore::new(&config.db_path).await?;
    store.init().await?;

    let client = OpenAiClient::new(config.openai.clone())?;
    let assistant = Arc::new(AssistantProvisioner::new(AssistantSpec::file_analysis(
        config.assistant_model.clone(),
    )));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(client),
        assistant,
        config.dispatch.clone(),
    ));

    let state = Arc::new(http::ApiState::new(Arc::new(store), dispatcher, bus));
    let reaper = http::spawn_session_reaper(state.clone(), config.session_idle);
    let app = http::router(state);

    info!("Starting HTTP server on port {}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
        res = reaper => {
            if let Err(e) = res {
                error!("Session reaper stopped: {}", e);
            }
        }
    }

    Ok(())
}
