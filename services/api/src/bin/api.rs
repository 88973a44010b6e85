//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, JwtIdentityVerifier, OpenAiTextAdapter, StableDiffusionAdapter},
    config::Config,
    error::ApiError,
    web::{api_router, rest::ApiDoc, state::AppState},
    workers::spawn_workers,
};
use async_openai::{config::OpenAIConfig, Client};
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use axum::Router;
use goodnight_core::{
    clock::{Clock, SystemClock},
    lifecycle::{GenerationSettings, LifecycleEngine},
    memory::InMemoryUserStore,
    ports::{UserStore, TextGenerationService},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    let store: Arc<dyn UserStore> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            let db_adapter = DbAdapter::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set; users are kept in memory and lost on restart");
            Arc::new(InMemoryUserStore::new())
        }
    };

    // --- 3. Initialize Service Adapters ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let openai_client =
        Client::with_config(OpenAIConfig::new().with_api_key(config.openai_api_key.clone()));
    let text_adapter: Arc<dyn TextGenerationService> = Arc::new(OpenAiTextAdapter::new(
        openai_client,
        config.text_model.clone(),
    ));

    let image_adapter = Arc::new(StableDiffusionAdapter::new(
        config.image_api_base_url.clone(),
        config.image_api_key.clone(),
        config.image_model_id.clone(),
        config.gateway_timeout,
        clock.clone(),
    )?);

    let identity = Arc::new(JwtIdentityVerifier::new(&config.identity)?);

    // --- 4. Start the Lifecycle Workers ---
    let settings = GenerationSettings {
        gateway_timeout: config.gateway_timeout,
        ..GenerationSettings::default()
    };
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        text_adapter.clone(),
        image_adapter,
        clock.clone(),
        settings,
    ));
    let shutdown = CancellationToken::new();
    let workers = spawn_workers(
        engine,
        &config.worker_intervals,
        config.auto_story_requests,
        shutdown.clone(),
    );
    info!(count = workers.len(), "Lifecycle workers running");

    // --- 5. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        store,
        identity,
        text_adapter,
        clock,
        gateway_timeout: config.gateway_timeout,
    });

    // --- 6. Create the Web Router ---
    let allow_origin = match config.cors_allowed_origin.clone() {
        Some(origin) => AllowOrigin::exact(origin),
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // --- 8. Let in-flight worker ticks finish ---
    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        // Without a signal handler the server runs until the process is killed.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
