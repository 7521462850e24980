use std::sync::Arc;

use axum::{Router, middleware};
use tower_http::cors::{Any, CorsLayer};

use chat_stream::AppState;
use chat_stream::handlers::{
    auth_middleware, chat_stream_cancel, chat_stream_handler, chat_stream_resume, health_check,
};
use chat_stream::init::app_init;

fn create_app_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/api/chat/stream",
            axum::routing::post(chat_stream_handler),
        )
        .route(
            "/api/chat/stream/{session_id}",
            axum::routing::get(chat_stream_resume).delete(chat_stream_cancel),
        )
        .route_layer(middleware::from_fn(auth_middleware));

    Router::new()
        .merge(api)
        .route("/health", axum::routing::get(health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([axum::http::HeaderName::from_static(
                    chat_stream::handlers::STREAM_SESSION_HEADER,
                )]),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting chat stream server...");
    dotenv::dotenv().ok();
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");

    let reaper = state.service.sessions().spawn_reaper();
    let app = create_app_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Stream: http://{}/api/chat/stream", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");
    log::info!("💾 Event log: {}", config.store);
    if let Some(s3) = &config.s3 {
        log::info!("🪣 Bucket: {} ({})", s3.bucket, s3.region);
        if let Some(ep) = &s3.endpoint {
            log::info!("🔌 Endpoint: {}", ep);
        }
    }
    log::info!("🤖 Model: {} at {}", config.chat_model, config.ollama_url);
    log::info!(
        "⏳ Grace period: {}s, attach timeout: {}ms",
        config.session.grace_period.as_secs(),
        config.session.attach_timeout.as_millis()
    );
    log::info!("");

    axum::serve(listener, app).await?;
    reaper.abort();

    Ok(())
}
