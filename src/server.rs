use axum::{http::StatusCode, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use akvarium::config;
use akvarium::db::Db;
use akvarium::detector::Detector;
use akvarium::docker::{Engine, EngineError, SharedEngine};
use akvarium::lifecycle::Controller;

mod admin;
mod user;

pub struct AppState {
    pub db: Db,
    pub engine: SharedEngine,
    pub controller: Controller,
    pub detector: Detector,
    pub config: config::Root,
}

impl AppState {
    /// Clones the engine out of the slot so no lock is held across calls.
    pub async fn engine(&self) -> Result<Engine, EngineError> {
        self.engine
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::Connect("engine not initialized".to_string()))
    }
}

pub async fn run(addr: std::net::SocketAddr, state: Arc<AppState>) {
    let app = Router::new()
        .route("/ping", get(|| async { (StatusCode::OK, "pong") }))
        .nest("/admin", admin::router(Arc::clone(&state)))
        .merge(user::router(state))
        .layer(CorsLayer::new().allow_methods(Any).allow_origin(Any));

    tracing::info!("webserver started on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
