//! Collaborative document editing server: REST API for users and
//! documents, WebSocket endpoint for live editing sessions.

mod api;
mod auth;
mod config;
mod storage;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use collab::cache::{MemoryCache, SessionCache};
use collab::registry::Registry;
use collab::store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::storage::JsonStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "collab_server=debug,collab=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Arc::new(Config::load());
    info!(?config, "starting collab-server");

    let store: Arc<dyn Store> = Arc::new(JsonStore::new(&config.data_dir)?);
    let cache: Arc<dyn SessionCache> = Arc::new(MemoryCache::new());
    let registry = Registry::new(Arc::clone(&store), cache);

    let state = AppState {
        store,
        registry,
        config: Arc::clone(&config),
    };

    let authed = Router::new()
        .route("/api/documents", post(api::create_document))
        .route("/api/documents/:document_id", get(api::get_document))
        .route(
            "/api/documents/:document_id/share",
            post(api::share_document),
        )
        .route("/ws/doc/:document_id", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let app = Router::new()
        .route("/api/register", post(api::register))
        .route("/api/login", post(api::login))
        .merge(authed)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
