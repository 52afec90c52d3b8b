//! ledger-api - HTTP surface for the ledger record store.
//!
//! The binary in `main.rs` wires configuration, tracing and middleware around
//! the [`router`] defined here.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, put};
use axum::Router;

use ledger_db::{Database, TransactionCoordinator};

pub use auth::{RequireAuth, TokenTable};
pub use config::ApiConfig;
pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub coordinator: TransactionCoordinator,
    pub tokens: Arc<TokenTable>,
    /// Largest accepted request body, in bytes.
    pub body_limit: usize,
}

/// Routes without the outer tracing/CORS layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/:collection",
            get(handlers::list_collection).post(handlers::create_record),
        )
        .route(
            "/api/:collection/:id",
            put(handlers::update_record).delete(handlers::delete_record),
        )
        .layer(DefaultBodyLimit::max(state.body_limit))
        .with_state(state)
}
