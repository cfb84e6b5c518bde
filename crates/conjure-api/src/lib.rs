//! Conjure API - The request front door
//!
//! Every external request passes the same pipeline: authenticate, rate
//! limit, resolve and validate against the tool registry, quote, then hand
//! to the execution engine or spell runner. Errors use one envelope across
//! all endpoints:
//!
//! ```json
//! { "error": { "code": "<STABLE_CODE>", "message": "...", "request_id": "..." } }
//! ```

pub mod error;
pub mod extract;
pub mod handlers;
pub mod state;
pub mod validate;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::{ApiConfig, AppState};

/// Build the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Generations
        .route("/generations/execute", post(handlers::generations::execute))
        .route("/generations/status", post(handlers::generations::batch_status))
        .route("/generations/:id", get(handlers::generations::get_one))
        .route("/generations/:id/cancel", post(handlers::generations::cancel))
        // Spells
        .route("/spells/cast", post(handlers::spells::cast))
        .route("/spells/casts/:id", get(handlers::spells::get_cast))
        .route("/spells/casts/:id/cancel", post(handlers::spells::cancel_cast))
        // Tools
        .route("/tools", get(handlers::tools::list))
        .route("/tools/:id", get(handlers::tools::get_one))
        // Wallet linking
        .route("/wallets/link/initiate", post(handlers::wallets::initiate_link))
        .route(
            "/wallets/link/status/:request_id",
            get(handlers::wallets::link_status),
        )
        // One-shot payments
        .route("/x402/execute", post(handlers::x402::execute))
        // Inbound backend callbacks
        .route(
            "/callbacks/backend/:job_id",
            post(handlers::generations::backend_callback),
        )
        // Operations
        .route("/health", get(handlers::admin::health))
        .route("/admin/tools/reload", post(handlers::admin::reload_tools))
        .route(
            "/admin/deliveries/:id/reissue",
            post(handlers::admin::reissue_delivery),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
