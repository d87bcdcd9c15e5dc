//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - public health route
//! - API-key-protected generation surface (`/generate`, `/status/{id}`)
//! - bearer-token-protected operator and worker-callback surfaces
//! - optional Swagger UI (disable with `KILN_ENABLE_SWAGGER=false`)
//! - CORS and trace-id middleware layers

pub mod admin;
pub mod doc;
pub mod generate;
pub mod health;
pub mod internal;
pub mod status;

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{auth, cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let generation_api = Router::new()
        .merge(generate::router())
        .merge(status::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let operator_api = Router::new()
        .nest("/admin", admin::router())
        .merge(internal::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_token,
        ));

    let mut app = Router::new()
        .merge(health::router())
        .merge(generation_api)
        .merge(operator_api);

    // Enabled by default; disable with KILN_ENABLE_SWAGGER=false in
    // production to avoid exposing the API structure.
    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}

// ── Test fixtures ─────────────────────────────────────────────────────────────
