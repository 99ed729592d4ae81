//! HTTP gateway: routing, decision middleware, and upstream forwarding.

pub mod middleware;
pub mod proxy;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::events::EventSink;
use crate::health;
use crate::token::SignatureValidator;

pub use middleware::{decision_middleware, AuthContext, GatewayState};

impl GatewayState {
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        let validator = Arc::new(SignatureValidator::new(&config));
        Self {
            config: Arc::new(config),
            validator,
            sink,
        }
    }
}

/// Builds the gateway router. Every non-infrastructure route passes through
/// the decision middleware before reaching the upstream proxy.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::health_check))
        .route("/health/live", get(health::health_check))
        .route("/metrics", get(health::metrics_endpoint))
        .route("/version", get(health::version_info))
        .fallback(proxy::forward)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            decision_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
