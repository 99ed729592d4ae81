//! Upstream forwarding for authorized traffic.
//!
//! Requests that survive the decision middleware are relayed verbatim to the
//! configured upstream, including the trusted identity headers the middleware
//! attached. Without an upstream the gateway answers 404 itself, which keeps
//! the token state machine usable standalone.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use serde_json::json;

use super::middleware::GatewayState;

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

// Connection-scoped headers that must not be relayed
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

pub async fn forward(State(state): State<GatewayState>, request: Request<Body>) -> Response {
    let Some(upstream) = state.config.upstream_url.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no upstream configured for this path" })),
        )
            .into_response();
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{}{}", upstream.trim_end_matches('/'), path_and_query);

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, 2 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unreadable request body: {}", e) })),
            )
                .into_response();
        }
    };

    let mut headers = parts.headers;
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let upstream_response = HTTP_CLIENT
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream_response {
        Ok(resp) => {
            let status = resp.status();
            let mut headers = resp.headers().clone();
            for name in HOP_BY_HOP {
                headers.remove(name);
            }
            match resp.bytes().await {
                Ok(bytes) => {
                    let mut response = Response::new(Body::from(bytes));
                    *response.status_mut() = status;
                    *response.headers_mut() = headers;
                    response
                }
                Err(e) => {
                    tracing::error!(error = %e, url = %url, "Failed to read upstream body");
                    (
                        StatusCode::BAD_GATEWAY,
                        Json(json!({ "error": "upstream returned an unreadable body" })),
                    )
                        .into_response()
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, url = %url, "Upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "upstream unavailable" })),
            )
                .into_response()
        }
    }
}
