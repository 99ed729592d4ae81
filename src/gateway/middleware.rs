//! The decision middleware: every request either carries a valid post-auth
//! token and is forwarded, or is redirected to the auth backend with a fresh
//! pre-auth token. Each decision emits exactly one event; a request with a
//! rejected token makes two decisions and therefore two events.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{HeaderName, HeaderValue, LOCATION, USER_AGENT},
        Request, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::events::{Action, Event, EventSink, Status};
use crate::metrics;
use crate::token::signature;
use crate::token::{codec, SignatureValidator, Validation};
use crate::utils::{classify_device_type, extract_client_ip};

pub const AUTH_TOKEN_HEADER: HeaderName = HeaderName::from_static("auth_token");
pub const E_TOKEN_HEADER: HeaderName = HeaderName::from_static("e_token");
pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("session_id");
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
pub const TENANT_ID_HEADER: HeaderName = HeaderName::from_static("x-tenant-id");

/// Infrastructure endpoints exempt from the token state machine.
const PUBLIC_ENDPOINTS: &[&str] = &["/health", "/health/ready", "/health/live", "/metrics", "/version"];

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub validator: Arc<SignatureValidator>,
    pub sink: Arc<dyn EventSink>,
}

/// Authenticated identity, attached to request extensions for downstream
/// handlers after a token is accepted.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub user_id: Option<i64>,
    pub token_id: String,
}

pub fn is_public_endpoint(path: &str) -> bool {
    PUBLIC_ENDPOINTS.contains(&path)
}

/// Extracts the tenant from `/api/v{n}/{tenant_id}/...` paths. Requests whose
/// path does not match are attributed to the configured fallback tenant.
pub fn extract_tenant(path: &str, fallback: &str) -> String {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let (api, version, tenant) = (segments.next(), segments.next(), segments.next());

    match (api, version, tenant) {
        (Some("api"), Some(version), Some(tenant))
            if version.len() > 1
                && version.starts_with('v')
                && version[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            tenant.to_string()
        }
        _ => fallback.to_string(),
    }
}

pub async fn decision_middleware(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_public_endpoint(&path) {
        return next.run(request).await;
    }

    // Populated by into_make_service_with_connect_info; absent under test
    // harnesses driving the router directly.
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let headers = request.headers();
    let client_ip = extract_client_ip(headers, peer);
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let device_type = classify_device_type(user_agent.as_deref()).to_string();
    let session_id = headers
        .get(&SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let query = request.uri().query().map(str::to_string);
    let tenant = extract_tenant(&path, &state.config.fallback_tenant);
    let auth_token = headers
        .get(&AUTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let base_event = |action: Action| {
        let mut event = Event::new(action, client_ip.clone(), path.clone());
        event.user_agent = user_agent.clone();
        event.device_type = Some(device_type.clone());
        event.query = query.clone();
        event.session_id = Some(session_id.clone());
        event.tenant_id = Some(tenant.clone());
        event
    };

    if let Some(token) = auth_token {
        match state.validator.validate(&token, &tenant, Utc::now()) {
            Validation::Accepted {
                tenant_id,
                user_id,
                token_id,
            } => {
                metrics::VALIDATIONS_PASSED_TOTAL.inc();

                let mut event = base_event(Action::TokenValidated);
                event.status = Some(Status::Pass);
                event.user_id = user_id;
                event.token_id = Some(token_id.clone());
                publish(&state, event).await;

                // Trust boundary: identity headers are always set by the
                // gateway, never inherited from the caller.
                let headers = request.headers_mut();
                headers.remove(&USER_ID_HEADER);
                headers.remove(&TENANT_ID_HEADER);
                if let Some(user_id) = user_id {
                    if let Ok(value) = HeaderValue::from_str(&user_id.to_string()) {
                        headers.insert(USER_ID_HEADER, value);
                    }
                }
                if let Ok(value) = HeaderValue::from_str(&tenant_id) {
                    headers.insert(TENANT_ID_HEADER, value);
                }
                request.extensions_mut().insert(AuthContext {
                    tenant_id,
                    user_id,
                    token_id,
                });

                let mut response = next.run(request).await;
                echo_session(&mut response, &session_id);
                return response;
            }
            Validation::Rejected(reason) => {
                metrics::VALIDATIONS_FAILED_TOTAL.inc();

                let mut event = base_event(Action::TokenValidated);
                event.status = Some(Status::Fail);
                event.token_id = Some(signature::token_id(&token));
                event.data = Some(serde_json::json!({ "reason": reason.as_str() }));
                publish(&state, event).await;
                // Fall through: a rejected token degrades to re-authentication
            }
        }
    }

    // Unauthenticated branch. Any incoming pre-auth token is ignored and a
    // fresh one minted, so a caller can never fix another caller's token.
    let e_token = match codec::encode_pre_auth(&tenant, Utc::now()) {
        Ok(token) => token,
        Err(e) => return e.into_response(),
    };
    metrics::TOKENS_ISSUED_TOTAL.inc();

    let event = base_event(Action::TokenIssued);
    publish(&state, event).await;

    let return_url = request.uri().to_string();
    redirect_to_auth(&state.config.auth_backend_url, &return_url, &e_token, &session_id)
}

async fn publish(state: &GatewayState, event: Event) {
    if let Err(e) = state.sink.publish(&event).await {
        tracing::warn!(
            error = %e,
            action = %event.action.as_str(),
            "Event publish failed, continuing"
        );
    }
}

fn echo_session(response: &mut Response, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
}

fn redirect_to_auth(
    auth_backend_url: &str,
    return_url: &str,
    e_token: &str,
    session_id: &str,
) -> Response {
    let query = match serde_urlencoded::to_string([("return_url", return_url), ("e_token", e_token)])
    {
        Ok(query) => query,
        Err(e) => return AppError::internal(format!("redirect encoding failed: {}", e)).into_response(),
    };
    let location = format!("{}?{}", auth_backend_url, query);

    match Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .header(E_TOKEN_HEADER, e_token)
        .header(SESSION_ID_HEADER, session_id)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => AppError::internal(format!("redirect build failed: {}", e)).into_response(),
    }
}
