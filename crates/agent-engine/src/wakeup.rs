//! Local wakeup endpoint: `POST /wakeup` with bearer auth collapses the sleep
//! hierarchy into ACTIVE. Everything else is 404.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::post;

use crate::state::AgentShared;

#[derive(Clone)]
struct WakeupState {
    shared: Arc<AgentShared>,
    token: Arc<str>,
    gear: Duration,
}

pub(crate) async fn serve_wakeup(
    shared: Arc<AgentShared>,
    token: String,
    port: u16,
    gear: Duration,
) -> anyhow::Result<()> {
    let state = WakeupState {
        shared,
        token: token.into(),
        gear,
    };
    let app = Router::new()
        .route("/wakeup", post(handle_wakeup))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "wakeup endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_wakeup(
    State(state): State<WakeupState>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    if !state.token.is_empty() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .map(str::trim);
        if presented != Some(&*state.token) {
            tracing::warn!("wakeup rejected: missing or invalid token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }
    state.shared.trigger_wakeup(state.gear);
    tracing::info!("wakeup received, entering active gear");
    (StatusCode::OK, "OK")
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}
