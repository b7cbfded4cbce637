//! Message Relay Service
//!
//! HTTP mailbox routing TSS messages between nodes.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use msg_relay::api::{InboxMessage, InboxResponse, PostMessageRequest, PostMessageResponse};
use msg_relay::{Mailbox, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};

/// Message relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "msg-relay-svc")]
#[command(about = "Message relay service for TSS nodes")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "RELAY_LISTEN")]
    listen: String,

    /// Message TTL in seconds
    #[arg(long, default_value = "300")]
    ttl: i64,

    /// Maximum queued messages per peer
    #[arg(long, default_value = "4096")]
    max_pending: usize,

    /// Seconds between expiry sweeps
    #[arg(long, default_value = "30")]
    cleanup_interval: u64,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,
}

/// Application state
struct AppState {
    mailbox: Mailbox,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        listen = %args.listen,
        ttl = args.ttl,
        max_pending = args.max_pending,
        "Starting message relay service"
    );

    let state = Arc::new(AppState {
        mailbox: Mailbox::new(args.ttl, args.max_pending),
    });

    let cleanup_mailbox = state.mailbox.clone();
    let cleanup_interval = Duration::from_secs(args.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            let removed = cleanup_mailbox.cleanup();
            if removed > 0 {
                debug!(removed, "Expired messages removed");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/msg", post(post_message))
        .route("/v1/inbox/:peer", get(drain_inbox))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "msg-relay-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Queue a message for its recipient
async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostMessageRequest>,
) -> impl IntoResponse {
    let payload = match b64::decode(&req.payload) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("Invalid base64: {}", e) })),
            );
        }
    };

    match state.mailbox.put(&req.from, &req.to, payload) {
        Ok(id) => {
            debug!(from = %req.from, to = %req.to, duplicate = id.is_none(), "Message queued");
            (
                StatusCode::OK,
                Json(serde_json::json!(PostMessageResponse { id })),
            )
        }
        Err(e) => {
            warn!(from = %req.from, to = %req.to, error = %e, "Message rejected");
            let status = match e {
                RelayError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
                RelayError::InboxFull(_) => StatusCode::TOO_MANY_REQUESTS,
                RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

/// Hand every waiting message to its recipient
async fn drain_inbox(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Json<InboxResponse> {
    let messages = state
        .mailbox
        .drain(&peer)
        .into_iter()
        .map(|m| InboxMessage {
            id: m.id,
            from: m.from,
            payload: b64::encode(&m.payload),
        })
        .collect();
    Json(InboxResponse { messages })
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_post_then_drain() {
        let state = Arc::new(AppState {
            mailbox: Mailbox::default(),
        });

        let body = serde_json::to_vec(&PostMessageRequest {
            from: "a".into(),
            to: "b".into(),
            payload: b64::encode(b"hello"),
        })
        .unwrap();
        let response = app(Arc::clone(&state))
            .oneshot(
                Request::post("/v1/msg")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(state)
            .oneshot(Request::get("/v1/inbox/b").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let inbox: InboxResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(inbox.messages.len(), 1);
        assert_eq!(b64::decode(&inbox.messages[0].payload).unwrap(), b"hello");
    }
}
