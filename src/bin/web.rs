//! chat-planner Web 服务
//!
//! 启动: cargo run --bin chat-planner-web --features web
//!
//! 路由：
//! - POST /chat：提交一轮（完整历史）
//! - DELETE /chat/session/:id：清空会话
//! - GET /events?sessionId=：会话 SSE 事件流（事件名即事件类型）
//! - GET /calc?query=：计算器（也可作为 calc_mode = http 的后端）
//! - GET /health

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use chat_planner::config::load_config;
use chat_planner::core::{ChatService, PlannerError, ServiceBuilder, ToolError, TurnOutcome, TurnRequest};
use chat_planner::observability;
use chat_planner::tools::calculator::evaluate;

type AppState = Arc<ChatService>;

fn error_body(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let body = json!({ "error": { "type": kind, "message": message.into() } });
    (status, Json(body)).into_response()
}

fn planner_error_response(err: PlannerError) -> Response {
    match err {
        PlannerError::InvalidRequest(msg) => {
            error_body(StatusCode::BAD_REQUEST, "invalid_request", msg)
        }
        PlannerError::SessionBusy(sid) => error_body(
            StatusCode::CONFLICT,
            "session_busy",
            format!("Session {} already has a turn in progress.", sid),
        ),
    }
}

/// POST /chat
async fn api_chat(
    State(service): State<AppState>,
    Json(req): Json<TurnRequest>,
) -> Result<Json<TurnOutcome>, Response> {
    service
        .handle_turn(req)
        .await
        .map(Json)
        .map_err(planner_error_response)
}

/// DELETE /chat/session/:id
async fn api_session_reset(
    State(service): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    let existed = service.reset_session(&session_id).await;
    tracing::info!(session_id = %session_id, existed, "session reset");
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    session_id: Option<String>,
}

/// GET /events?sessionId=
async fn api_events_sse(
    State(service): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let session_id = q
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            error_body(StatusCode::BAD_REQUEST, "invalid_request", "sessionId is required")
        })?;
    let events = service.subscribe(&session_id).map(|event| {
        Ok(Event::default()
            .event(event.event_type.as_str())
            .data(event.to_json()))
    });
    Ok(Sse::new(events))
}

#[derive(Deserialize)]
struct CalcQuery {
    #[serde(default)]
    query: String,
}

/// GET /calc?query=
async fn api_calc(Query(q): Query<CalcQuery>) -> Response {
    match evaluate(&q.query) {
        Ok(calc) => Json(calc.to_json()).into_response(),
        Err(e @ ToolError::Validation(_)) => {
            error_body(StatusCode::BAD_REQUEST, e.kind(), e.user_message())
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.kind(), e.user_message()),
    }
}

fn router(service: AppState) -> Router {
    Router::new()
        .route("/chat", post(api_chat))
        .route("/chat/session/:id", delete(api_session_reset))
        .route("/events", get(api_events_sse))
        .route("/calc", get(api_calc))
        .route("/health", get(|| async { "OK" }))
        .with_state(service)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let port = cfg.web.port;
    let sweep_interval = Duration::from_secs(cfg.events.sweep_interval_secs.max(1));
    let service = Arc::new(
        ServiceBuilder::new(cfg)
            .build()
            .await
            .context("Failed to build chat service")?,
    );

    let token = CancellationToken::new();
    let sweeper = service.spawn_maintenance(sweep_interval, token.clone());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("chat-planner web: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = token.clone();
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    token.cancel();
    let _ = sweeper.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let service = ServiceBuilder::new(Default::default()).build().await.unwrap();
        router(Arc::new(service))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_calc_endpoint() {
        let ok = app()
            .await
            .oneshot(Request::get("/calc?query=2%2B3*4").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["result"], 14);

        let bad = app()
            .await
            .oneshot(Request::get("/calc?query=1%2F0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(bad).await["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_chat_turn_and_invalid_request() {
        let body = r#"{"sessionId":"web-1","messages":[{"role":"user","content":"/calc 6*7"}]}"#;
        let response = app()
            .await
            .oneshot(
                Request::post("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = json_body(response).await;
        assert_eq!(value["response"]["role"], "assistant");
        assert!(value["response"]["content"].as_str().unwrap().contains("42"));
        assert!(value["actions"].as_array().is_some_and(|a| !a.is_empty()));

        let empty = r#"{"sessionId":"web-1","messages":[]}"#;
        let response = app()
            .await
            .oneshot(
                Request::post("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(empty))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_session_reset_returns_no_content() {
        let response = app()
            .await
            .oneshot(
                Request::delete("/chat/session/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_events_stream_starts_with_ready() {
        let response = app()
            .await
            .oneshot(
                Request::get("/events?sessionId=web-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: ready"));

        let missing = app()
            .await
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }
}
