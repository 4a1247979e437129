//! The HTTP surface this daemon exposes (`spec.md` §6.1-§6.3).
//!
//! `route.execute` is hosted by every butler; `ingest`/`heartbeat` are
//! switchboard-only and simply absent from the router on other roles.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use butler_core::prelude::*;
use butler_core::ingestion::{
    EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource, IngestEnvelope,
    IngestOutcome,
};
use butler_core::route_inbox::{RouteExecuteInput, RoutingPolicy};
use serde::{Deserialize, Serialize};

use crate::DaemonState;

pub fn router(state: Arc<DaemonState>) -> Router {
    let mut router = Router::new().route("/route/execute", post(route_execute));

    if state.ctx.is_switchboard() {
        router = router
            .route("/api/switchboard/ingest", post(ingest))
            .route("/api/switchboard/heartbeat", post(heartbeat));
    }

    router.with_state(state)
}

#[derive(Debug, Deserialize)]
struct IngestWire {
    schema_version: String,
    source: EnvelopeSource,
    event: EnvelopeEvent,
    sender: EnvelopeSender,
    payload: EnvelopePayload,
    #[serde(default)]
    control: EnvelopeControl,
}

async fn ingest(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<IngestWire>,
) -> Response {
    let Some(ingestion) = state.ingestion.as_ref() else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({
            "status": "rejected", "reason": "not_switchboard",
        })))
            .into_response();
    };

    if body.schema_version != "ingest.v1" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "status": "rejected",
                "reason": "unsupported_schema_version",
                "details": body.schema_version,
            })),
        )
            .into_response();
    }

    let envelope = IngestEnvelope {
        schema_version: body.schema_version,
        source: body.source,
        event: body.event,
        sender: body.sender,
        payload: body.payload,
        control: body.control,
    };

    match ingestion.accept(envelope).await {
        Ok(IngestOutcome::Accepted { request_id, duplicate }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "accepted",
                "request_id": request_id,
                "duplicate": duplicate,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::Rejected { reason }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "status": "rejected", "reason": reason })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    butler_name: String,
}

async fn heartbeat(State(state): State<Arc<DaemonState>>, body: axum::body::Bytes) -> Response {
    let request: HeartbeatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({
                "status": "rejected", "reason": "malformed_body",
            })))
                .into_response()
        }
    };

    let Some(endpoint_url) = state
        .ctx
        .config
        .registry
        .known_butlers
        .get(&request.butler_name)
        .cloned()
    else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({
            "status": "rejected", "reason": "unknown_butler",
        })))
            .into_response();
    };

    match state.registry.heartbeat(&request.butler_name, &endpoint_url).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "eligibility_state": outcome.eligibility_state.to_string(),
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RouteExecuteWireInput {
    #[allow(dead_code)]
    schema_version: String,
    request_context: RequestContext,
    input: RoutePromptInput,
    #[serde(default = "default_source_butler")]
    source_butler: String,
}

fn default_source_butler() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct RoutePromptInput {
    prompt: String,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Serialize)]
struct RouteExecuteWireOutput {
    status: &'static str,
    request_id: uuid::Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn route_execute(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<RouteExecuteWireInput>,
) -> Response {
    let input = RouteExecuteInput {
        source_butler: body.source_butler,
        tool_name: "route.execute".to_string(),
        args: serde_json::json!({}),
        request_context: body.request_context,
        prompt: body.input.prompt,
        context: body.input.context,
    };

    let policy = RoutingPolicy {
        allow_stale: state.ctx.config.registry.allow_stale_by_default,
        allow_quarantined: false,
    };

    match state.route_inbox.accept(input, policy).await {
        Ok(output) => (
            StatusCode::OK,
            Json(RouteExecuteWireOutput {
                status: output.status,
                request_id: output.request_id,
                error: output.error,
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

