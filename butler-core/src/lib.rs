//! # butler-core
//!
//! Concurrency and messaging substrate for a fleet of cooperating "butlers":
//! long-running agents that accept inbound messages, dispatch to each other
//! over a two-phase route inbox, and run bounded-concurrency sessions under
//! a per-butler spawner.
//!
//! ## Modules
//!
//! - **Registry**: self-healing registration and heartbeat tracking
//! - **Spawner**: semaphore-bounded per-butler session concurrency
//! - **Route inbox**: accept/process two-phase inter-butler dispatch
//! - **Buffer**: durable hot-path queue with a cold-path recovery scanner
//! - **Pipeline**: history hydration, classification, extraction
//! - **Rate limiter / circuit breaker**: layered admission control and
//!   per-provider failure isolation
//! - **Approvals / retention**: pending-action governance and TTL cleanup
//!
//! ## Example
//!
//! ```rust,no_run
//! use butler_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load(None)?;
//!     init_tracing(&config)?;
//!     let ctx = Context::build(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod server;

pub mod context;
pub mod models;
pub mod metrics;
pub mod rate_limiter;
pub mod circuit_breaker;
pub mod registry;
pub mod spawner;
pub mod route_inbox;
pub mod ingestion;
pub mod buffer;
pub mod pipeline;
pub mod triage;
pub mod approvals;
pub mod retention;

pub mod observability;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, RateLimitConfig, RouteRateLimitConfig};

    pub use crate::context::Context;
    pub use crate::models::{
        ApprovalDecision, ApprovalRule, ButlerRegistryRow, ClassificationTarget, Direction, EligibilityLogEntry,
        EligibilityState, Extraction, ExtractionConfidence, IngestionTier, MessageInbox, MessageLifecycleState,
        MessageRef, PendingAction, PendingActionStatus, RequestContext, RouteInbox as RouteInboxRow, RouteStatus,
        ScheduledTask, SourceChannel, TriageAction, TriageRule, TriageRuleCreator, TriageRuleType, TriggerSource,
    };
    pub use crate::metrics::ButlerMetrics;
    pub use crate::rate_limiter::RateLimiter;
    pub use crate::circuit_breaker::CircuitBreaker;
    pub use crate::registry::Registry;
    pub use crate::spawner::{Spawner, SessionRuntime, TriggerContext};
    pub use crate::route_inbox::RouteInboxService;
    pub use crate::ingestion::Ingestion;
    pub use crate::buffer::{DurableBuffer, MessageProcessor};
    pub use crate::pipeline::{Pipeline, Classifier, Extractor, RouteDispatcher, ReactionSink};
    pub use crate::triage::TriageEngine;
    pub use crate::approvals::Approvals;
    pub use crate::retention::Retention;

    pub use crate::error::{Error, Result};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::middleware::{
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    };
    pub use crate::server::Server;
    pub use crate::observability::init_tracing;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    // Re-export time utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    // Re-export HTTP types
    pub use http::{Method, Uri};
}
