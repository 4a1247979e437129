//! Route Inbox & Dispatch: the two-phase inter-butler RPC (`spec.md` §4.5).
//!
//! Accept phase runs on the caller's latency budget; process phase runs in
//! a background loop on the callee and calls into the [`crate::spawner`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::metrics::ButlerMetrics;
use crate::models::{RequestContext, RouteStatus};
use crate::registry::Registry;
use crate::spawner::{Spawner, TriggerContext};

/// `spec.md` §6.3 `route.execute` input.
#[derive(Debug, Clone)]
pub struct RouteExecuteInput {
    pub source_butler: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub request_context: RequestContext,
    pub prompt: String,
    pub context: Option<String>,
}

/// `spec.md` §6.3 `route.execute` output.
#[derive(Debug, Clone)]
pub struct RouteExecuteOutput {
    pub status: &'static str,
    pub request_id: Uuid,
    pub error: Option<String>,
}

/// Routability policy applied before accepting (`spec.md` §4.5 step 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingPolicy {
    pub allow_stale: bool,
    pub allow_quarantined: bool,
}

/// Guidance block prepended to the LLM prompt for interactive sources
/// (`spec.md` §4.5 "Request context injection").
const INTERACTIVE_DATA_SOURCE_BLOCK: &str = "INTERACTIVE DATA SOURCE: this message originated on an interactive channel ({channel}). Reply to the user by calling the notify() tool; do not assume the caller will read your return value.";

pub struct RouteInboxService {
    butler: String,
    pool: PgPool,
    registry: Arc<Registry>,
    spawner: Arc<Spawner>,
    metrics: Arc<ButlerMetrics>,
    max_retries: u32,
    recovery_grace_s: i64,
    processing_timeout_s: i64,
}

impl RouteInboxService {
    pub fn new(
        butler: impl Into<String>,
        pool: PgPool,
        registry: Arc<Registry>,
        spawner: Arc<Spawner>,
        metrics: Arc<ButlerMetrics>,
        max_retries: u32,
        recovery_grace_s: i64,
        processing_timeout_s: i64,
    ) -> Self {
        Self {
            butler: butler.into(),
            pool,
            registry,
            spawner,
            metrics,
            max_retries,
            recovery_grace_s,
            processing_timeout_s,
        }
    }

    /// Accept phase (`spec.md` §4.5). Runs on the caller's latency budget —
    /// inserts the row and returns; it never invokes the spawner.
    pub async fn accept(&self, input: RouteExecuteInput, policy: RoutingPolicy) -> Result<RouteExecuteOutput> {
        let start = Utc::now();

        if !self
            .registry
            .is_routable(&self.butler, policy.allow_stale, policy.allow_quarantined)
            .await?
        {
            return Err(Error::domain(
                ErrorKind::TargetUnavailable,
                format!("butler '{}' is not currently routable", self.butler),
            ));
        }

        if let Some(existing) = self.find_non_terminal(input.request_context.dedupe_key.as_deref()).await? {
            return Ok(RouteExecuteOutput {
                status: "ok",
                request_id: existing,
                error: None,
            });
        }

        let request_id = input.request_context.request_id;
        let args = merge_prompt_context(&input.args, input.context.as_deref());

        sqlx::query(
            r#"
            INSERT INTO route_inbox (
                id, target_butler, source_butler, tool_name, args, request_context,
                accepted_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'accepted')
            "#,
        )
        .bind(request_id)
        .bind(&self.butler)
        .bind(&input.source_butler)
        .bind(&input.tool_name)
        .bind(args)
        .bind(serde_json::to_value(&input.request_context).map_err(|e| Error::domain(ErrorKind::InternalError, e.to_string()))?)
        .bind(start)
        .execute(&self.pool)
        .await?;

        self.metrics.route_queue_depth_inc();
        let accept_latency_ms = (Utc::now() - start).num_milliseconds().max(0) as f64;
        self.metrics.record_route_accept_latency(accept_latency_ms);

        Ok(RouteExecuteOutput {
            status: "ok",
            request_id,
            error: None,
        })
    }

    async fn find_non_terminal(&self, dedupe_key: Option<&str>) -> Result<Option<Uuid>> {
        let Some(dedupe_key) = dedupe_key else {
            return Ok(None);
        };
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM route_inbox
            WHERE target_butler = $1
              AND request_context->>'dedupe_key' = $2
              AND status IN ('accepted', 'processing')
            LIMIT 1
            "#,
        )
        .bind(&self.butler)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Process phase (`spec.md` §4.5): one iteration picks the oldest
    /// `accepted` row and drives it to a terminal state (or dead-letters
    /// it). Intended to be called in a loop from the daemon's background
    /// task set.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(row) = self.claim_oldest_accepted().await? else {
            return Ok(false);
        };

        let process_latency_ms = (Utc::now() - row.accepted_at).num_milliseconds().max(0) as f64;
        self.metrics.record_route_process_latency(process_latency_ms);
        self.metrics.route_queue_depth_dec();

        let prompt = self.build_prompt(&row);
        let result = self
            .spawner
            .trigger(
                prompt.clone(),
                TriggerContext {
                    trigger_source: crate::models::TriggerSource::Route,
                    parent_session_id: None,
                    trace_id: None,
                },
            )
            .await;

        match result {
            Ok(session) if session.success => {
                self.complete(row.id, serde_json::json!({"session_id": session.session_id})).await?;
            }
            Ok(session) => {
                self.fail(row.id, session.error.unwrap_or_else(|| "session failed".to_string())).await?;
            }
            Err(err) => {
                self.fail(row.id, err.to_string()).await?;
            }
        }

        Ok(true)
    }

    fn build_prompt(&self, row: &ClaimedRow) -> String {
        let mut prompt = String::new();
        if row.request_context.source_channel.is_interactive() {
            prompt.push_str(
                &INTERACTIVE_DATA_SOURCE_BLOCK.replace("{channel}", &row.request_context.source_channel.to_string()),
            );
            prompt.push_str("\n\n");
        }
        if let Some(context) = row.args.get("context").and_then(|v| v.as_str()) {
            prompt.push_str(context);
            prompt.push_str("\n\n");
        }
        if let Some(p) = row.args.get("prompt").and_then(|v| v.as_str()) {
            prompt.push_str(p);
        }
        prompt
    }

    async fn claim_oldest_accepted(&self) -> Result<Option<ClaimedRow>> {
        let row: Option<ClaimedDbRow> = sqlx::query_as(
            r#"
            UPDATE route_inbox
            SET status = 'processing', started_at = now(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM route_inbox
                WHERE target_butler = $1 AND status = 'accepted'
                ORDER BY accepted_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, args, request_context, accepted_at
            "#,
        )
        .bind(&self.butler)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE route_inbox SET status = 'completed', completed_at = now(), result = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Called on pipeline failure (`spec.md` §4.5 step 4). `attempts` is
    /// incremented once per claim by [`Self::claim_oldest_accepted`], so it
    /// already reflects the attempt that just failed — this is the only
    /// count that decides retry vs. dead-letter; `status` never does,
    /// because a failed row's status is still `'processing'` at this point.
    async fn fail(&self, id: Uuid, error: String) -> Result<()> {
        let attempts: i32 = sqlx::query_scalar("SELECT attempts FROM route_inbox WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        if attempts as u32 >= self.max_retries {
            sqlx::query(
                "UPDATE route_inbox SET status = 'dead_lettered', completed_at = now(), error = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(&error)
            .execute(&self.pool)
            .await?;
        } else {
            // Requeue for another attempt rather than leaving the row
            // parked at a terminal-looking 'failed' status nothing revisits.
            sqlx::query(
                "UPDATE route_inbox SET status = 'accepted', accepted_at = now(), started_at = NULL, error = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(&error)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// `spec.md` §4.5 "Recovery": requeue stale `accepted` rows, and move
    /// stuck `processing` rows to `failed` with `error='orphaned'`. Runs on
    /// daemon startup and, per `SPEC_FULL.md` §D, is also driven by the same
    /// `recovery_grace_s` at steady state (a periodic task).
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let grace_cutoff = Utc::now() - chrono::Duration::seconds(self.recovery_grace_s);
        let requeued: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE route_inbox SET accepted_at = now()
            WHERE target_butler = $1 AND status = 'accepted' AND accepted_at < $2
            RETURNING id
            "#,
        )
        .bind(&self.butler)
        .bind(grace_cutoff)
        .fetch_all(&self.pool)
        .await?;

        let orphan_cutoff = Utc::now() - chrono::Duration::seconds(self.processing_timeout_s);
        let orphaned: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE route_inbox SET status = 'failed', completed_at = now(), error = 'orphaned'
            WHERE target_butler = $1 AND status = 'processing' AND started_at < $2
            RETURNING id
            "#,
        )
        .bind(&self.butler)
        .bind(orphan_cutoff)
        .fetch_all(&self.pool)
        .await?;

        if !requeued.is_empty() || !orphaned.is_empty() {
            tracing::info!(requeued = requeued.len(), orphaned = orphaned.len(), "route inbox recovery");
        }

        Ok(RecoveryReport { requeued, orphaned })
    }
}

fn merge_prompt_context(args: &serde_json::Value, context: Option<&str>) -> serde_json::Value {
    let mut merged = args.clone();
    if let (Some(context), Some(obj)) = (context, merged.as_object_mut()) {
        obj.insert("context".to_string(), serde_json::Value::String(context.to_string()));
    }
    merged
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub requeued: Vec<Uuid>,
    pub orphaned: Vec<Uuid>,
}

struct ClaimedRow {
    id: Uuid,
    args: serde_json::Value,
    request_context: RequestContext,
    accepted_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ClaimedDbRow {
    id: Uuid,
    args: serde_json::Value,
    request_context: serde_json::Value,
    accepted_at: DateTime<Utc>,
}

impl TryFrom<ClaimedDbRow> for ClaimedRow {
    type Error = Error;

    fn try_from(row: ClaimedDbRow) -> Result<Self> {
        let request_context: RequestContext = serde_json::from_value(row.request_context)
            .map_err(|e| Error::domain(ErrorKind::InternalError, format!("malformed request_context: {e}")))?;
        Ok(ClaimedRow {
            id: row.id,
            args: row.args,
            request_context,
            accepted_at: row.accepted_at,
        })
    }
}

/// Background loop helper: calls [`RouteInboxService::process_next`] in a tight
/// loop with a short idle backoff, exiting on cancellation.
pub async fn run_process_loop(inbox: Arc<RouteInboxService>, shutdown: tokio_util::sync::CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match inbox.process_next().await {
            Ok(true) => continue,
            Ok(false) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
            Err(err) => {
                tracing::error!(%err, "route inbox process loop error");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_block_names_the_channel() {
        let rendered = INTERACTIVE_DATA_SOURCE_BLOCK.replace("{channel}", "telegram");
        assert!(rendered.contains("telegram"));
        assert!(rendered.contains("notify()"));
    }

    #[test]
    fn merge_prompt_context_injects_context_field() {
        let args = serde_json::json!({"prompt": "hi"});
        let merged = merge_prompt_context(&args, Some("history here"));
        assert_eq!(merged["context"], "history here");
        assert_eq!(merged["prompt"], "hi");
    }

    #[test]
    fn merge_prompt_context_noop_without_context() {
        let args = serde_json::json!({"prompt": "hi"});
        let merged = merge_prompt_context(&args, None);
        assert_eq!(merged, args);
    }
}
