//! Message Pipeline: classify, dispatch, record (`spec.md` §4.8).
//!
//! Invoked by [`crate::buffer`] workers and, synchronously, by MCP
//! `handle_message` calls. The LLM-facing boundaries — classification,
//! extraction, routing, and reactions — are swappable traits, the same
//! pattern [`crate::spawner::SessionRuntime`] uses for session execution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::buffer::MessageProcessor;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::models::{
    ClassificationTarget, Direction, Extraction, ExtractionConfidence, MessageInbox, MessageLifecycleState, MessageRef,
    RequestContext,
};

/// Classifier LLM pass (`spec.md` §4.8 step 2).
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, history: &[HistoryEntry], message: &MessageRef) -> Result<Vec<ClassificationTarget>>;
}

/// Extraction LLM pass (`spec.md` §4.8 step 4), run concurrently with
/// classification against the unified `ExtractorSchema` set.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, history: &[HistoryEntry], message: &MessageRef) -> Result<Vec<Extraction>>;
}

/// `route.execute` as seen from the pipeline: a swappable transport so the
/// pipeline never needs to know whether the target butler is in-process or
/// across the network (`SPEC_FULL.md` §A).
#[async_trait]
pub trait RouteDispatcher: Send + Sync {
    async fn dispatch(&self, target_butler: &str, prompt: String, context: Option<String>, request_context: &RequestContext) -> Result<()>;
}

/// Per-channel reaction lifecycle sink (`spec.md` §4.8 step 6). Telegram is
/// the only channel with a concrete implementation today; other channels
/// get a no-op.
#[async_trait]
pub trait ReactionSink: Send + Sync {
    async fn on_accept(&self, chat_id: &str, message_id: &str) -> Result<()>;
    async fn on_success(&self, chat_id: &str, message_id: &str) -> Result<()>;
    async fn on_failure(&self, chat_id: &str, message_id: &str) -> Result<()>;
}

/// One hydrated row of conversation history (`spec.md` §4.8 step 1).
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub sender_identity: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

pub struct Pipeline {
    pool: PgPool,
    config: PipelineConfig,
    classifier: Arc<dyn Classifier>,
    extractor: Arc<dyn Extractor>,
    dispatcher: Arc<dyn RouteDispatcher>,
    reactions: Arc<dyn ReactionSink>,
}

impl Pipeline {
    pub fn new(
        pool: PgPool,
        config: PipelineConfig,
        classifier: Arc<dyn Classifier>,
        extractor: Arc<dyn Extractor>,
        dispatcher: Arc<dyn RouteDispatcher>,
        reactions: Arc<dyn ReactionSink>,
    ) -> Self {
        Self {
            pool,
            config,
            classifier,
            extractor,
            dispatcher,
            reactions,
        }
    }

    /// Thread key used to scope history hydration (`spec.md` §4.8 step 1):
    /// the email thread id, or the `chat_id` half of Telegram's composite
    /// `chat_id:message_id` thread id.
    fn thread_key(&self, thread_identity: &str, channel_is_telegram: bool) -> String {
        if channel_is_telegram {
            telegram_chat_id(thread_identity).unwrap_or(thread_identity).to_string()
        } else {
            thread_identity.to_string()
        }
    }

    /// The lightweight [`MessageRef`] that travels through the buffer
    /// doesn't carry thread identity; load the full `message_inbox` row to
    /// get `request_context` (`spec.md` §3.2).
    async fn load_request_context(&self, message_inbox_id: Uuid) -> Result<RequestContext> {
        let raw: serde_json::Value =
            sqlx::query_scalar("SELECT request_context FROM message_inbox WHERE id = $1")
                .bind(message_inbox_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Step 1: history hydration, bounded by time window OR count,
    /// whichever admits more rows.
    async fn hydrate_history(&self, thread_key: &str) -> Result<Vec<HistoryEntry>> {
        let window_cutoff = Utc::now() - chrono::Duration::minutes(self.config.history_window_minutes);

        let by_window: Vec<HistoryDbRow> = sqlx::query_as(
            r#"
            SELECT received_at, direction, request_context->>'source_sender_identity' AS sender_identity, normalized_text
            FROM message_inbox
            WHERE request_context->>'source_thread_identity' = $1 AND received_at >= $2
            ORDER BY received_at ASC
            "#,
        )
        .bind(thread_key)
        .bind(window_cutoff)
        .fetch_all(&self.pool)
        .await?;

        if by_window.len() as i64 >= self.config.history_max_messages {
            return Ok(by_window.into_iter().map(Into::into).collect());
        }

        let by_count: Vec<HistoryDbRow> = sqlx::query_as(
            r#"
            SELECT received_at, direction, request_context->>'source_sender_identity' AS sender_identity, normalized_text
            FROM message_inbox
            WHERE request_context->>'source_thread_identity' = $1
            ORDER BY received_at DESC
            LIMIT $2
            "#,
        )
        .bind(thread_key)
        .bind(self.config.history_max_messages)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<HistoryEntry> = by_count.into_iter().map(Into::into).collect();
        entries.reverse();
        Ok(entries)
    }

    /// The full pipeline run for one inbound message (`spec.md` §4.8).
    ///
    /// Transitions `message_inbox.lifecycle_state` on dequeue and again on
    /// completion (`spec.md` §8's accepted → processing → completed/errored
    /// invariant) so a row never sits at `accepted` once it has left the
    /// in-memory queue.
    pub async fn process(&self, message: MessageRef) -> Result<()> {
        self.mark_lifecycle(message.message_inbox_id, MessageLifecycleState::Processing).await.ok();

        let result = self.run(&message).await;

        let final_state = match &result {
            Ok(true) => MessageLifecycleState::Completed,
            Ok(false) | Err(_) => MessageLifecycleState::Errored,
        };
        self.mark_lifecycle(message.message_inbox_id, final_state).await.ok();

        result.map(|_| ())
    }

    async fn mark_lifecycle(&self, message_inbox_id: Uuid, state: MessageLifecycleState) -> Result<()> {
        sqlx::query("UPDATE message_inbox SET lifecycle_state = $2 WHERE id = $1")
            .bind(message_inbox_id)
            .bind(state.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn run(&self, message: &MessageRef) -> Result<bool> {
        let request_context = self.load_request_context(message.message_inbox_id).await?;
        let is_telegram = matches!(message.source, crate::models::SourceChannel::Telegram);
        let thread_identity = request_context.source_thread_identity.clone().unwrap_or_else(|| message.request_id.to_string());
        let thread_key = self.thread_key(&thread_identity, is_telegram);

        let history = self.hydrate_history(&thread_key).await.unwrap_or_default();

        if is_telegram {
            if let Some((chat_id, message_id)) = split_telegram_thread(&thread_identity) {
                let _ = self.reactions.on_accept(chat_id, message_id).await;
            }
        }

        let (classify_result, extract_result) =
            tokio::join!(self.classifier.classify(&history, message), self.extractor.extract(&history, message));

        let mut pipeline_ok = true;

        match classify_result {
            Ok(targets) => {
                for target in &targets {
                    if self
                        .dispatcher
                        .dispatch(&target.butler, target.prompt.clone(), None, &request_context)
                        .await
                        .is_err()
                    {
                        pipeline_ok = false;
                    }
                }
            }
            Err(err) => {
                tracing::error!(%err, request_id = %message.request_id, "classification failed");
                pipeline_ok = false;
            }
        }

        match extract_result {
            Ok(extractions) => {
                for extraction in &extractions {
                    self.record_extraction(message, extraction).await.ok();
                    if meets_auto_dispatch_threshold(extraction.confidence, &self.config.auto_dispatch_confidence) {
                        let _ = self
                            .dispatcher
                            .dispatch(
                                &extraction.target_butler,
                                serde_json::to_string(&extraction.tool_args).unwrap_or_default(),
                                Some(extraction.tool_name.clone()),
                                &request_context,
                            )
                            .await;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, request_id = %message.request_id, "extraction pass failed");
            }
        }

        if is_telegram {
            if let Some((chat_id, message_id)) = split_telegram_thread(&thread_identity) {
                if pipeline_ok {
                    let _ = self.reactions.on_success(chat_id, message_id).await;
                } else {
                    let _ = self.reactions.on_failure(chat_id, message_id).await;
                }
            }
        }

        Ok(pipeline_ok)
    }

    async fn record_extraction(&self, message: &MessageRef, extraction: &Extraction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extractions (id, message_inbox_id, extraction_type, confidence, tool_name, tool_args, target_butler, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.message_inbox_id)
        .bind(&extraction.extraction_type)
        .bind(confidence_column(extraction.confidence))
        .bind(&extraction.tool_name)
        .bind(&extraction.tool_args)
        .bind(&extraction.target_butler)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Step 5: outbound recording (`spec.md` §4.8). Writes an `outbound`
    /// `message_inbox` row so conversation history stays symmetric.
    pub async fn record_outbound(&self, inbound: &MessageInbox, butler_name: &str, reply_text: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut request_context = inbound.request_context.clone();
        request_context.source_sender_identity = butler_name.to_string();
        request_context.request_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO message_inbox (
                id, received_at, request_context, raw_payload, normalized_text,
                direction, lifecycle_state, schema_version, attachments, processing_metadata
            ) VALUES ($1, $2, $3, NULL, $4, $5, $6, $7, NULL, NULL)
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(serde_json::to_value(&request_context)?)
        .bind(reply_text)
        .bind(Direction::Outbound.to_string())
        .bind(MessageLifecycleState::Completed.to_string())
        .bind(&inbound.schema_version)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl MessageProcessor for Pipeline {
    async fn process(&self, message_ref: MessageRef) -> Result<()> {
        self.process(message_ref).await
    }
}

fn confidence_column(confidence: ExtractionConfidence) -> &'static str {
    match confidence {
        ExtractionConfidence::Low => "LOW",
        ExtractionConfidence::Medium => "MEDIUM",
        ExtractionConfidence::High => "HIGH",
    }
}

fn meets_auto_dispatch_threshold(confidence: ExtractionConfidence, configured: &str) -> bool {
    let threshold = match configured.to_ascii_lowercase().as_str() {
        "low" => ExtractionConfidence::Low,
        "medium" => ExtractionConfidence::Medium,
        _ => ExtractionConfidence::High,
    };
    confidence >= threshold
}

/// Splits Telegram's composite `chat_id:message_id` thread id
/// (`spec.md` §4.8 step 6).
fn split_telegram_thread(thread_id: &str) -> Option<(&str, &str)> {
    thread_id.split_once(':')
}

fn telegram_chat_id(thread_id: &str) -> Option<&str> {
    split_telegram_thread(thread_id).map(|(chat_id, _)| chat_id)
}

#[derive(sqlx::FromRow)]
struct HistoryDbRow {
    received_at: DateTime<Utc>,
    direction: String,
    sender_identity: Option<String>,
    normalized_text: String,
}

impl From<HistoryDbRow> for HistoryEntry {
    fn from(row: HistoryDbRow) -> Self {
        HistoryEntry {
            direction: if row.direction == "outbound" { Direction::Outbound } else { Direction::Inbound },
            sender_identity: row.sender_identity.unwrap_or_default(),
            text: row.normalized_text,
            received_at: row.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_telegram_composite_thread_id() {
        assert_eq!(split_telegram_thread("12345:67"), Some(("12345", "67")));
        assert_eq!(split_telegram_thread("not-composite"), None);
    }

    #[test]
    fn auto_dispatch_threshold_defaults_to_high_only() {
        assert!(meets_auto_dispatch_threshold(ExtractionConfidence::High, "high"));
        assert!(!meets_auto_dispatch_threshold(ExtractionConfidence::Medium, "high"));
        assert!(meets_auto_dispatch_threshold(ExtractionConfidence::Medium, "medium"));
        assert!(meets_auto_dispatch_threshold(ExtractionConfidence::High, "medium"));
    }

    #[test]
    fn history_count_bound_matches_spec_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.history_window_minutes, 15);
        assert_eq!(config.history_max_messages, 30);
    }
}
