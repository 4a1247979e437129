//! Ingestion pipeline: the versioned `ingest.v1` envelope contract
//! (`spec.md` §4.6).
//!
//! [`Ingestion::accept`] is the tiered intake boundary. It runs the triage
//! hook, writes the `message_inbox` row, and — for Tier 1 envelopes — hands
//! the result to the [`crate::buffer::DurableBuffer`] hot path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::buffer::DurableBuffer;
use crate::error::Result;
use crate::models::{Direction, IngestionTier, MessageLifecycleState, MessageRef, RequestContext, SourceChannel};
use crate::triage::{TriageCandidate, TriageEngine};

/// `source = {channel, provider, endpoint_identity}` (`spec.md` §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSource {
    pub channel: SourceChannel,
    pub provider: Option<String>,
    pub endpoint_identity: String,
}

/// `event = {external_event_id, external_thread_id?, observed_at}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeEvent {
    pub external_event_id: String,
    pub external_thread_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// `sender = {identity}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSender {
    pub identity: String,
}

/// `payload = {raw, normalized_text}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub raw: Option<serde_json::Value>,
    pub normalized_text: String,
    pub mime_type: Option<String>,
    pub attachments: Option<serde_json::Value>,
}

/// `control = {idempotency_key?, ingestion_tier, policy_tier?}`, with
/// backward-compatible defaults applied by [`EnvelopeControl::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeControl {
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub ingestion_tier: IngestionTier,
    pub policy_tier: Option<String>,
}

impl Default for EnvelopeControl {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            ingestion_tier: IngestionTier::Full,
            policy_tier: None,
        }
    }
}

/// The full `ingest.v1` envelope (`spec.md` §4.6).
#[derive(Debug, Clone)]
pub struct IngestEnvelope {
    pub schema_version: String,
    pub source: EnvelopeSource,
    pub event: EnvelopeEvent,
    pub sender: EnvelopeSender,
    pub payload: EnvelopePayload,
    pub control: EnvelopeControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { request_id: Uuid, duplicate: bool },
    Rejected { reason: &'static str },
}

pub struct Ingestion {
    pool: PgPool,
    triage: TriageEngine,
    buffer: Option<Arc<DurableBuffer>>,
}

impl Ingestion {
    pub fn new(pool: PgPool, buffer: Option<Arc<DurableBuffer>>) -> Self {
        let triage = TriageEngine::new(pool.clone());
        Self { pool, triage, buffer }
    }

    /// `spec.md` §4.6: triage hook, dedupe, tier semantics, buffer handoff.
    pub async fn accept(&self, envelope: IngestEnvelope) -> Result<IngestOutcome> {
        let candidate = TriageCandidate {
            sender_identity: &envelope.sender.identity,
            headers: None,
            mime_type: envelope.payload.mime_type.as_deref(),
        };
        let verdict = self.triage.evaluate(&candidate).await?;

        if verdict.action == crate::models::TriageAction::Skip {
            return Ok(IngestOutcome::Rejected { reason: "triage_skip" });
        }

        let mut tier = envelope.control.ingestion_tier;
        let mut processing_metadata = serde_json::Map::new();

        match &verdict.action {
            crate::models::TriageAction::MetadataOnly => tier = IngestionTier::Metadata,
            crate::models::TriageAction::LowPriorityQueue => {
                processing_metadata.insert("priority".to_string(), serde_json::Value::String("low".to_string()));
            }
            crate::models::TriageAction::RouteTo { butler } => {
                processing_metadata.insert(
                    "forced_target".to_string(),
                    serde_json::Value::String(butler.clone()),
                );
            }
            crate::models::TriageAction::PassThrough | crate::models::TriageAction::Skip => {}
        }

        let request_context = RequestContext {
            source_channel: envelope.source.channel,
            source_endpoint_identity: envelope.source.endpoint_identity.clone(),
            source_sender_identity: envelope.sender.identity.clone(),
            source_thread_identity: envelope.event.external_thread_id.clone(),
            request_id: Uuid::new_v4(),
            dedupe_key: envelope.control.idempotency_key.clone(),
            ingestion_tier: tier,
        };

        if let Some(existing) = self.find_duplicate(request_context.dedupe_key.as_deref()).await? {
            return Ok(IngestOutcome::Accepted {
                request_id: existing,
                duplicate: true,
            });
        }

        let (raw_payload, lifecycle_state) = match tier {
            IngestionTier::Full => (envelope.payload.raw.clone(), MessageLifecycleState::Accepted),
            IngestionTier::Metadata => (None, MessageLifecycleState::MetadataRef),
        };

        let processing_metadata = if processing_metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(processing_metadata))
        };

        let id = Uuid::new_v4();
        let received_at = Utc::now();

        let insert_result = sqlx::query(
            r#"
            INSERT INTO message_inbox (
                id, received_at, request_context, raw_payload, normalized_text,
                direction, lifecycle_state, schema_version, attachments, processing_metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(received_at)
        .bind(serde_json::to_value(&request_context)?)
        .bind(raw_payload)
        .bind(&envelope.payload.normalized_text)
        .bind(Direction::Inbound.to_string())
        .bind(lifecycle_state.to_string())
        .bind(&envelope.schema_version)
        .bind(&envelope.payload.attachments)
        .bind(&processing_metadata)
        .execute(&self.pool)
        .await;

        // The pre-check above is racy: two concurrent ingests of the same
        // idempotency_key can both pass it and reach this INSERT. The unique
        // partial index is what actually prevents the duplicate; catch its
        // violation here and fold the loser into the winner's request_id
        // instead of surfacing a 409.
        if let Err(sqlx::Error::Database(db_err)) = &insert_result {
            if db_err.is_unique_violation() {
                let existing = self
                    .find_duplicate(request_context.dedupe_key.as_deref())
                    .await?
                    .ok_or_else(|| {
                        crate::error::Error::domain(
                            crate::error::ErrorKind::InternalError,
                            "unique violation on message_inbox insert but no duplicate row found on re-query",
                        )
                    })?;
                return Ok(IngestOutcome::Accepted {
                    request_id: existing,
                    duplicate: true,
                });
            }
        }
        insert_result?;

        if matches!(tier, IngestionTier::Full) {
            if let Some(buffer) = &self.buffer {
                let message_ref = MessageRef {
                    request_id: request_context.request_id,
                    message_inbox_id: id,
                    message_text: envelope.payload.normalized_text.clone(),
                    source: envelope.source.channel,
                    event: envelope.event.external_event_id.clone(),
                    sender: envelope.sender.identity.clone(),
                    enqueued_at: received_at,
                };
                buffer.enqueue(message_ref);
            }
        }

        Ok(IngestOutcome::Accepted {
            request_id: request_context.request_id,
            duplicate: false,
        })
    }

    /// `spec.md` §4.6 dedupe: a unique partial index on
    /// `(dedupe_key, received_at month)` collapses duplicates at the DB
    /// level. This is only a pre-check — it narrows the race window but
    /// does not close it, so [`Self::accept`] also catches the index's
    /// unique-violation on insert and re-queries here to resolve it.
    async fn find_duplicate(&self, dedupe_key: Option<&str>) -> Result<Option<Uuid>> {
        let Some(dedupe_key) = dedupe_key else {
            return Ok(None);
        };
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM message_inbox
            WHERE request_context->>'dedupe_key' = $1
              AND received_at >= date_trunc('month', now())
            LIMIT 1
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_control_defaults_to_full_tier() {
        let control = EnvelopeControl::default();
        assert_eq!(control.ingestion_tier, IngestionTier::Full);
        assert!(control.idempotency_key.is_none());
    }

    #[test]
    fn metadata_tier_envelope_has_no_raw_payload_by_construction() {
        let payload = EnvelopePayload {
            raw: None,
            normalized_text: "Re: quarterly numbers".to_string(),
            mime_type: None,
            attachments: None,
        };
        assert!(payload.raw.is_none());
        assert!(!payload.normalized_text.is_empty());
    }
}
