//! Typed row structs for every persisted and in-memory entity in `spec.md`
//! §3. Enums are stored as `TEXT` columns and mapped by hand at the
//! boundary, the way `audit::storage::pg` maps `AuditEventKind`, rather than
//! as compiled Postgres enum types — this keeps schema migrations additive
//! (new variants need no `ALTER TYPE`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

/// A channel an envelope or a routed message originated from (`spec.md` §3.1, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Telegram,
    Email,
    Api,
    Mcp,
    Scheduler,
    System,
}

impl SourceChannel {
    /// Whether replies on this channel should carry the `INTERACTIVE DATA
    /// SOURCE` prompt block (`spec.md` §4.5).
    pub fn is_interactive(self) -> bool {
        matches!(self, SourceChannel::Telegram | SourceChannel::Email)
    }
}

impl std::fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceChannel::Telegram => "telegram",
            SourceChannel::Email => "email",
            SourceChannel::Api => "api",
            SourceChannel::Mcp => "mcp",
            SourceChannel::Scheduler => "scheduler",
            SourceChannel::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(SourceChannel::Telegram),
            "email" => Ok(SourceChannel::Email),
            "api" => Ok(SourceChannel::Api),
            "mcp" => Ok(SourceChannel::Mcp),
            "scheduler" => Ok(SourceChannel::Scheduler),
            "system" => Ok(SourceChannel::System),
            other => Err(Error::domain(
                ErrorKind::ValidationError,
                format!("unknown source channel '{other}'"),
            )),
        }
    }
}

/// Whether an ingest envelope carries the full payload or a metadata stub
/// (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionTier {
    Full,
    Metadata,
}

impl Default for IngestionTier {
    fn default() -> Self {
        IngestionTier::Full
    }
}

impl std::fmt::Display for IngestionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            IngestionTier::Full => "full",
            IngestionTier::Metadata => "metadata",
        })
    }
}

impl std::str::FromStr for IngestionTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(IngestionTier::Full),
            "metadata" => Ok(IngestionTier::Metadata),
            other => Err(Error::domain(
                ErrorKind::ValidationError,
                format!("unknown ingestion tier '{other}'"),
            )),
        }
    }
}

/// `message_inbox.direction` (`spec.md` §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        })
    }
}

/// `message_inbox.lifecycle_state` (`spec.md` §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLifecycleState {
    Accepted,
    Processing,
    Completed,
    Errored,
    MetadataRef,
}

impl std::fmt::Display for MessageLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            MessageLifecycleState::Accepted => "accepted",
            MessageLifecycleState::Processing => "processing",
            MessageLifecycleState::Completed => "completed",
            MessageLifecycleState::Errored => "errored",
            MessageLifecycleState::MetadataRef => "metadata_ref",
        })
    }
}

impl std::str::FromStr for MessageLifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(MessageLifecycleState::Accepted),
            "processing" => Ok(MessageLifecycleState::Processing),
            "completed" => Ok(MessageLifecycleState::Completed),
            "errored" => Ok(MessageLifecycleState::Errored),
            "metadata_ref" => Ok(MessageLifecycleState::MetadataRef),
            other => Err(Error::domain(
                ErrorKind::InternalError,
                format!("unknown lifecycle state '{other}' read from message_inbox"),
            )),
        }
    }
}

/// Structured identity block carried by every `message_inbox` row and every
/// routed request (`spec.md` §3.1, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub source_channel: SourceChannel,
    pub source_endpoint_identity: String,
    pub source_sender_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_thread_identity: Option<String>,
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub ingestion_tier: IngestionTier,
}

/// A row in the partitioned `message_inbox` table (`spec.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInbox {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub request_context: RequestContext,
    pub raw_payload: Option<Json>,
    pub normalized_text: String,
    pub direction: Direction,
    pub lifecycle_state: MessageLifecycleState,
    pub final_state_at: Option<DateTime<Utc>>,
    pub schema_version: String,
    pub attachments: Option<Json>,
    pub processing_metadata: Option<Json>,
}

/// `route_inbox.status` (`spec.md` §3.1, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Accepted,
    Processing,
    Completed,
    Failed,
    DeadLettered,
}

impl std::fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            RouteStatus::Accepted => "accepted",
            RouteStatus::Processing => "processing",
            RouteStatus::Completed => "completed",
            RouteStatus::Failed => "failed",
            RouteStatus::DeadLettered => "dead_lettered",
        })
    }
}

impl std::str::FromStr for RouteStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(RouteStatus::Accepted),
            "processing" => Ok(RouteStatus::Processing),
            "completed" => Ok(RouteStatus::Completed),
            "failed" => Ok(RouteStatus::Failed),
            "dead_lettered" => Ok(RouteStatus::DeadLettered),
            other => Err(Error::domain(
                ErrorKind::InternalError,
                format!("unknown route status '{other}' read from route_inbox"),
            )),
        }
    }
}

/// A row in a butler's `route_inbox` table (`spec.md` §3.1, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInbox {
    pub id: Uuid,
    pub target_butler: String,
    pub source_butler: String,
    pub tool_name: String,
    pub args: Json,
    pub request_context: RequestContext,
    pub accepted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Json>,
    pub error: Option<String>,
    pub status: RouteStatus,
}

/// A butler's routing eligibility (`spec.md` §4.3, §GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityState {
    Active,
    Stale,
    Quarantined,
}

impl std::fmt::Display for EligibilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            EligibilityState::Active => "active",
            EligibilityState::Stale => "stale",
            EligibilityState::Quarantined => "quarantined",
        })
    }
}

impl std::str::FromStr for EligibilityState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EligibilityState::Active),
            "stale" => Ok(EligibilityState::Stale),
            "quarantined" => Ok(EligibilityState::Quarantined),
            other => Err(Error::domain(
                ErrorKind::InternalError,
                format!("unknown eligibility state '{other}' read from butler_registry"),
            )),
        }
    }
}

/// A row in `butler_registry` (`spec.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerRegistryRow {
    pub butler_name: String,
    pub endpoint_url: String,
    pub last_seen_at: DateTime<Utc>,
    pub eligibility_state: EligibilityState,
    pub eligibility_updated_at: DateTime<Utc>,
}

/// A row in `butler_registry_eligibility_log` (`spec.md` §3.1, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityLogEntry {
    pub id: Uuid,
    pub butler_name: String,
    pub previous_state: EligibilityState,
    pub new_state: EligibilityState,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Canonical reasons for a CAS eligibility transition (`spec.md` §4.3 step 2).
pub mod eligibility_reason {
    pub const HEALTH_RESTORED: &str = "health_restored";
    pub const HEARTBEAT_RECOVERY: &str = "heartbeat_recovery";
    pub const STALE_TIMEOUT: &str = "stale_timeout";
    pub const QUARANTINE_TIMEOUT: &str = "quarantine_timeout";
    pub const SELF_HEALED_REGISTRATION: &str = "self_healed_registration";
}

/// What caused a `Spawner.trigger` invocation (`spec.md` §3.1, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Route,
    Tick,
    Manual,
    Extraction,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Route => "route",
            TriggerSource::Tick => "tick",
            TriggerSource::Manual => "manual",
            TriggerSource::Extraction => "extraction",
        })
    }
}

/// A row in a butler's `sessions` table (`spec.md` §3.1, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub butler: String,
    pub prompt: String,
    pub trigger_source: TriggerSource,
    pub model: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub parent_session_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub tool_calls: Option<Json>,
    pub cost: Option<Json>,
}

/// A row in a butler's `scheduled_tasks` table (`spec.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub until_at: Option<DateTime<Utc>>,
    pub calendar_event_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// `triage_rules.rule_type` (`spec.md` §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageRuleType {
    SenderDomain,
    SenderAddress,
    HeaderCondition,
    MimeType,
}

/// `triage_rules.action` (`spec.md` §3.1, §4.6). `RouteTo` carries the
/// target butler name inline rather than as `route_to:<butler>` text, since
/// Rust has sum types for this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum TriageAction {
    Skip,
    MetadataOnly,
    LowPriorityQueue,
    PassThrough,
    RouteTo { butler: String },
}

impl TriageAction {
    /// Parse the source's `route_to:<butler>` sigil encoding, used when the
    /// action is read back from a single TEXT column.
    pub fn from_column(raw: &str) -> Result<Self, Error> {
        match raw {
            "skip" => Ok(TriageAction::Skip),
            "metadata_only" => Ok(TriageAction::MetadataOnly),
            "low_priority_queue" => Ok(TriageAction::LowPriorityQueue),
            "pass_through" => Ok(TriageAction::PassThrough),
            other => other
                .strip_prefix("route_to:")
                .map(|butler| TriageAction::RouteTo { butler: butler.to_string() })
                .ok_or_else(|| {
                    Error::domain(ErrorKind::InternalError, format!("unknown triage action '{other}'"))
                }),
        }
    }

    /// Render back to the single-column encoding used in storage.
    pub fn to_column(&self) -> String {
        match self {
            TriageAction::Skip => "skip".to_string(),
            TriageAction::MetadataOnly => "metadata_only".to_string(),
            TriageAction::LowPriorityQueue => "low_priority_queue".to_string(),
            TriageAction::PassThrough => "pass_through".to_string(),
            TriageAction::RouteTo { butler } => format!("route_to:{butler}"),
        }
    }
}

/// Who created a triage rule (`spec.md` §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageRuleCreator {
    Dashboard,
    Api,
    Seed,
}

/// A row in `triage_rules` (`spec.md` §3.1, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRule {
    pub id: Uuid,
    pub rule_type: TriageRuleType,
    pub condition: Json,
    pub action: TriageAction,
    pub priority: u32,
    pub enabled: bool,
    pub created_by: TriageRuleCreator,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TriageRule {
    /// Active rules are those with `enabled=true AND deleted_at IS NULL`
    /// (`spec.md` §3.1).
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// `pending_actions.status` (`spec.md` §3.1, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

impl std::fmt::Display for PendingActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            PendingActionStatus::Pending => "pending",
            PendingActionStatus::Approved => "approved",
            PendingActionStatus::Rejected => "rejected",
            PendingActionStatus::Expired => "expired",
            PendingActionStatus::Executed => "executed",
        })
    }
}

/// A row in `approvals` / `pending_actions` (`spec.md` §3.1, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    pub butler: String,
    pub tool_name: String,
    pub tool_args: Json,
    pub summary: String,
    pub status: PendingActionStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub decision_reason: Option<String>,
    pub source_context: Json,
    pub execution_result: Option<Json>,
    /// Present when an `enqueue_approval` call replayed an existing
    /// `request_id` (`spec.md` §8's approval idempotency law). Not a
    /// persisted column; set by the approvals service on replay.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub idempotent_replay: bool,
}

/// `approval_rules.decision` (`spec.md` §3.1, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    AutoApprove,
    RequireHuman,
    AutoReject,
}

/// A row in `approval_rules` (`spec.md` §3.1, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub match_predicate: Json,
    pub decision: ApprovalDecision,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lightweight buffer element (`spec.md` §3.2). Full payload stays in the
/// database; this is what actually travels through the in-memory queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub request_id: Uuid,
    pub message_inbox_id: Uuid,
    pub message_text: String,
    pub source: SourceChannel,
    pub event: String,
    pub sender: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Confidence tier attached to a secondary-pass extraction (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtractionConfidence {
    Low,
    Medium,
    High,
}

/// A structured signal produced by the extraction pass (`spec.md` §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(rename = "type")]
    pub extraction_type: String,
    pub confidence: ExtractionConfidence,
    pub tool_name: String,
    pub tool_args: Json,
    pub target_butler: String,
}

/// A single classifier fan-out target (`spec.md` §4.8 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTarget {
    pub butler: String,
    pub prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn source_channel_round_trips() {
        for channel in [
            SourceChannel::Telegram,
            SourceChannel::Email,
            SourceChannel::Api,
            SourceChannel::Mcp,
            SourceChannel::Scheduler,
            SourceChannel::System,
        ] {
            let parsed = SourceChannel::from_str(&channel.to_string()).unwrap();
            assert_eq!(parsed, channel);
        }
    }

    #[test]
    fn interactive_channels_match_spec() {
        assert!(SourceChannel::Telegram.is_interactive());
        assert!(SourceChannel::Email.is_interactive());
        assert!(!SourceChannel::Api.is_interactive());
        assert!(!SourceChannel::Scheduler.is_interactive());
    }

    #[test]
    fn triage_action_column_round_trip() {
        let action = TriageAction::RouteTo { butler: "health".to_string() };
        let column = action.to_column();
        assert_eq!(column, "route_to:health");
        assert_eq!(TriageAction::from_column(&column).unwrap(), action);

        assert_eq!(TriageAction::from_column("skip").unwrap(), TriageAction::Skip);
    }

    #[test]
    fn triage_rule_active_requires_enabled_and_not_deleted() {
        let mut rule = TriageRule {
            id: Uuid::new_v4(),
            rule_type: TriageRuleType::SenderDomain,
            condition: serde_json::json!({}),
            action: TriageAction::Skip,
            priority: 0,
            enabled: true,
            created_by: TriageRuleCreator::Seed,
            deleted_at: None,
        };
        assert!(rule.is_active());
        rule.enabled = false;
        assert!(!rule.is_active());
        rule.enabled = true;
        rule.deleted_at = Some(Utc::now());
        assert!(!rule.is_active());
    }

    #[test]
    fn extraction_confidence_orders_low_to_high() {
        assert!(ExtractionConfidence::Low < ExtractionConfidence::Medium);
        assert!(ExtractionConfidence::Medium < ExtractionConfidence::High);
    }
}
