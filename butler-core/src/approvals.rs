//! Approvals & Pending Actions (`spec.md` §4.9).
//!
//! High-impact tool calls are intercepted before execution: a butler calls
//! [`Approvals::enqueue`], a human or an [`ApprovalRule`] decides, and the
//! butler re-invokes the tool with `_approval_bypass=true` once approved.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::models::{ApprovalDecision, ApprovalRule, PendingAction, PendingActionStatus};

pub struct Approvals {
    pool: PgPool,
}

impl Approvals {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `spec.md` §4.9: idempotent on `request_id`; evaluates active
    /// `ApprovalRule`s before falling back to `pending`.
    pub async fn enqueue(
        &self,
        request_id: Uuid,
        butler: &str,
        tool_name: &str,
        tool_args: serde_json::Value,
        summary: &str,
        source_context: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PendingAction> {
        if let Some(mut existing) = self.load(request_id).await? {
            existing.idempotent_replay = true;
            return Ok(existing);
        }

        let rule = self.match_rule(butler, tool_name, &tool_args).await?;

        let (status, decided_at, decided_by) = match rule.as_ref().map(|r| r.decision) {
            Some(ApprovalDecision::AutoApprove) => (PendingActionStatus::Approved, Some(Utc::now()), Some("rule".to_string())),
            Some(ApprovalDecision::AutoReject) => (PendingActionStatus::Rejected, Some(Utc::now()), Some("rule".to_string())),
            Some(ApprovalDecision::RequireHuman) | None => (PendingActionStatus::Pending, None, None),
        };

        let requested_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO approvals (
                id, butler, tool_name, tool_args, summary, status, requested_at,
                expires_at, decided_at, decided_by, decision_reason, source_context, execution_result
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL)
            "#,
        )
        .bind(request_id)
        .bind(butler)
        .bind(tool_name)
        .bind(&tool_args)
        .bind(summary)
        .bind(status.to_string())
        .bind(requested_at)
        .bind(expires_at)
        .bind(decided_at)
        .bind(&decided_by)
        .bind(rule.as_ref().map(|_| "matched approval_rule"))
        .bind(&source_context)
        .execute(&self.pool)
        .await?;

        self.record_event(request_id, "enqueued", &decided_by).await?;

        Ok(PendingAction {
            id: request_id,
            butler: butler.to_string(),
            tool_name: tool_name.to_string(),
            tool_args,
            summary: summary.to_string(),
            status,
            requested_at,
            expires_at,
            decided_at,
            decided_by,
            decision_reason: rule.as_ref().map(|_| "matched approval_rule".to_string()),
            source_context,
            execution_result: None,
            idempotent_replay: false,
        })
    }

    /// Human or API decision (`spec.md` §4.9: `approve`/`reject`).
    pub async fn decide(&self, request_id: Uuid, approve: bool, decided_by: &str, reason: Option<&str>) -> Result<PendingAction> {
        let action = self
            .load(request_id)
            .await?
            .ok_or_else(|| Error::domain(ErrorKind::NotFound, "no pending action with that request_id"))?;

        if action.status != PendingActionStatus::Pending {
            return Ok(action);
        }

        let new_status = if approve { PendingActionStatus::Approved } else { PendingActionStatus::Rejected };
        let now = Utc::now();

        sqlx::query(
            "UPDATE approvals SET status = $2, decided_at = $3, decided_by = $4, decision_reason = $5 WHERE id = $1",
        )
        .bind(request_id)
        .bind(new_status.to_string())
        .bind(now)
        .bind(decided_by)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        self.record_event(request_id, if approve { "approved" } else { "rejected" }, &Some(decided_by.to_string()))
            .await?;

        self.load(request_id).await?.ok_or_else(|| Error::domain(ErrorKind::InternalError, "action vanished after decision"))
    }

    /// Records the outcome of executing an approved tool
    /// (`spec.md` §4.9: "on success status → `executed`; on failure stays
    /// `approved` with `execution_result.error`").
    pub async fn record_execution(&self, request_id: Uuid, success: bool, result: serde_json::Value) -> Result<()> {
        let status = if success { PendingActionStatus::Executed } else { PendingActionStatus::Approved };
        sqlx::query("UPDATE approvals SET status = $2, execution_result = $3 WHERE id = $1")
            .bind(request_id)
            .bind(status.to_string())
            .bind(result)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Expiry sweeper (`spec.md` §4.9): `pending` rows past `expires_at`
    /// move to `expired`.
    pub async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE approvals SET status = 'expired'
            WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < now()
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for id in &ids {
            self.record_event(*id, "expired", &None).await?;
        }

        Ok(ids)
    }

    async fn load(&self, request_id: Uuid) -> Result<Option<PendingAction>> {
        let row: Option<PendingActionDbRow> = sqlx::query_as(
            r#"
            SELECT id, butler, tool_name, tool_args, summary, status, requested_at,
                   expires_at, decided_at, decided_by, decision_reason, source_context, execution_result
            FROM approvals WHERE id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn match_rule(&self, butler: &str, tool_name: &str, tool_args: &serde_json::Value) -> Result<Option<ApprovalRule>> {
        let rows: Vec<ApprovalRuleDbRow> = sqlx::query_as(
            "SELECT id, match_predicate, decision, active, created_at FROM approval_rules WHERE active = true ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let rule: ApprovalRule = row.try_into()?;
            if predicate_matches(&rule.match_predicate, butler, tool_name, tool_args) {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    async fn record_event(&self, approval_id: Uuid, event: &str, actor: &Option<String>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_events (id, approval_id, event, actor, recorded_at, privileged)
            VALUES ($1, $2, $3, $4, $5, true)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(approval_id)
        .bind(event)
        .bind(actor)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Pure matcher, testable without a pool. A predicate matches when every
/// key it specifies equals the corresponding field.
fn predicate_matches(predicate: &serde_json::Value, butler: &str, tool_name: &str, tool_args: &serde_json::Value) -> bool {
    let Some(obj) = predicate.as_object() else {
        return false;
    };
    if let Some(expected) = obj.get("butler").and_then(|v| v.as_str()) {
        if expected != butler {
            return false;
        }
    }
    if let Some(expected) = obj.get("tool_name").and_then(|v| v.as_str()) {
        if expected != tool_name {
            return false;
        }
    }
    if let Some(expected) = obj.get("tool_args") {
        if expected != tool_args {
            return false;
        }
    }
    true
}

#[derive(sqlx::FromRow)]
struct PendingActionDbRow {
    id: Uuid,
    butler: String,
    tool_name: String,
    tool_args: serde_json::Value,
    summary: String,
    status: String,
    requested_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    decided_at: Option<DateTime<Utc>>,
    decided_by: Option<String>,
    decision_reason: Option<String>,
    source_context: serde_json::Value,
    execution_result: Option<serde_json::Value>,
}

impl TryFrom<PendingActionDbRow> for PendingAction {
    type Error = Error;

    fn try_from(row: PendingActionDbRow) -> Result<Self> {
        Ok(PendingAction {
            id: row.id,
            butler: row.butler,
            tool_name: row.tool_name,
            tool_args: row.tool_args,
            summary: row.summary,
            status: parse_status(&row.status)?,
            requested_at: row.requested_at,
            expires_at: row.expires_at,
            decided_at: row.decided_at,
            decided_by: row.decided_by,
            decision_reason: row.decision_reason,
            source_context: row.source_context,
            execution_result: row.execution_result,
            idempotent_replay: false,
        })
    }
}

fn parse_status(raw: &str) -> Result<PendingActionStatus> {
    Ok(match raw {
        "pending" => PendingActionStatus::Pending,
        "approved" => PendingActionStatus::Approved,
        "rejected" => PendingActionStatus::Rejected,
        "expired" => PendingActionStatus::Expired,
        "executed" => PendingActionStatus::Executed,
        other => return Err(Error::domain(ErrorKind::InternalError, format!("unknown pending_action status '{other}'"))),
    })
}

#[derive(sqlx::FromRow)]
struct ApprovalRuleDbRow {
    id: Uuid,
    match_predicate: serde_json::Value,
    decision: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ApprovalRuleDbRow> for ApprovalRule {
    type Error = Error;

    fn try_from(row: ApprovalRuleDbRow) -> Result<Self> {
        Ok(ApprovalRule {
            id: row.id,
            match_predicate: row.match_predicate,
            decision: match row.decision.as_str() {
                "auto_approve" => ApprovalDecision::AutoApprove,
                "require_human" => ApprovalDecision::RequireHuman,
                "auto_reject" => ApprovalDecision::AutoReject,
                other => return Err(Error::domain(ErrorKind::InternalError, format!("unknown approval decision '{other}'"))),
            },
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_matches_on_specified_fields_only() {
        let predicate = serde_json::json!({"tool_name": "calendar.delete"});
        assert!(predicate_matches(&predicate, "any-butler", "calendar.delete", &serde_json::json!({})));
        assert!(!predicate_matches(&predicate, "any-butler", "calendar.create", &serde_json::json!({})));
    }

    #[test]
    fn predicate_matches_requires_all_specified_keys() {
        let predicate = serde_json::json!({"butler": "scheduling", "tool_name": "calendar.delete"});
        assert!(predicate_matches(&predicate, "scheduling", "calendar.delete", &serde_json::json!({})));
        assert!(!predicate_matches(&predicate, "other", "calendar.delete", &serde_json::json!({})));
    }

    #[test]
    fn status_round_trips_through_text_column() {
        for status in [
            PendingActionStatus::Pending,
            PendingActionStatus::Approved,
            PendingActionStatus::Rejected,
            PendingActionStatus::Expired,
            PendingActionStatus::Executed,
        ] {
            assert_eq!(parse_status(&status.to_string()).unwrap(), status);
        }
    }
}
