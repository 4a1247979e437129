//! Triage rule evaluation (`spec.md` §3.1, §4.6).
//!
//! Rules are evaluated in `priority ASC, created_at ASC, id ASC` order; the
//! first match wins. [`Ingestion`](crate::ingestion::Ingestion) calls
//! [`TriageEngine::evaluate`] before writing an inbox row.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::models::{TriageAction, TriageRule, TriageRuleCreator, TriageRuleType};

/// What matched, and what to do about it.
#[derive(Debug, Clone)]
pub struct TriageVerdict {
    pub rule_id: Option<uuid::Uuid>,
    pub action: TriageAction,
}

impl TriageVerdict {
    fn pass_through() -> Self {
        Self {
            rule_id: None,
            action: TriageAction::PassThrough,
        }
    }
}

/// The envelope fields triage rules can match against (`spec.md` §4.6).
#[derive(Debug, Clone)]
pub struct TriageCandidate<'a> {
    pub sender_identity: &'a str,
    pub headers: Option<&'a serde_json::Value>,
    pub mime_type: Option<&'a str>,
}

pub struct TriageEngine {
    pool: PgPool,
}

impl TriageEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Loads active rules in priority order and evaluates the first match.
    pub async fn evaluate(&self, candidate: &TriageCandidate<'_>) -> Result<TriageVerdict> {
        let rules = self.load_active_rules().await?;
        Ok(evaluate_rules(&rules, candidate))
    }

    async fn load_active_rules(&self) -> Result<Vec<TriageRule>> {
        let rows: Vec<TriageRuleDbRow> = sqlx::query_as(
            r#"
            SELECT id, rule_type, condition, action, priority, enabled, created_by, deleted_at
            FROM triage_rules
            WHERE enabled = true AND deleted_at IS NULL
            ORDER BY priority ASC, created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// Pure matcher, factored out so it can be unit tested without a pool.
fn evaluate_rules(rules: &[TriageRule], candidate: &TriageCandidate<'_>) -> TriageVerdict {
    for rule in rules {
        if !rule.is_active() {
            continue;
        }
        if rule_matches(rule, candidate) {
            return TriageVerdict {
                rule_id: Some(rule.id),
                action: rule.action.clone(),
            };
        }
    }
    TriageVerdict::pass_through()
}

fn rule_matches(rule: &TriageRule, candidate: &TriageCandidate<'_>) -> bool {
    match rule.rule_type {
        TriageRuleType::SenderAddress => rule
            .condition
            .get("address")
            .and_then(|v| v.as_str())
            .is_some_and(|addr| addr.eq_ignore_ascii_case(candidate.sender_identity)),
        TriageRuleType::SenderDomain => rule
            .condition
            .get("domain")
            .and_then(|v| v.as_str())
            .is_some_and(|domain| {
                candidate
                    .sender_identity
                    .rsplit_once('@')
                    .map(|(_, d)| d.eq_ignore_ascii_case(domain))
                    .unwrap_or(false)
            }),
        TriageRuleType::MimeType => rule
            .condition
            .get("mime_type")
            .and_then(|v| v.as_str())
            .is_some_and(|mime| Some(mime) == candidate.mime_type),
        TriageRuleType::HeaderCondition => {
            let (Some(headers), Some(expected)) = (candidate.headers, rule.condition.as_object()) else {
                return false;
            };
            expected.iter().all(|(key, value)| headers.get(key) == Some(value))
        }
    }
}

#[derive(sqlx::FromRow)]
struct TriageRuleDbRow {
    id: uuid::Uuid,
    rule_type: String,
    condition: serde_json::Value,
    action: String,
    priority: i32,
    enabled: bool,
    created_by: String,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<TriageRuleDbRow> for TriageRule {
    type Error = crate::error::Error;

    fn try_from(row: TriageRuleDbRow) -> Result<Self> {
        Ok(TriageRule {
            id: row.id,
            rule_type: parse_rule_type(&row.rule_type)?,
            condition: row.condition,
            action: TriageAction::from_column(&row.action)?,
            priority: row.priority.max(0) as u32,
            enabled: row.enabled,
            created_by: parse_creator(&row.created_by)?,
            deleted_at: row.deleted_at,
        })
    }
}

fn parse_rule_type(raw: &str) -> Result<TriageRuleType> {
    Ok(match raw {
        "sender_domain" => TriageRuleType::SenderDomain,
        "sender_address" => TriageRuleType::SenderAddress,
        "header_condition" => TriageRuleType::HeaderCondition,
        "mime_type" => TriageRuleType::MimeType,
        other => {
            return Err(crate::error::Error::domain(
                crate::error::ErrorKind::InternalError,
                format!("unknown triage rule_type '{other}'"),
            ))
        }
    })
}

fn parse_creator(raw: &str) -> Result<TriageRuleCreator> {
    Ok(match raw {
        "dashboard" => TriageRuleCreator::Dashboard,
        "api" => TriageRuleCreator::Api,
        "seed" => TriageRuleCreator::Seed,
        other => {
            return Err(crate::error::Error::domain(
                crate::error::ErrorKind::InternalError,
                format!("unknown triage rule creator '{other}'"),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rule(rule_type: TriageRuleType, condition: serde_json::Value, action: TriageAction, priority: u32) -> TriageRule {
        TriageRule {
            id: Uuid::new_v4(),
            rule_type,
            condition,
            action,
            priority,
            enabled: true,
            created_by: TriageRuleCreator::Dashboard,
            deleted_at: None,
        }
    }

    #[test]
    fn first_matching_rule_wins_by_priority_order() {
        let rules = vec![
            rule(
                TriageRuleType::SenderDomain,
                serde_json::json!({"domain": "newsletters.example.com"}),
                TriageAction::Skip,
                10,
            ),
            rule(
                TriageRuleType::SenderAddress,
                serde_json::json!({"address": "boss@example.com"}),
                TriageAction::RouteTo { butler: "inbox-butler".to_string() },
                20,
            ),
        ];
        let candidate = TriageCandidate {
            sender_identity: "alerts@newsletters.example.com",
            headers: None,
            mime_type: None,
        };
        let verdict = evaluate_rules(&rules, &candidate);
        assert_eq!(verdict.action, TriageAction::Skip);
    }

    #[test]
    fn no_match_falls_through() {
        let rules = vec![rule(
            TriageRuleType::SenderAddress,
            serde_json::json!({"address": "nobody@example.com"}),
            TriageAction::Skip,
            10,
        )];
        let candidate = TriageCandidate {
            sender_identity: "someone@example.com",
            headers: None,
            mime_type: None,
        };
        let verdict = evaluate_rules(&rules, &candidate);
        assert_eq!(verdict.action, TriageAction::PassThrough);
        assert!(verdict.rule_id.is_none());
    }

    #[test]
    fn disabled_or_deleted_rules_are_skipped() {
        let mut r = rule(
            TriageRuleType::SenderAddress,
            serde_json::json!({"address": "someone@example.com"}),
            TriageAction::Skip,
            10,
        );
        r.enabled = false;
        let candidate = TriageCandidate {
            sender_identity: "someone@example.com",
            headers: None,
            mime_type: None,
        };
        let verdict = evaluate_rules(&[r], &candidate);
        assert_eq!(verdict.action, TriageAction::PassThrough);
    }

    #[test]
    fn header_condition_requires_all_keys_to_match() {
        let rule = rule(
            TriageRuleType::HeaderCondition,
            serde_json::json!({"x-priority": "low"}),
            TriageAction::LowPriorityQueue,
            5,
        );
        let headers = serde_json::json!({"x-priority": "low", "x-other": "x"});
        let candidate = TriageCandidate {
            sender_identity: "a@b.com",
            headers: Some(&headers),
            mime_type: None,
        };
        let verdict = evaluate_rules(&[rule], &candidate);
        assert_eq!(verdict.action, TriageAction::LowPriorityQueue);
    }
}
