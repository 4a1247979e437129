//! Butler Registry & Heartbeat (`spec.md` §4.3).
//!
//! Liveness tracking that gates routing eligibility. The registry is the
//! `shared`/`switchboard`-schema table every butler heartbeats against;
//! only the switchboard daemon runs the background sweeper, but any daemon
//! can call [`Registry::heartbeat`] against its own row.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::models::{eligibility_reason, ButlerRegistryRow, EligibilityState};

/// Outcome of a heartbeat call (`spec.md` §6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub eligibility_state: EligibilityState,
}

pub struct Registry {
    pool: PgPool,
}

impl Registry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `spec.md` §4.3 steps 1-4.
    ///
    /// 1. Self-heals a missing row for a known configured butler.
    /// 2. CAS-transitions `stale`/`quarantined` back to `active`, logging the
    ///    transition with a canonical reason.
    /// 3. Otherwise just bumps `last_seen_at`.
    pub async fn heartbeat(&self, butler_name: &str, endpoint_url: &str) -> Result<HeartbeatOutcome> {
        let row = self.load(butler_name).await?;

        let row = match row {
            Some(row) => row,
            None => self.self_heal_register(butler_name, endpoint_url).await?,
        };

        match row.eligibility_state {
            EligibilityState::Active => {
                self.touch_last_seen(butler_name).await?;
                Ok(HeartbeatOutcome {
                    eligibility_state: EligibilityState::Active,
                })
            }
            previous @ (EligibilityState::Stale | EligibilityState::Quarantined) => {
                let reason = match previous {
                    EligibilityState::Stale => eligibility_reason::HEALTH_RESTORED,
                    EligibilityState::Quarantined => eligibility_reason::HEARTBEAT_RECOVERY,
                    EligibilityState::Active => unreachable!(),
                };
                let new_state = self
                    .cas_to_active(butler_name, previous, reason)
                    .await?;
                Ok(HeartbeatOutcome {
                    eligibility_state: new_state,
                })
            }
        }
    }

    async fn load(&self, butler_name: &str) -> Result<Option<ButlerRegistryRow>> {
        let row = sqlx::query_as::<_, RegistryDbRow>(
            r#"
            SELECT butler_name, endpoint_url, last_seen_at, eligibility_state, eligibility_updated_at
            FROM butler_registry WHERE butler_name = $1
            "#,
        )
        .bind(butler_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn self_heal_register(&self, butler_name: &str, endpoint_url: &str) -> Result<ButlerRegistryRow> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO butler_registry (butler_name, endpoint_url, last_seen_at, eligibility_state, eligibility_updated_at)
            VALUES ($1, $2, $3, 'active', $3)
            ON CONFLICT (butler_name) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(butler_name)
        .bind(endpoint_url)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(butler = butler_name, "self-healed missing registry row");

        Ok(ButlerRegistryRow {
            butler_name: butler_name.to_string(),
            endpoint_url: endpoint_url.to_string(),
            last_seen_at: now,
            eligibility_state: EligibilityState::Active,
            eligibility_updated_at: now,
        })
    }

    async fn touch_last_seen(&self, butler_name: &str) -> Result<()> {
        sqlx::query("UPDATE butler_registry SET last_seen_at = $2 WHERE butler_name = $1")
            .bind(butler_name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Compare-and-set `previous -> active`, guarded by the previous state
    /// value. On a concurrent modification (0 rows changed), re-reads and
    /// returns the current state without inserting a log row.
    async fn cas_to_active(
        &self,
        butler_name: &str,
        previous: EligibilityState,
        reason: &str,
    ) -> Result<EligibilityState> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE butler_registry
            SET eligibility_state = 'active', eligibility_updated_at = $3, last_seen_at = $3
            WHERE butler_name = $1 AND eligibility_state = $2
            "#,
        )
        .bind(butler_name)
        .bind(previous.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            sqlx::query(
                r#"
                INSERT INTO butler_registry_eligibility_log (id, butler_name, previous_state, new_state, reason, recorded_at)
                VALUES ($1, $2, $3, 'active', $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(butler_name)
            .bind(previous.to_string())
            .bind(reason)
            .bind(now)
            .execute(&self.pool)
            .await?;

            Ok(EligibilityState::Active)
        } else {
            let row = self
                .load(butler_name)
                .await?
                .ok_or_else(|| Error::domain(ErrorKind::NotFound, "butler vanished mid-heartbeat"))?;
            Ok(row.eligibility_state)
        }
    }

    /// The registered endpoint for `butler_name`, used by HTTP-based
    /// `route.execute` dispatch to resolve a target butler name to a URL.
    pub async fn endpoint_url(&self, butler_name: &str) -> Result<Option<String>> {
        Ok(self.load(butler_name).await?.map(|row| row.endpoint_url))
    }

    /// Whether `butler_name` may currently receive routed requests, per the
    /// caller's stale/quarantine policy (`spec.md` §4.3 last paragraph).
    pub async fn is_routable(&self, butler_name: &str, allow_stale: bool, allow_quarantined: bool) -> Result<bool> {
        let row = self.load(butler_name).await?;
        Ok(match row.map(|r| r.eligibility_state) {
            Some(EligibilityState::Active) => true,
            Some(EligibilityState::Stale) => allow_stale,
            Some(EligibilityState::Quarantined) => allow_quarantined,
            None => false,
        })
    }

    /// Background sweeper: `active -> stale` after `stale_after_s` silence,
    /// `stale -> quarantined` after a further `quarantine_after_s` silence
    /// (`spec.md` §4.3 last paragraph).
    pub async fn sweep(&self, stale_after_s: i64, quarantine_after_s: i64) -> Result<SweepReport> {
        let now = Utc::now();
        let stale_cutoff = now - chrono::Duration::seconds(stale_after_s);
        let quarantine_cutoff = now - chrono::Duration::seconds(stale_after_s + quarantine_after_s);

        let stale_rows = self
            .transition_batch(EligibilityState::Active, EligibilityState::Stale, stale_cutoff, eligibility_reason::STALE_TIMEOUT)
            .await?;
        let quarantined_rows = self
            .transition_batch(EligibilityState::Stale, EligibilityState::Quarantined, quarantine_cutoff, eligibility_reason::QUARANTINE_TIMEOUT)
            .await?;

        Ok(SweepReport {
            staled: stale_rows,
            quarantined: quarantined_rows,
        })
    }

    async fn transition_batch(
        &self,
        from: EligibilityState,
        to: EligibilityState,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE butler_registry
            SET eligibility_state = $3, eligibility_updated_at = $4
            WHERE eligibility_state = $1 AND last_seen_at < $2
            RETURNING butler_name
            "#,
        )
        .bind(from.to_string())
        .bind(cutoff)
        .bind(to.to_string())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for name in &names {
            sqlx::query(
                r#"
                INSERT INTO butler_registry_eligibility_log (id, butler_name, previous_state, new_state, reason, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(from.to_string())
            .bind(to.to_string())
            .bind(reason)
            .bind(now)
            .execute(&self.pool)
            .await?;
            tracing::warn!(butler = name.as_str(), from = %from, to = %to, "eligibility transition");
        }

        Ok(names)
    }
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub staled: Vec<String>,
    pub quarantined: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct RegistryDbRow {
    butler_name: String,
    endpoint_url: String,
    last_seen_at: DateTime<Utc>,
    eligibility_state: String,
    eligibility_updated_at: DateTime<Utc>,
}

impl TryFrom<RegistryDbRow> for ButlerRegistryRow {
    type Error = Error;

    fn try_from(row: RegistryDbRow) -> Result<Self> {
        Ok(ButlerRegistryRow {
            butler_name: row.butler_name,
            endpoint_url: row.endpoint_url,
            last_seen_at: row.last_seen_at,
            eligibility_state: row.eligibility_state.parse()?,
            eligibility_updated_at: row.eligibility_updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_reason_selection_matches_spec() {
        assert_eq!(eligibility_reason::HEALTH_RESTORED, "health_restored");
        assert_eq!(eligibility_reason::HEARTBEAT_RECOVERY, "heartbeat_recovery");
    }

    #[test]
    fn eligibility_state_round_trips_through_text_column() {
        for state in [EligibilityState::Active, EligibilityState::Stale, EligibilityState::Quarantined] {
            let column = state.to_string();
            let parsed: EligibilityState = column.parse().unwrap();
            assert_eq!(parsed, state);
        }
    }
}
