//! Retention & Partition Cleanup (`spec.md` §4.10).
//!
//! Three independent TTL windows plus monthly-partition lifecycle
//! management for the partitioned audit tables. Pending rows are never
//! deleted regardless of age — only terminal states age out.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::config::RetentionConfig;
use crate::error::Result;

pub struct RetentionReport {
    pub pending_actions_deleted: u64,
    pub approval_rules_deleted: u64,
    pub approval_events_deleted: u64,
}

pub struct Retention {
    pool: PgPool,
    config: RetentionConfig,
}

impl Retention {
    pub fn new(pool: PgPool, config: RetentionConfig) -> Self {
        Self { pool, config }
    }

    /// Runs all three sweeps (`spec.md` §4.10). Intended to be invoked on a
    /// `sweep_interval_s` cadence by the switchboard daemon.
    pub async fn run_sweep(&self) -> Result<RetentionReport> {
        let pending_actions_deleted = self.sweep_pending_actions().await?;
        let approval_rules_deleted = self.sweep_approval_rules().await?;
        let approval_events_deleted = self.sweep_approval_events().await?;

        Ok(RetentionReport {
            pending_actions_deleted,
            approval_rules_deleted,
            approval_events_deleted,
        })
    }

    /// `pending_actions`: only rows with a *terminal* status and
    /// `decided_at` older than the window are eligible; `pending` rows are
    /// never touched here (they age out via the expiry sweeper instead).
    async fn sweep_pending_actions(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.pending_actions_days);
        let result = sqlx::query(
            r#"
            DELETE FROM approvals
            WHERE status IN ('approved', 'rejected', 'expired', 'executed')
              AND decided_at IS NOT NULL
              AND decided_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// `approval_rules`: inactive-only, `created_at` older than the window.
    /// Active rules are never deleted.
    async fn sweep_approval_rules(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.approval_rules_days);
        let result = sqlx::query("DELETE FROM approval_rules WHERE active = false AND created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// `approval_events`: append-only audit log; requires `privileged=true`
    /// on the row (a defense against deleting non-privileged audit rows by
    /// accident) and `recorded_at` older than the window.
    async fn sweep_approval_events(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.approval_events_days);
        let result = sqlx::query("DELETE FROM approval_events WHERE privileged = true AND recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Ensures the monthly partition covering `reference_ts` exists for
    /// `table_name` (`message_inbox`, `connector_heartbeat_log`, ...).
    /// Delegates to the `ensure_partition` SQL function installed by the
    /// switchboard schema migration.
    pub async fn ensure_partition(&self, table_name: &str, reference_ts: DateTime<Utc>) -> Result<()> {
        sqlx::query("SELECT ensure_partition($1, $2)")
            .bind(table_name)
            .bind(reference_ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops partitions of `table_name` older than `partition_keep_months`.
    pub async fn drop_old_partitions(&self, table_name: &str) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::days(30 * self.config.partition_keep_months as i64);
        let dropped: Vec<String> = sqlx::query_scalar("SELECT drop_old_partitions($1, $2)")
            .bind(table_name)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        if !dropped.is_empty() {
            tracing::info!(table = table_name, partitions = ?dropped, "dropped old partitions");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_windows_match_spec_defaults() {
        let config = RetentionConfig::default();
        assert_eq!(config.pending_actions_days, 90);
        assert_eq!(config.approval_rules_days, 180);
        assert_eq!(config.approval_events_days, 365);
    }
}
