//! Dependency-injection root (`spec.md` §9's "ambient global singletons"
//! redesign flag; `SPEC_FULL.md` §A).
//!
//! One `Context` is built at daemon startup and handed by reference (or
//! clone, since every field is cheaply `Clone`) to every component: the
//! registry, the spawner, the buffer, the pipeline. Nothing reaches for a
//! process-wide singleton.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::ButlerMetrics;
use crate::registry::Registry;
use crate::retention::Retention;

/// Everything a component needs to do its job, constructed once per daemon.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub db_pool: PgPool,
    pub metrics: Arc<ButlerMetrics>,
    /// The name of the butler this daemon is running as (`spec.md` §2).
    pub butler_name: String,
}

impl Context {
    /// Build a `Context` from a loaded configuration: opens the DB pool
    /// (sized per `spec.md` §5, `worker_count + spawner_semaphore +
    /// background_loops`) and constructs the metrics instrument set.
    pub async fn build(config: Config) -> Result<Self> {
        let pool_size = (config.buffer.worker_count + config.spawner.max_concurrent_sessions + 8) as u32;

        let db_pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(&config.database.url)
            .await?;

        let butler_name = config.service.name.clone();
        let metrics = Arc::new(ButlerMetrics::new(&butler_name));

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            metrics,
            butler_name,
        })
    }

    /// Build a `Context` around an already-open pool, used by tests that
    /// share a single `sqlx::PgPool` fixture across components.
    pub fn with_pool(config: Config, db_pool: PgPool) -> Self {
        let butler_name = config.service.name.clone();
        let metrics = Arc::new(ButlerMetrics::new(&butler_name));
        Self {
            config: Arc::new(config),
            db_pool,
            metrics,
            butler_name,
        }
    }

    pub fn is_switchboard(&self) -> bool {
        self.config.service.is_switchboard
    }

    /// The fleet-wide liveness table (`spec.md` §4.3). Every daemon builds
    /// one against its own row.
    pub fn registry(&self) -> Registry {
        Registry::new(self.db_pool.clone())
    }

    /// Switchboard-only retention sweeper (`spec.md` §4.10).
    pub fn retention(&self) -> Retention {
        Retention::new(self.db_pool.clone(), self.config.retention.clone())
    }
}
