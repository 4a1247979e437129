//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `BUTLER_`)
//! 2. `--config <dir>/config.toml` (CLI-supplied directory, see `butlerd`)
//! 3. Current working directory: `./config.toml`
//! 4. Default values
//!
//! Every duration-shaped field is stored in seconds (`_s` suffix) so it
//! round-trips through TOML and environment variables without a custom
//! deserializer; components convert to [`std::time::Duration`] at the call
//! site.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Top-level daemon configuration, one instance per butler process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity and HTTP surface of this daemon.
    pub service: ServiceConfig,

    /// PostgreSQL connection settings (shared cluster, per-butler schema).
    pub database: DatabaseConfig,

    /// OpenTelemetry exporter settings.
    #[serde(default)]
    pub otlp: Option<OtlpConfig>,

    /// Durable buffer tuning. Only meaningful on the switchboard butler.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Default circuit breaker config, keyed by provider name for overrides.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    /// Rate limiter / admission control tuning.
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// Registry & heartbeat sweep tuning.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Per-butler spawner concurrency cap.
    #[serde(default)]
    pub spawner: SpawnerConfig,

    /// Route inbox recovery tuning.
    #[serde(default)]
    pub route: RouteConfig,

    /// Retention / partition cleanup windows.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// History hydration / extraction tuning for the message pipeline.
    /// Only meaningful on the switchboard butler.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-channel reaction sink credentials. Only meaningful on the
    /// switchboard butler.
    #[serde(default)]
    pub reactions: ReactionsConfig,
}

/// Service-level identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Butler name, e.g. `switchboard`, `health`, `relationships`.
    pub name: String,

    /// Whether this daemon is the fleet-wide switchboard.
    #[serde(default)]
    pub is_switchboard: bool,

    /// HTTP port for ingest/heartbeat endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deployment environment (dev, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Per-request timeout for the ingest/heartbeat HTTP surface.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum accepted request body size, in megabytes.
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// CORS policy: `permissive`, `restrictive`, or `disabled`. The butler
    /// fleet's HTTP surface is internal-only, so `restrictive` is the
    /// default.
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,

    /// This daemon's own externally-reachable base URL, stored in
    /// `butler_registry.endpoint_url` on self-healing registration.
    #[serde(default)]
    pub endpoint_url: String,
}

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "restrictive".to_string()
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL. Falls back to `BUTLER_DB_URL` env var.
    pub url: String,

    /// Schema this daemon's role operates in (`search_path`).
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_schema() -> String {
    "public".to_string()
}
fn default_max_connections() -> u32 {
    10
}

/// OpenTelemetry OTLP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// Collector endpoint, e.g. `http://localhost:4317`.
    pub endpoint: String,
}

/// Durable buffer configuration (`spec.md` §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Bounded in-memory queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of worker coroutines draining the queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Scanner sweep interval in seconds.
    #[serde(default = "default_scanner_interval_s")]
    pub scanner_interval_s: u64,

    /// Grace period before a row is eligible for cold-path recovery.
    #[serde(default = "default_scanner_grace_s")]
    pub scanner_grace_s: i64,

    /// Max rows fetched per scanner sweep.
    #[serde(default = "default_scanner_batch_size")]
    pub scanner_batch_size: i64,

    /// Seconds to wait for the queue to drain on shutdown.
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_worker_count() -> usize {
    4
}
fn default_scanner_interval_s() -> u64 {
    30
}
fn default_scanner_grace_s() -> i64 {
    15
}
fn default_scanner_batch_size() -> i64 {
    100
}
fn default_drain_timeout_s() -> u64 {
    10
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            scanner_interval_s: default_scanner_interval_s(),
            scanner_grace_s: default_scanner_grace_s(),
            scanner_batch_size: default_scanner_batch_size(),
            drain_timeout_s: default_drain_timeout_s(),
        }
    }
}

/// A single provider's circuit breaker knobs (`spec.md` §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing half-open.
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: f64,

    /// Upper bound on concurrent half-open probes.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,

    /// Consecutive half-open successes required to close the circuit.
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,

    /// Whether a timeout error counts toward the failure threshold.
    #[serde(default = "default_true")]
    pub count_timeout_as_failure: bool,

    /// Whether a target-unavailable error counts toward the failure threshold.
    #[serde(default = "default_true")]
    pub count_target_unavailable_as_failure: bool,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_seconds() -> f64 {
    60.0
}
fn default_half_open_max_attempts() -> u32 {
    3
}
fn default_half_open_success_threshold() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            half_open_max_attempts: default_half_open_max_attempts(),
            half_open_success_threshold: default_half_open_success_threshold(),
            count_timeout_as_failure: true,
            count_target_unavailable_as_failure: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Build a config by applying partial overrides from a generic map onto
    /// defaults. Mirrors the Python original's `CircuitBreakerConfig.from_config`
    /// used to build per-provider overrides from a TOML table.
    pub fn from_map(overrides: &HashMap<String, toml::Value>) -> Self {
        let mut config = Self::default();
        if let Some(v) = overrides.get("failure_threshold").and_then(|v| v.as_integer()) {
            config.failure_threshold = v as u32;
        }
        if let Some(v) = overrides
            .get("recovery_timeout_seconds")
            .and_then(|v| v.as_float())
        {
            config.recovery_timeout_seconds = v;
        }
        if let Some(v) = overrides
            .get("half_open_max_attempts")
            .and_then(|v| v.as_integer())
        {
            config.half_open_max_attempts = v as u32;
        }
        if let Some(v) = overrides
            .get("half_open_success_threshold")
            .and_then(|v| v.as_integer())
        {
            config.half_open_success_threshold = v as u32;
        }
        if let Some(v) = overrides
            .get("count_timeout_as_failure")
            .and_then(|v| v.as_bool())
        {
            config.count_timeout_as_failure = v;
        }
        if let Some(v) = overrides
            .get("count_target_unavailable_as_failure")
            .and_then(|v| v.as_bool())
        {
            config.count_target_unavailable_as_failure = v;
        }
        config
    }
}

/// `[circuit_breaker]` TOML section: a default plus per-provider overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CircuitBreakerSection {
    /// Config applied to any provider without a specific override.
    #[serde(default)]
    pub default: CircuitBreakerConfig,

    /// Per-provider overrides, e.g. `[circuit_breaker.providers.telegram]`.
    #[serde(default)]
    pub providers: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerSection {
    /// Resolve the effective config for a named provider.
    pub fn for_provider(&self, provider: &str) -> CircuitBreakerConfig {
        self.providers
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Rate limiter configuration (`spec.md` §4.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSection {
    /// Global admissions per minute across all channels.
    #[serde(default = "default_global_max_per_minute")]
    pub global_max_per_minute: u32,

    /// Global concurrent in-flight deliveries.
    #[serde(default = "default_global_max_in_flight")]
    pub global_max_in_flight: u32,

    /// Per `channel.identity_scope` admissions per minute, e.g. `telegram.bot`.
    #[serde(default = "default_channel_limits")]
    pub channel_limits: HashMap<String, u32>,

    /// Per-recipient anti-flood admissions per minute.
    #[serde(default = "default_per_recipient_max_per_minute")]
    pub per_recipient_max_per_minute: u32,

    /// Token cost divisor applied to `intent=reply` deliveries.
    #[serde(default = "default_reply_priority_multiplier")]
    pub reply_priority_multiplier: f64,
}

fn default_global_max_per_minute() -> u32 {
    60
}
fn default_global_max_in_flight() -> u32 {
    100
}
fn default_channel_limits() -> HashMap<String, u32> {
    let mut m = HashMap::new();
    m.insert("telegram.bot".to_string(), 30);
    m.insert("telegram.user".to_string(), 20);
    m.insert("email.bot".to_string(), 20);
    m.insert("email.user".to_string(), 10);
    m
}
fn default_per_recipient_max_per_minute() -> u32 {
    10
}
fn default_reply_priority_multiplier() -> f64 {
    2.0
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            global_max_per_minute: default_global_max_per_minute(),
            global_max_in_flight: default_global_max_in_flight(),
            channel_limits: default_channel_limits(),
            per_recipient_max_per_minute: default_per_recipient_max_per_minute(),
            reply_priority_multiplier: default_reply_priority_multiplier(),
        }
    }
}

/// Registry & heartbeat sweep configuration (`spec.md` §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Seconds of silence before `active` becomes `stale`.
    #[serde(default = "default_stale_after_s")]
    pub stale_after_s: i64,

    /// Seconds of silence (from going stale) before `stale` becomes `quarantined`.
    #[serde(default = "default_quarantine_after_s")]
    pub quarantine_after_s: i64,

    /// Interval between sweeper runs.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,

    /// Whether routing is permitted to `stale` butlers by default.
    #[serde(default)]
    pub allow_stale_by_default: bool,

    /// Interval between this daemon's own heartbeat pushes to the
    /// switchboard's `/api/switchboard/heartbeat` endpoint.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    /// Base URL of the switchboard daemon, used by every non-switchboard
    /// butler to push heartbeats (`spec.md` §6.2).
    #[serde(default)]
    pub switchboard_url: String,

    /// Known fleet members, `butler_name -> endpoint_url`, consulted by the
    /// switchboard's heartbeat handler for self-healing registration of a
    /// butler it has never seen a row for (`spec.md` §4.3 step 1).
    #[serde(default)]
    pub known_butlers: HashMap<String, String>,
}

fn default_stale_after_s() -> i64 {
    300
}
fn default_quarantine_after_s() -> i64 {
    1800
}
fn default_sweep_interval_s() -> u64 {
    60
}
fn default_heartbeat_interval_s() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_s: default_stale_after_s(),
            quarantine_after_s: default_quarantine_after_s(),
            sweep_interval_s: default_sweep_interval_s(),
            allow_stale_by_default: false,
            heartbeat_interval_s: default_heartbeat_interval_s(),
            switchboard_url: String::new(),
            known_butlers: HashMap::new(),
        }
    }
}

/// Spawner concurrency configuration (`spec.md` §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnerConfig {
    /// Maximum simultaneous LLM sessions for this butler.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Seconds to await outstanding sessions during drain.
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,

    /// External command invoked as the LLM runtime adapter: the prompt is
    /// written to its stdin, its stdout is captured as the session output
    /// (`SPEC_FULL.md` §E — the real subprocess wrapper itself is out of
    /// scope; this wires the narrow command-exec shim the doc comment on
    /// `spawner::SessionRuntime` describes). Unset means no adapter is
    /// configured and `trigger()` fails with `target_unavailable`.
    #[serde(default)]
    pub runtime_command: Option<String>,

    /// Model label recorded on the `Session` row for sessions run through
    /// `runtime_command`.
    #[serde(default = "default_runtime_model")]
    pub runtime_model: String,
}

fn default_max_concurrent_sessions() -> usize {
    4
}
fn default_runtime_model() -> String {
    "external".to_string()
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            drain_timeout_s: default_drain_timeout_s(),
            runtime_command: None,
            runtime_model: default_runtime_model(),
        }
    }
}

/// Route inbox dispatch/recovery configuration (`spec.md` §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Consecutive processing failures before a request is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Grace window (seconds) shared by both the startup sweep and the
    /// steady-state orphan reclaim (see `SPEC_FULL.md` §D).
    #[serde(default = "default_recovery_grace_s")]
    pub recovery_grace_s: i64,

    /// Age (seconds) after which a `processing` row is presumed orphaned.
    #[serde(default = "default_processing_timeout_s")]
    pub processing_timeout_s: i64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_recovery_grace_s() -> i64 {
    120
}
fn default_processing_timeout_s() -> i64 {
    300
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            recovery_grace_s: default_recovery_grace_s(),
            processing_timeout_s: default_processing_timeout_s(),
        }
    }
}

/// Message pipeline configuration: history hydration window and extraction
/// confidence gating (`spec.md` §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// History hydration time window (minutes); whichever of this or
    /// `history_max_messages` admits more rows wins.
    #[serde(default = "default_history_window_minutes")]
    pub history_window_minutes: i64,

    /// History hydration count bound.
    #[serde(default = "default_history_max_messages")]
    pub history_max_messages: i64,

    /// Minimum confidence tier that auto-dispatches an extraction without
    /// human review.
    #[serde(default = "default_auto_dispatch_confidence")]
    pub auto_dispatch_confidence: String,
}

fn default_history_window_minutes() -> i64 {
    15
}
fn default_history_max_messages() -> i64 {
    30
}
fn default_auto_dispatch_confidence() -> String {
    "high".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window_minutes: default_history_window_minutes(),
            history_max_messages: default_history_max_messages(),
            auto_dispatch_confidence: default_auto_dispatch_confidence(),
        }
    }
}

/// Retention & partition cleanup configuration (`spec.md` §4.10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Days to keep decided `pending_actions` rows.
    #[serde(default = "default_pending_actions_days")]
    pub pending_actions_days: i64,

    /// Days to keep inactive `approval_rules` rows.
    #[serde(default = "default_approval_rules_days")]
    pub approval_rules_days: i64,

    /// Days to keep `approval_events` rows (requires privileged deletion).
    #[serde(default = "default_approval_events_days")]
    pub approval_events_days: i64,

    /// How often the sweeper runs.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,

    /// Months of partitions to keep for `message_inbox` and heartbeat logs.
    #[serde(default = "default_partition_keep_months")]
    pub partition_keep_months: u32,
}

fn default_pending_actions_days() -> i64 {
    90
}
fn default_approval_rules_days() -> i64 {
    180
}
fn default_approval_events_days() -> i64 {
    365
}
fn default_partition_keep_months() -> u32 {
    13
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            pending_actions_days: default_pending_actions_days(),
            approval_rules_days: default_approval_rules_days(),
            approval_events_days: default_approval_events_days(),
            sweep_interval_s: default_sweep_interval_s(),
            partition_keep_months: default_partition_keep_months(),
        }
    }
}

/// Reaction sink credentials (`spec.md` §4.8 step 6). Only the Telegram
/// channel has a concrete sink; an unset token falls back to a no-op that
/// logs the reaction it would have emitted.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReactionsConfig {
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
}

impl Config {
    /// Load configuration for a butler daemon.
    ///
    /// Searches, in priority order: `<config_dir>/config.toml`, then
    /// `./config.toml`, then built-in defaults. `BUTLER_`-prefixed
    /// environment variables override everything, split on `_` into nested
    /// keys (e.g. `BUTLER_DATABASE_URL` -> `database.url`).
    pub fn load(config_dir: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default_shape()));

        if let Some(dir) = config_dir {
            let path = dir.join("config.toml");
            if path.exists() {
                tracing::info!(path = %path.display(), "loading configuration");
                figment = figment.merge(Toml::file(path));
            }
        }

        let cwd_path = PathBuf::from("config.toml");
        if cwd_path.exists() {
            figment = figment.merge(Toml::file(cwd_path));
        }

        figment = figment.merge(Env::prefixed("BUTLER_").split("_"));

        let config: Config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from an explicit file path, bypassing search.
    /// Used by tests and non-standard deployments.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default_shape()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BUTLER_").split("_"))
            .extract()?;
        Ok(config)
    }

    /// The built-in default configuration, before any file/env overrides.
    pub fn default_shape() -> Self {
        Self {
            service: ServiceConfig {
                name: "switchboard".to_string(),
                is_switchboard: false,
                port: default_port(),
                log_level: default_log_level(),
                environment: default_environment(),
                timeout_secs: default_timeout_secs(),
                body_limit_mb: default_body_limit_mb(),
                cors_mode: default_cors_mode(),
                endpoint_url: String::new(),
            },
            database: DatabaseConfig {
                url: String::new(),
                schema: default_schema(),
                max_connections: default_max_connections(),
            },
            otlp: None,
            buffer: BufferConfig::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            rate_limit: RateLimitSection::default(),
            registry: RegistryConfig::default(),
            spawner: SpawnerConfig::default(),
            route: RouteConfig::default(),
            retention: RetentionConfig::default(),
            pipeline: PipelineConfig::default(),
            reactions: ReactionsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default_shape();
        assert_eq!(config.circuit_breaker.default.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.default.recovery_timeout_seconds, 60.0);
        assert_eq!(config.rate_limit.global_max_per_minute, 60);
        assert_eq!(config.rate_limit.reply_priority_multiplier, 2.0);
        assert_eq!(config.buffer.worker_count, 4);
        assert_eq!(config.retention.pending_actions_days, 90);
    }

    #[test]
    fn circuit_breaker_section_falls_back_to_default() {
        let section = CircuitBreakerSection::default();
        let cfg = section.for_provider("telegram");
        assert_eq!(cfg, CircuitBreakerConfig::default());
    }

    #[test]
    fn circuit_breaker_section_uses_provider_override() {
        let mut section = CircuitBreakerSection::default();
        section.providers.insert(
            "telegram".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );
        assert_eq!(section.for_provider("telegram").failure_threshold, 2);
        assert_eq!(section.for_provider("email").failure_threshold, 5);
    }

    #[test]
    fn circuit_breaker_config_from_map_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("failure_threshold".to_string(), toml::Value::Integer(3));
        overrides.insert(
            "count_timeout_as_failure".to_string(),
            toml::Value::Boolean(false),
        );
        let cfg = CircuitBreakerConfig::from_map(&overrides);
        assert_eq!(cfg.failure_threshold, 3);
        assert!(!cfg.count_timeout_as_failure);
        assert_eq!(cfg.half_open_success_threshold, 2);
    }
}
