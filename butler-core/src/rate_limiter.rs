//! Layered admission control (`spec.md` §4.2).
//!
//! Grounded directly on `roster/messenger/tools/rate_limiter.py`: three
//! token-bucket layers (global, channel+identity, recipient anti-flood)
//! checked in order, with reply intents costing a fraction of a normal
//! token and a refund walked back through already-consumed layers when a
//! later layer rejects. A provider-reported throttle (e.g. an HTTP 429)
//! short-circuits all three layers until its `retry_after` passes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RateLimitSection;

/// Delivery intent, affecting token cost (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Send,
    Reply,
}

/// Which limit layer rejected a delivery, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Provider,
    GlobalInFlight,
    Global,
    Channel,
    Recipient,
}

/// Outcome of [`RateLimiter::check_admission`].
#[derive(Debug, Clone)]
pub enum AdmissionResult {
    Admitted,
    Rejected {
        error_class: RejectionClass,
        error_message: String,
        retry_after_seconds: f64,
        limit_type: LimitType,
    },
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted)
    }
}

/// The two error classes a rejection can carry (`spec.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionClass {
    OverloadRejected,
    TargetUnavailable,
}

/// A fractional token bucket, refilled lazily on access.
#[derive(Debug, Clone)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_rate_per_second: f64,
    last_refill: DateTime<Utc>,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate_per_second: capacity / 60.0,
            last_refill: Utc::now(),
        }
    }

    fn refill(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn consume(&mut self, count: f64) -> bool {
        self.refill();
        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    fn refund(&mut self, count: f64) {
        self.tokens = (self.tokens + count).min(self.capacity);
    }

    fn available(&mut self) -> u32 {
        self.refill();
        self.tokens as u32
    }

    fn time_until_available(&mut self, count: f64) -> f64 {
        self.refill();
        if self.tokens >= count {
            0.0
        } else {
            (count - self.tokens) / self.refill_rate_per_second
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderThrottle {
    retry_after: DateTime<Utc>,
    reason: String,
}

struct State {
    global_bucket: Bucket,
    channel_buckets: HashMap<String, Bucket>,
    recipient_buckets: HashMap<String, Bucket>,
    in_flight_total: u32,
    in_flight_by_channel: HashMap<String, u32>,
    in_flight_by_recipient: HashMap<String, u32>,
    provider_throttles: HashMap<String, ProviderThrottle>,
}

/// Layered token-bucket admission controller for outbound deliveries.
pub struct RateLimiter {
    config: RateLimitSection,
    state: Mutex<State>,
}

/// Read-only snapshot of rate limiter state, for the operational status
/// endpoint (`spec.md` §4.2 carries `get_status` for the circuit breaker;
/// the Python original exposes the equivalent for the rate limiter too).
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    pub global_in_flight: u32,
    pub global_max_in_flight: u32,
    pub global_available_tokens: u32,
    pub global_capacity: u32,
    pub channels: HashMap<String, ChannelStatus>,
    pub provider_throttles: HashMap<String, ThrottleStatus>,
    pub top_recipients_in_flight: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub in_flight: u32,
    pub available_tokens: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStatus {
    pub retry_after_seconds: f64,
    pub reason: String,
}

impl RateLimiter {
    pub fn new(config: RateLimitSection) -> Self {
        let global_bucket = Bucket::new(config.global_max_per_minute);
        Self {
            config,
            state: Mutex::new(State {
                global_bucket,
                channel_buckets: HashMap::new(),
                recipient_buckets: HashMap::new(),
                in_flight_total: 0,
                in_flight_by_channel: HashMap::new(),
                in_flight_by_recipient: HashMap::new(),
                provider_throttles: HashMap::new(),
            }),
        }
    }

    fn channel_key(channel: &str, identity_scope: &str) -> String {
        format!("{channel}.{identity_scope}")
    }

    /// Check whether a delivery should be admitted, consuming tokens from
    /// every layer it passes. Call [`RateLimiter::release`] once the
    /// delivery completes (success or failure) to free the in-flight slot.
    pub fn check_admission(
        &self,
        channel: &str,
        identity_scope: &str,
        recipient: &str,
        intent: Intent,
    ) -> AdmissionResult {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        if let Some(throttle) = state.provider_throttles.get(channel) {
            let now = Utc::now();
            if now < throttle.retry_after {
                let retry_after_seconds = (throttle.retry_after - now).num_milliseconds() as f64 / 1000.0;
                return AdmissionResult::Rejected {
                    error_class: RejectionClass::TargetUnavailable,
                    error_message: format!("provider throttled: {}", throttle.reason),
                    retry_after_seconds,
                    limit_type: LimitType::Provider,
                };
            }
        }

        let token_cost = match intent {
            Intent::Reply => 1.0 / self.config.reply_priority_multiplier,
            Intent::Send => 1.0,
        };

        if state.in_flight_total >= self.config.global_max_in_flight {
            return AdmissionResult::Rejected {
                error_class: RejectionClass::OverloadRejected,
                error_message: format!(
                    "global in-flight limit reached ({}/{})",
                    state.in_flight_total, self.config.global_max_in_flight
                ),
                retry_after_seconds: 5.0,
                limit_type: LimitType::GlobalInFlight,
            };
        }

        if !state.global_bucket.consume(token_cost) {
            let retry_after_seconds = state.global_bucket.time_until_available(token_cost);
            return AdmissionResult::Rejected {
                error_class: RejectionClass::OverloadRejected,
                error_message: "global rate limit exceeded".to_string(),
                retry_after_seconds,
                limit_type: LimitType::Global,
            };
        }

        let channel_key = Self::channel_key(channel, identity_scope);
        let channel_limit = *self.config.channel_limits.get(&channel_key).unwrap_or(&30);
        let channel_bucket = state
            .channel_buckets
            .entry(channel_key.clone())
            .or_insert_with(|| Bucket::new(channel_limit));

        if !channel_bucket.consume(token_cost) {
            let retry_after_seconds = channel_bucket.time_until_available(token_cost);
            state.global_bucket.refund(token_cost);
            return AdmissionResult::Rejected {
                error_class: RejectionClass::OverloadRejected,
                error_message: format!("channel {channel_key} rate limit exceeded"),
                retry_after_seconds,
                limit_type: LimitType::Channel,
            };
        }

        let per_recipient_limit = self.config.per_recipient_max_per_minute;
        let recipient_bucket = state
            .recipient_buckets
            .entry(recipient.to_string())
            .or_insert_with(|| Bucket::new(per_recipient_limit));

        if !recipient_bucket.consume(token_cost) {
            let retry_after_seconds = recipient_bucket.time_until_available(token_cost);
            state.global_bucket.refund(token_cost);
            if let Some(bucket) = state.channel_buckets.get_mut(&channel_key) {
                bucket.refund(token_cost);
            }
            return AdmissionResult::Rejected {
                error_class: RejectionClass::OverloadRejected,
                error_message: format!("recipient {recipient} rate limit exceeded (anti-flood)"),
                retry_after_seconds,
                limit_type: LimitType::Recipient,
            };
        }

        state.in_flight_total += 1;
        *state.in_flight_by_channel.entry(channel_key).or_insert(0) += 1;
        *state
            .in_flight_by_recipient
            .entry(recipient.to_string())
            .or_insert(0) += 1;

        tracing::info!(channel, identity_scope, recipient, ?intent, token_cost, "delivery admitted");

        AdmissionResult::Admitted
    }

    /// Release the in-flight slot held by an admitted delivery.
    pub fn release(&self, channel: &str, identity_scope: &str, recipient: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.in_flight_total = state.in_flight_total.saturating_sub(1);
        let channel_key = Self::channel_key(channel, identity_scope);
        if let Some(count) = state.in_flight_by_channel.get_mut(&channel_key) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = state.in_flight_by_recipient.get_mut(recipient) {
            *count = count.saturating_sub(1);
        }
    }

    /// Record a provider-reported throttle (e.g. an HTTP 429 with
    /// `Retry-After`), short-circuiting admission for that channel until it
    /// expires.
    pub fn record_provider_throttle(&self, channel: &str, retry_after_seconds: f64, reason: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let retry_after = Utc::now() + chrono::Duration::milliseconds((retry_after_seconds * 1000.0) as i64);
        state.provider_throttles.insert(
            channel.to_string(),
            ProviderThrottle {
                retry_after,
                reason: reason.to_string(),
            },
        );
        tracing::warn!(channel, retry_after_seconds, reason, "provider throttle recorded");
    }

    /// Clear a provider throttle, e.g. after a successful delivery.
    pub fn clear_provider_throttle(&self, channel: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        if state.provider_throttles.remove(channel).is_some() {
            tracing::info!(channel, "provider throttle cleared");
        }
    }

    /// Operational snapshot of current headroom and in-flight counts.
    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        let global_available_tokens = state.global_bucket.available();
        let global_capacity = state.global_bucket.capacity as u32;

        let mut channels = HashMap::new();
        let in_flight_by_channel = state.in_flight_by_channel.clone();
        for (key, bucket) in state.channel_buckets.iter_mut() {
            channels.insert(
                key.clone(),
                ChannelStatus {
                    in_flight: *in_flight_by_channel.get(key).unwrap_or(&0),
                    available_tokens: bucket.available(),
                    capacity: bucket.capacity as u32,
                },
            );
        }

        let now = Utc::now();
        let mut provider_throttles = HashMap::new();
        for (channel, throttle) in state.provider_throttles.iter() {
            let remaining = (throttle.retry_after - now).num_milliseconds() as f64 / 1000.0;
            if remaining > 0.0 {
                provider_throttles.insert(
                    channel.clone(),
                    ThrottleStatus {
                        retry_after_seconds: remaining,
                        reason: throttle.reason.clone(),
                    },
                );
            }
        }

        let mut top_recipients_in_flight: Vec<(String, u32)> = state
            .in_flight_by_recipient
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        top_recipients_in_flight.sort_by(|a, b| b.1.cmp(&a.1));
        top_recipients_in_flight.truncate(5);

        RateLimiterStatus {
            global_in_flight: state.in_flight_total,
            global_max_in_flight: self.config.global_max_in_flight,
            global_available_tokens,
            global_capacity,
            channels,
            provider_throttles,
            top_recipients_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitSection {
        RateLimitSection {
            global_max_per_minute: 2,
            global_max_in_flight: 100,
            channel_limits: HashMap::from([("telegram.bot".to_string(), 1)]),
            per_recipient_max_per_minute: 10,
            reply_priority_multiplier: 2.0,
        }
    }

    #[test]
    fn admits_within_budget() {
        let limiter = RateLimiter::new(test_config());
        let result = limiter.check_admission("telegram", "bot", "user-1", Intent::Send);
        assert!(result.is_admitted());
    }

    #[test]
    fn rejects_over_channel_budget() {
        let limiter = RateLimiter::new(test_config());
        assert!(limiter
            .check_admission("telegram", "bot", "user-1", Intent::Send)
            .is_admitted());
        let second = limiter.check_admission("telegram", "bot", "user-2", Intent::Send);
        match second {
            AdmissionResult::Rejected { limit_type, error_class, .. } => {
                assert_eq!(limit_type, LimitType::Channel);
                assert_eq!(error_class, RejectionClass::OverloadRejected);
            }
            AdmissionResult::Admitted => panic!("expected channel rejection"),
        }
    }

    #[test]
    fn reply_intent_costs_half_a_token() {
        let limiter = RateLimiter::new(test_config());
        for _ in 0..2 {
            assert!(limiter
                .check_admission("telegram", "bot", "user-1", Intent::Reply)
                .is_admitted());
        }
        assert!(limiter
            .check_admission("telegram", "bot", "user-2", Intent::Reply)
            .is_admitted());
    }

    #[test]
    fn channel_rejection_refunds_global_bucket() {
        let limiter = RateLimiter::new(test_config());
        limiter
            .check_admission("telegram", "bot", "user-1", Intent::Send)
            .is_admitted();
        let before = limiter.status().global_available_tokens;
        let _ = limiter.check_admission("telegram", "bot", "user-2", Intent::Send);
        let after = limiter.status().global_available_tokens;
        assert_eq!(before, after);
    }

    #[test]
    fn provider_throttle_blocks_until_cleared() {
        let limiter = RateLimiter::new(test_config());
        limiter.record_provider_throttle("telegram", 30.0, "429 from provider");
        let result = limiter.check_admission("telegram", "bot", "user-1", Intent::Send);
        match result {
            AdmissionResult::Rejected { limit_type, error_class, .. } => {
                assert_eq!(limit_type, LimitType::Provider);
                assert_eq!(error_class, RejectionClass::TargetUnavailable);
            }
            AdmissionResult::Admitted => panic!("expected provider throttle rejection"),
        }
        limiter.clear_provider_throttle("telegram");
        assert!(limiter
            .check_admission("telegram", "bot", "user-1", Intent::Send)
            .is_admitted());
    }

    #[test]
    fn release_frees_in_flight_slot() {
        let limiter = RateLimiter::new(test_config());
        limiter.check_admission("telegram", "bot", "user-1", Intent::Send);
        assert_eq!(limiter.status().global_in_flight, 1);
        limiter.release("telegram", "bot", "user-1");
        assert_eq!(limiter.status().global_in_flight, 0);
    }

    #[test]
    fn status_reports_top_recipients() {
        let limiter = RateLimiter::new(RateLimitSection {
            global_max_per_minute: 100,
            global_max_in_flight: 100,
            channel_limits: HashMap::from([("telegram.bot".to_string(), 100)]),
            per_recipient_max_per_minute: 100,
            reply_priority_multiplier: 2.0,
        });
        limiter.check_admission("telegram", "bot", "user-1", Intent::Send);
        limiter.check_admission("telegram", "bot", "user-1", Intent::Send);
        limiter.check_admission("telegram", "bot", "user-2", Intent::Send);
        let status = limiter.status();
        assert_eq!(status.top_recipients_in_flight[0], ("user-1".to_string(), 2));
    }
}
