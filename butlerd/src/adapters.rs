//! Concrete implementations of the Message Pipeline's swappable LLM-facing
//! boundaries (`spec.md` §4.8, `butler_core::pipeline`).
//!
//! Classification and extraction are genuine LLM runtime adapter concerns —
//! out of scope per `spec.md` §1 the same way `butlerd::runtime` only wires
//! the narrow command-exec shim for `SessionRuntime`, not a real adapter.
//! [`NoopClassifier`] and [`NoopExtractor`] are that same boundary: a
//! deployment that wants classification/extraction replaces them with an
//! implementation that prompts its configured runtime and parses the
//! model's structured reply.
//!
//! Routing and reactions are core domain, not LLM adapter concerns, so
//! [`HttpRouteDispatcher`] and [`TelegramReactionSink`] are real.

use async_trait::async_trait;
use butler_core::config::ReactionsConfig;
use butler_core::error::{Error, ErrorKind, Result};
use butler_core::models::{ClassificationTarget, Extraction, RequestContext};
use butler_core::pipeline::{Classifier, Extractor, HistoryEntry, ReactionSink, RouteDispatcher};
use butler_core::registry::Registry;
use serde::Serialize;
use std::sync::Arc;

/// Always returns no classification targets. See module docs.
pub struct NoopClassifier;

#[async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _history: &[HistoryEntry], _message: &butler_core::models::MessageRef) -> Result<Vec<ClassificationTarget>> {
        Ok(Vec::new())
    }
}

/// Always returns no extractions. See module docs.
pub struct NoopExtractor;

#[async_trait]
impl Extractor for NoopExtractor {
    async fn extract(&self, _history: &[HistoryEntry], _message: &butler_core::models::MessageRef) -> Result<Vec<Extraction>> {
        Ok(Vec::new())
    }
}

/// `route.execute` dispatch over HTTP (`spec.md` §6.3), resolving the
/// target butler's endpoint through the shared registry row.
pub struct HttpRouteDispatcher {
    client: reqwest::Client,
    registry: Arc<Registry>,
    source_butler: String,
}

impl HttpRouteDispatcher {
    pub fn new(registry: Arc<Registry>, source_butler: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            source_butler,
        }
    }
}

#[derive(Serialize)]
struct RouteExecuteWireBody<'a> {
    schema_version: &'static str,
    request_context: &'a RequestContext,
    input: RouteExecutePromptBody,
    source_butler: &'a str,
}

#[derive(Serialize)]
struct RouteExecutePromptBody {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

#[async_trait]
impl RouteDispatcher for HttpRouteDispatcher {
    async fn dispatch(&self, target_butler: &str, prompt: String, context: Option<String>, request_context: &RequestContext) -> Result<()> {
        let endpoint = self
            .registry
            .endpoint_url(target_butler)
            .await?
            .ok_or_else(|| Error::domain(ErrorKind::TargetUnavailable, format!("no registry row for butler {target_butler}")))?;

        let url = format!("{}/route/execute", endpoint.trim_end_matches('/'));
        let body = RouteExecuteWireBody {
            schema_version: "route.v1",
            request_context,
            input: RouteExecutePromptBody { prompt, context },
            source_butler: &self.source_butler,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::domain(ErrorKind::TargetUnavailable, format!("route.execute request to {target_butler} failed: {err}")))?;

        if !response.status().is_success() {
            return Err(Error::domain(
                ErrorKind::TargetUnavailable,
                format!("route.execute to {target_butler} returned {}", response.status()),
            ));
        }

        Ok(())
    }
}

/// Telegram message reactions (`spec.md` §4.8 step 6): 👀 on accept, ✅ on
/// success, 👾 on failure. With no bot token configured, reactions are
/// logged instead of sent — the bootstrap fallback for the token itself is
/// the `BUTLER_TELEGRAM_TOKEN` env var (`spec.md` §6.6).
pub struct TelegramReactionSink {
    client: reqwest::Client,
    bot_token: Option<String>,
}

impl TelegramReactionSink {
    pub fn new(config: &ReactionsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: config.telegram_bot_token.clone(),
        }
    }

    async fn set_reaction(&self, chat_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let Some(token) = &self.bot_token else {
            tracing::debug!(chat_id, message_id, emoji, "no telegram_bot_token configured, skipping reaction");
            return Ok(());
        };

        let url = format!("https://api.telegram.org/bot{token}/setMessageReaction");
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reaction": [{"type": "emoji", "emoji": emoji}],
        });

        let response = self.client.post(&url).json(&body).send().await.map_err(|err| {
            Error::domain(ErrorKind::TargetUnavailable, format!("telegram setMessageReaction failed: {err}"))
        })?;

        if !response.status().is_success() {
            tracing::warn!(chat_id, message_id, status = %response.status(), "telegram reaction rejected");
        }

        Ok(())
    }
}

#[async_trait]
impl ReactionSink for TelegramReactionSink {
    async fn on_accept(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.set_reaction(chat_id, message_id, "\u{1F440}").await
    }

    async fn on_success(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.set_reaction(chat_id, message_id, "\u{2705}").await
    }

    async fn on_failure(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.set_reaction(chat_id, message_id, "\u{1F47E}").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_classifier_returns_empty() {
        let classifier = NoopClassifier;
        let message = butler_core::models::MessageRef {
            request_id: uuid::Uuid::new_v4(),
            message_inbox_id: uuid::Uuid::new_v4(),
            message_text: "hi".to_string(),
            source: butler_core::models::SourceChannel::Telegram,
            event: "evt".to_string(),
            sender: "user".to_string(),
            enqueued_at: chrono::Utc::now(),
        };
        let targets = classifier.classify(&[], &message).await.unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn telegram_sink_without_token_is_a_noop() {
        let sink = TelegramReactionSink::new(&ReactionsConfig::default());
        assert!(sink.on_accept("123", "456").await.is_ok());
    }
}
