#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use palaver_domain::SecretString;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Fixed apology substituted whenever the provider fails.
pub const FALLBACK_REPLY: &str = "Sorry, I had trouble understanding that.";

/// One history entry handed to the provider.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
	pub from_substitute: bool,
	pub nick: String,
	pub text: String,
}

/// Errors from the generative-reply provider.
#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("unexpected response shape: {0}")]
	BadResponse(String),
}

/// External generative-reply provider boundary.
#[async_trait]
pub trait ReplyProvider: Send + Sync {
	async fn generate(&self, history: &[HistoryEntry], message: &str) -> Result<String, ProviderError>;
}

/// Bounded random delay injected before a substitute reply, so replies do
/// not arrive conspicuously instantly. A UX policy, not a performance knob.
#[derive(Debug, Clone)]
pub struct ReplyDelay {
	pub min: Duration,
	pub max: Duration,
}

impl ReplyDelay {
	pub fn new(min: Duration, max: Duration) -> Self {
		if min > max { Self { min: max, max: min } } else { Self { min, max } }
	}

	/// No delay, for tests.
	pub fn none() -> Self {
		Self {
			min: Duration::ZERO,
			max: Duration::ZERO,
		}
	}

	pub async fn wait(&self) {
		if self.max.is_zero() {
			return;
		}

		let (lo, hi) = (self.min.as_millis() as u64, self.max.as_millis() as u64);
		let ms = if lo >= hi {
			hi
		} else {
			rand::Rng::random_range(&mut rand::rng(), lo..=hi)
		};
		tokio::time::sleep(Duration::from_millis(ms)).await;
	}
}

impl Default for ReplyDelay {
	fn default() -> Self {
		Self {
			min: Duration::from_millis(1200),
			max: Duration::from_millis(3500),
		}
	}
}

/// Configuration for the HTTP reply provider.
#[derive(Debug, Clone)]
pub struct HttpReplyConfig {
	/// API base URL, e.g. `https://generativelanguage.googleapis.com`.
	pub api_url: String,
	pub api_key: SecretString,
	pub model: String,
}

/// Reply provider speaking the `generateContent` JSON API.
pub struct HttpReplyProvider {
	client: reqwest::Client,
	cfg: HttpReplyConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
	#[serde(default)]
	candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
	content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
	#[serde(default)]
	parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
	#[serde(default)]
	text: String,
}

impl HttpReplyProvider {
	pub fn new(cfg: HttpReplyConfig) -> Self {
		Self {
			client: reqwest::Client::new(),
			cfg,
		}
	}

	fn request_body(history: &[HistoryEntry], message: &str) -> serde_json::Value {
		let mut contents: Vec<serde_json::Value> = history
			.iter()
			.map(|entry| {
				json!({
					"role": if entry.from_substitute { "model" } else { "user" },
					"parts": [{ "text": entry.text }],
				})
			})
			.collect();
		contents.push(json!({ "role": "user", "parts": [{ "text": message }] }));
		json!({ "contents": contents })
	}
}

#[async_trait]
impl ReplyProvider for HttpReplyProvider {
	async fn generate(&self, history: &[HistoryEntry], message: &str) -> Result<String, ProviderError> {
		let url = format!(
			"{}/v1beta/models/{}:generateContent",
			self.cfg.api_url.trim_end_matches('/'),
			self.cfg.model
		);

		let resp = self
			.client
			.post(&url)
			.query(&[("key", self.cfg.api_key.expose())])
			.json(&Self::request_body(history, message))
			.send()
			.await?
			.error_for_status()?;

		let parsed: GenerateResponse = resp.json().await?;
		let text = parsed
			.candidates
			.into_iter()
			.next()
			.and_then(|c| c.content.parts.into_iter().next())
			.map(|p| p.text)
			.unwrap_or_default();

		if text.trim().is_empty() {
			return Err(ProviderError::BadResponse("no candidate text".to_string()));
		}
		Ok(text)
	}
}

/// Provider that cycles through fixed replies. Used when no API key is
/// configured, and in tests.
#[derive(Debug)]
pub struct CannedReplyProvider {
	replies: Vec<String>,
	next: AtomicUsize,
}

impl CannedReplyProvider {
	pub fn new(replies: Vec<String>) -> Self {
		Self {
			replies,
			next: AtomicUsize::new(0),
		}
	}
}

impl Default for CannedReplyProvider {
	fn default() -> Self {
		Self::new(vec![
			"Interesting, tell me more.".to_string(),
			"I was just thinking about that.".to_string(),
			"Really? What makes you say so?".to_string(),
			"Ha, fair enough.".to_string(),
		])
	}
}

#[async_trait]
impl ReplyProvider for CannedReplyProvider {
	async fn generate(&self, _history: &[HistoryEntry], _message: &str) -> Result<String, ProviderError> {
		if self.replies.is_empty() {
			return Err(ProviderError::BadResponse("no canned replies".to_string()));
		}
		let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.replies.len();
		Ok(self.replies[idx].clone())
	}
}
