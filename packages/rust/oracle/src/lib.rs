//! External oracle for variations no local stage could link.
//!
//! The oracle is an injected capability. [`ChatOracle`] asks an
//! OpenAI-compatible chat-completions endpoint, with a hard timeout, no
//! retries, a minimum interval between calls and a per-run call budget.
//! Every failure becomes `None` at this boundary.

mod prompt;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use patternlink_shared::{
    OracleConfig, OracleCredentials, Pattern, PatternLinkError, Result, Variation,
};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One question for the oracle.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub lens: &'a str,
    pub variation: &'a Variation,
    /// Patterns of the variation's document; answers outside this set are discarded.
    pub candidates: &'a [Pattern],
}

/// Resolves a variation to a pattern number, or declines.
pub trait Oracle: Send {
    /// Name for tracing.
    fn name(&self) -> &str;

    /// A candidate pattern number, or `None` on any failure.
    fn resolve(&mut self, request: &OracleRequest<'_>) -> Option<u32>;
}

// ---------------------------------------------------------------------------
// Chat-completions oracle
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Blocking chat-completions oracle.
pub struct ChatOracle {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    credentials: OracleCredentials,
    timeout_secs: u64,
    min_interval: Duration,
    max_calls: u32,
    calls: u32,
    last_call: Option<Instant>,
}

impl ChatOracle {
    /// Build from config; `None` unless enabled and credentials are present.
    pub fn from_config(
        config: &OracleConfig,
        credentials: Option<OracleCredentials>,
    ) -> Option<Self> {
        if !config.enabled {
            debug!("oracle disabled");
            return None;
        }
        let Some(credentials) = credentials else {
            warn!(env = %config.api_key_env, "oracle enabled but no API key found, skipping");
            return None;
        };
        match Self::new(config, credentials) {
            Ok(oracle) => {
                info!(model = %config.model, max_calls = config.max_calls, "oracle ready");
                Some(oracle)
            }
            Err(e) => {
                warn!(error = %e, "oracle unavailable");
                None
            }
        }
    }

    fn new(config: &OracleConfig, credentials: OracleCredentials) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PatternLinkError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            credentials,
            timeout_secs: config.timeout_secs,
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_calls: config.max_calls,
            calls: 0,
            last_call: None,
        })
    }

    fn wait_for_slot(&self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
    }

    fn ask(&self, user_prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: prompt::SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 32,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    PatternLinkError::Oracle(format!(
                        "request timed out after {}s",
                        self.timeout_secs
                    ))
                } else {
                    PatternLinkError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PatternLinkError::Oracle(format!(
                "endpoint returned {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| PatternLinkError::Oracle(format!("invalid response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PatternLinkError::Oracle("response has no content".into()))
    }
}

impl Oracle for ChatOracle {
    fn name(&self) -> &str {
        "chat"
    }

    #[instrument(skip_all, fields(lens = request.lens, variation = request.variation.number))]
    fn resolve(&mut self, request: &OracleRequest<'_>) -> Option<u32> {
        if request.candidates.is_empty() {
            return None;
        }
        if self.calls >= self.max_calls {
            debug!(max_calls = self.max_calls, "oracle call budget exhausted");
            return None;
        }

        self.wait_for_slot();
        self.calls += 1;
        self.last_call = Some(Instant::now());

        let text = match self.ask(&prompt::build_prompt(request)) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "oracle request failed");
                return None;
            }
        };

        let Some(answer) = prompt::parse_answer(&text) else {
            warn!(response = %text, "oracle answer has no pattern number");
            return None;
        };
        if !request.candidates.iter().any(|p| p.number == answer) {
            warn!(answer, "oracle answer is not a candidate pattern, discarding");
            return None;
        }
        info!(pattern = answer, "oracle resolved variation");
        Some(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OracleConfig {
        OracleConfig {
            enabled: true,
            base_url: base_url.to_string(),
            timeout_secs: 5,
            min_interval_ms: 0,
            max_calls: 10,
            ..OracleConfig::default()
        }
    }

    fn credentials() -> Option<OracleCredentials> {
        Some(OracleCredentials {
            api_key: "secret".into(),
        })
    }

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    fn patterns() -> Vec<Pattern> {
        vec![Pattern::new(1, "One", "first"), Pattern::new(2, "Two", "second")]
    }

    /// Run `resolve` on a blocking thread against `base_url`.
    async fn resolve_with(cfg: OracleConfig, times: usize) -> Vec<Option<u32>> {
        tokio::task::spawn_blocking(move || {
            let mut oracle = ChatOracle::from_config(&cfg, credentials()).unwrap();
            let patterns = patterns();
            let variation = Variation::new(4, "Second thoughts", "about two");
            let request = OracleRequest {
                lens: "LensX",
                variation: &variation,
                candidates: &patterns,
            };
            (0..times).map(|_| oracle.resolve(&request)).collect()
        })
        .await
        .unwrap()
    }

    #[test]
    fn disabled_or_keyless_oracle_is_none() {
        let mut cfg = config("http://localhost:1");
        assert!(ChatOracle::from_config(&cfg, None).is_none());
        cfg.enabled = false;
        assert!(ChatOracle::from_config(&cfg, credentials()).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolves_candidate_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(reply(r#"{"pattern": 2}"#))
            .expect(1)
            .mount(&server)
            .await;

        let answers = resolve_with(config(&server.uri()), 1).await;
        assert_eq!(answers, vec![Some(2)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discards_non_candidate_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(reply("Pattern 9"))
            .mount(&server)
            .await;

        let answers = resolve_with(config(&server.uri()), 1).await;
        assert_eq!(answers, vec![None]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_errors_become_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .expect(1)
            .mount(&server)
            .await;

        let answers = resolve_with(config(&server.uri()), 1).await;
        assert_eq!(answers, vec![None]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeouts_become_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(reply("1").set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let cfg = OracleConfig {
            timeout_secs: 1,
            ..config(&server.uri())
        };
        let answers = resolve_with(cfg, 1).await;
        assert_eq!(answers, vec![None]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn call_budget_is_enforced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(reply("1"))
            .expect(2)
            .mount(&server)
            .await;

        let cfg = OracleConfig {
            max_calls: 2,
            ..config(&server.uri())
        };
        let answers = resolve_with(cfg, 3).await;
        assert_eq!(answers, vec![Some(1), Some(1), None]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_are_spaced_by_min_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(reply("2"))
            .mount(&server)
            .await;

        let cfg = OracleConfig {
            min_interval_ms: 200,
            ..config(&server.uri())
        };
        let started = Instant::now();
        let answers = resolve_with(cfg, 2).await;
        assert_eq!(answers, vec![Some(2), Some(2)]);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
