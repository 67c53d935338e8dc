//! Provider transport — a real HTTP call to an OpenAI-compatible
//! chat-completions endpoint, with capability-downgrade-then-retry-once on
//! unsupported-parameter errors.

use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ProviderTransportConfig;
use crate::error::ChatError;

use super::telemetry::Usage;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub json_mode: bool,
    pub max_output_tokens: u32,
    pub reasoning: Option<String>,
    pub prompt_cache_retention: Option<String>,
    pub prompt_cache_key: Option<String>,
}

impl ProviderRequest {
    /// Strip the provider-specific capability fields a downgrade retry drops.
    fn downgraded(&self) -> Self {
        Self {
            reasoning: None,
            prompt_cache_retention: None,
            prompt_cache_key: None,
            ..self.clone()
        }
    }

    fn to_body(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
            "max_tokens": self.max_output_tokens,
        });
        let obj = body.as_object_mut().unwrap();
        if self.json_mode {
            obj.insert("response_format".to_string(), json!({"type": "json_object"}));
        }
        if let Some(r) = &self.reasoning {
            obj.insert("reasoning".to_string(), json!(r));
        }
        if let Some(r) = &self.prompt_cache_retention {
            obj.insert("prompt_cache_retention".to_string(), json!(r));
        }
        if let Some(k) = &self.prompt_cache_key {
            obj.insert("prompt_cache_key".to_string(), json!(k));
        }
        body
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: Usage,
    pub latency_ms: u64,
    pub downgraded: bool,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cached_tokens: u64,
    #[serde(default)]
    write_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct RawChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    message: RawChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

fn unsupported_param_pattern() -> Regex {
    Regex::new(r"(?i)unsupported|unknown parameter|not allowed|invalid parameter").unwrap()
}

pub struct ProviderTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ProviderTransport {
    pub fn new(config: &ProviderTransportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Send `request`; on an unsupported-parameter error, strip capability
    /// fields and retry exactly once against the same transport.
    pub async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ChatError> {
        let started = Instant::now();
        match self.send_once(&request).await {
            Ok(mut response) => {
                response.latency_ms = started.elapsed().as_millis() as u64;
                Ok(response)
            }
            Err(ChatError::ProviderRequest(msg)) if unsupported_param_pattern().is_match(&msg) => {
                let downgraded = request.downgraded();
                let mut response = self.send_once(&downgraded).await?;
                response.downgraded = true;
                response.latency_ms = started.elapsed().as_millis() as u64;
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_once(&self, request: &ProviderRequest) -> Result<ProviderResponse, ChatError> {
        let mut builder = self.client.post(&self.base_url).json(&request.to_body());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ChatError::Timeout(0)
            } else {
                ChatError::ProviderRequest(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::ProviderRequest(format!("{status}: {body}")));
        }

        let parsed: RawResponse = response
            .json()
            .await
            .map_err(|e| ChatError::ProviderRequest(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                cached_tokens: u.cached_tokens,
                write_tokens: u.write_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            content,
            usage,
            latency_ms: 0,
            downgraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ProviderRequest {
        ProviderRequest {
            model: "capable".to_string(),
            messages: vec![json!({"role": "user", "content": "hi"})],
            json_mode: false,
            max_output_tokens: 100,
            reasoning: Some("high".to_string()),
            prompt_cache_retention: Some("24h".to_string()),
            prompt_cache_key: Some("k1".to_string()),
        }
    }

    #[test]
    fn downgrade_strips_capability_fields() {
        let request = sample_request();
        let downgraded = request.downgraded();
        assert!(downgraded.reasoning.is_none());
        assert!(downgraded.prompt_cache_retention.is_none());
        assert!(downgraded.prompt_cache_key.is_none());
        assert_eq!(downgraded.model, request.model);
    }

    #[test]
    fn unsupported_param_pattern_matches_known_phrases() {
        let re = unsupported_param_pattern();
        assert!(re.is_match("Unsupported parameter: reasoning"));
        assert!(re.is_match("unknown parameter 'prompt_cache_key'"));
        assert!(re.is_match("this field is not allowed for this model"));
        assert!(re.is_match("invalid parameter: prompt_cache_retention"));
        assert!(!re.is_match("internal server error"));
    }

    #[test]
    fn request_body_omits_absent_capability_fields() {
        let request = ProviderRequest {
            model: "fast".to_string(),
            messages: vec![],
            json_mode: true,
            max_output_tokens: 50,
            reasoning: None,
            prompt_cache_retention: None,
            prompt_cache_key: None,
        };
        let body = request.to_body();
        assert!(body.get("reasoning").is_none());
        assert_eq!(body["response_format"]["type"], "json_object");
    }
}
