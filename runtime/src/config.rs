//! Environment-driven process configuration.
//!
//! Assembled once at startup via [`Config::from_env`] and threaded
//! explicitly through the server context, mirroring the teacher's
//! `LlmConfig`/`HarnessConfig::from_env` pattern rather than reading
//! `std::env` ad hoc from call sites.

use std::env;

/// Discipline level controls how much of the steering/guide content is
/// surfaced, and whether the reviewer role is offered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Minimal,
    Standard,
    Full,
}

impl Discipline {
    fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Self::Minimal,
            "full" => Self::Full,
            _ => Self::Standard,
        }
    }

    pub fn reviewer_enabled(&self) -> bool {
        !matches!(self, Self::Minimal)
    }
}

/// Reasoning effort passed through to the reviewer provider, where supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Per-role provider configuration: which provider identifier/command to
/// dispatch to, and the model name for each classification level.
#[derive(Debug, Clone)]
pub struct RoleProviderConfig {
    pub provider: String,
    pub model_simple: String,
    pub model_complex: String,
}

impl RoleProviderConfig {
    fn from_env(role_prefix: &str, default_provider: &str) -> Self {
        Self {
            provider: env::var(format!("SPEC_CONTEXT_{role_prefix}"))
                .unwrap_or_else(|_| default_provider.to_string()),
            model_simple: env::var(format!("SPEC_CONTEXT_{role_prefix}_MODEL_SIMPLE"))
                .unwrap_or_else(|_| "fast".to_string()),
            model_complex: env::var(format!("SPEC_CONTEXT_{role_prefix}_MODEL_COMPLEX"))
                .unwrap_or_else(|_| "capable".to_string()),
        }
    }

    pub fn model_for(&self, level_is_complex: bool) -> &str {
        if level_is_complex {
            &self.model_complex
        } else {
            &self.model_simple
        }
    }
}

/// Tool-result offload tuning, per §4.F / §6.
#[derive(Debug, Clone, Copy)]
pub struct OffloadConfig {
    pub threshold_chars: usize,
    pub preview_chars: usize,
    pub preview_lines: usize,
    pub ttl_minutes: i64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 20_000,
            preview_chars: 2_000,
            preview_lines: 40,
            ttl_minutes: 30,
        }
    }
}

impl OffloadConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            threshold_chars: env_usize(
                "SPEC_CONTEXT_TOOL_RESULT_OFFLOAD_CHARS",
                default.threshold_chars,
            ),
            preview_chars: env_usize("SPEC_CONTEXT_TOOL_RESULT_PREVIEW_CHARS", default.preview_chars),
            preview_lines: env_usize("SPEC_CONTEXT_TOOL_RESULT_PREVIEW_LINES", default.preview_lines),
            ttl_minutes: env_i64("SPEC_CONTEXT_TOOL_RESULT_TTL_MINUTES", default.ttl_minutes),
        }
    }
}

/// Provider transport configuration (§4.E expansion).
#[derive(Debug, Clone)]
pub struct ProviderTransportConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl ProviderTransportConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            base_url: env::var("SPEC_CONTEXT_PROVIDER_BASE_URL").unwrap_or(default.base_url),
            api_key: env::var("SPEC_CONTEXT_PROVIDER_API_KEY").ok(),
            timeout_secs: env_u64("SPEC_CONTEXT_PROVIDER_TIMEOUT_SECS", default.timeout_secs),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub discipline: Discipline,
    pub implementer: RoleProviderConfig,
    pub reviewer: RoleProviderConfig,
    pub reviewer_reasoning_effort: ReasoningEffort,
    pub offload: OffloadConfig,
    pub provider: ProviderTransportConfig,
    pub workflow_home: Option<String>,
    pub stalled_threshold: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            discipline: env::var("SPEC_CONTEXT_DISCIPLINE")
                .map(|v| Discipline::from_env_str(&v))
                .unwrap_or(Discipline::Standard),
            implementer: RoleProviderConfig::from_env("IMPLEMENTER", "codex"),
            reviewer: RoleProviderConfig::from_env("REVIEWER", "claude"),
            reviewer_reasoning_effort: env::var("SPEC_CONTEXT_REVIEWER_REASONING_EFFORT")
                .map(|v| ReasoningEffort::from_env_str(&v))
                .unwrap_or(ReasoningEffort::Medium),
            offload: OffloadConfig::from_env(),
            provider: ProviderTransportConfig::from_env(),
            workflow_home: env::var("SPEC_WORKFLOW_HOME").ok(),
            stalled_threshold: env_u64("SPEC_CONTEXT_STALLED_THRESHOLD", 2) as u32,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discipline_defaults_standard() {
        assert_eq!(Discipline::from_env_str("bogus"), Discipline::Standard);
        assert!(Discipline::Standard.reviewer_enabled());
        assert!(!Discipline::Minimal.reviewer_enabled());
    }

    #[test]
    fn reasoning_effort_roundtrips() {
        assert_eq!(ReasoningEffort::from_env_str("high").as_str(), "high");
        assert_eq!(ReasoningEffort::from_env_str("LOW").as_str(), "low");
        assert_eq!(ReasoningEffort::from_env_str("??").as_str(), "medium");
    }

    #[test]
    fn offload_config_defaults() {
        let o = OffloadConfig::default();
        assert_eq!(o.threshold_chars, 20_000);
        assert_eq!(o.ttl_minutes, 30);
    }

    #[test]
    fn role_provider_model_selection() {
        let role = RoleProviderConfig {
            provider: "codex".into(),
            model_simple: "fast-model".into(),
            model_complex: "big-model".into(),
        };
        assert_eq!(role.model_for(false), "fast-model");
        assert_eq!(role.model_for(true), "big-model");
    }
}
