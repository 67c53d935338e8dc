//! Task complexity classification and provider routing.

use crate::config::{Config, RoleProviderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementer,
    Reviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementer => "implementer",
            Self::Reviewer => "reviewer",
        }
    }
}

/// A pluggable classifier. The default is a keyword-match heuristic; other
/// implementations (e.g. an LLM-backed one) can be swapped in without
/// touching the fallback-on-failure policy below.
pub trait Classifier {
    fn id(&self) -> &'static str;
    fn classify(&self, task_prompt: &str) -> Result<Level, String>;
}

const SIMPLE_KEYWORDS: &[&str] = &["typo", "rename", "readme"];
const SIMPLE_MAX_LEN: usize = 120;

pub struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn id(&self) -> &'static str {
        "keyword"
    }

    fn classify(&self, task_prompt: &str) -> Result<Level, String> {
        let lower = task_prompt.to_ascii_lowercase();
        let short = task_prompt.chars().count() <= SIMPLE_MAX_LEN;
        let has_keyword = SIMPLE_KEYWORDS.iter().any(|kw| lower.contains(kw));
        if short && has_keyword {
            Ok(Level::Simple)
        } else {
            Ok(Level::Complex)
        }
    }
}

/// Run `classifier` against `task_prompt`, degrading silently to
/// `(Complex, "fallback")` on classifier failure — per the spec's
/// "classifier failures degrade silently to complex" rule.
pub fn classify_with_fallback(classifier: &dyn Classifier, task_prompt: &str) -> (Level, &'static str) {
    match classifier.classify(task_prompt) {
        Ok(level) => (level, classifier.id()),
        Err(_) => (Level::Complex, "fallback"),
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub provider: String,
    pub model: String,
    pub dispatch_cli: String,
}

fn role_config<'a>(role: Role, config: &'a Config) -> &'a RoleProviderConfig {
    match role {
        Role::Implementer => &config.implementer,
        Role::Reviewer => &config.reviewer,
    }
}

/// Select a provider/model for `(role, level)` and build the command-line
/// dispatch template. The template's exact shape is provider-specific but
/// stable for a given `(role, level)` pair.
pub fn route(role: Role, level: Level, config: &Config) -> RoutingDecision {
    let role_cfg = role_config(role, config);
    let model = role_cfg.model_for(level == Level::Complex).to_string();
    let provider = role_cfg.provider.clone();

    let mut dispatch_cli = format!(
        "{provider} --model {model} --role {role} --sandbox workspace-write",
        role = role.as_str()
    );
    if role == Role::Reviewer {
        dispatch_cli.push_str(&format!(
            " --reasoning-effort {}",
            config.reviewer_reasoning_effort.as_str()
        ));
    }

    RoutingDecision {
        provider,
        model,
        dispatch_cli,
    }
}
