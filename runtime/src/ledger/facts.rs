//! Facts — the append-dominant, keyed audit trail a run's snapshot is built from.

use serde::{Deserialize, Serialize};

/// A single `(key, value, confidence)` fact. Structured values are
/// stringified as JSON before being stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
    pub confidence: f64,
}

impl Fact {
    pub fn new(key: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// A fact whose value is a JSON-serialized structure.
    pub fn json(key: impl Into<String>, value: &impl Serialize, confidence: f64) -> Self {
        let value = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        Self::new(key, value, confidence)
    }
}

/// Ordered bag of facts for a run. Later writes with the same key override
/// earlier ones in lookup but both persist in `all()` for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactStore {
    facts: Vec<Fact>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        self.facts.extend(facts);
    }

    /// The most recently written value for `key`, if any.
    pub fn latest(&self, key: &str) -> Option<&str> {
        self.facts
            .iter()
            .rev()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    /// Every fact ever written, in insertion order, including superseded ones.
    pub fn all(&self) -> &[Fact] {
        &self.facts
    }
}
