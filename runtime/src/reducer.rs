//! History Reducer (4.D) — shrinks a chat transcript back under budget
//! while preserving system messages, the most recent raw turns, and
//! tool-call/result pairing, using the shared staged-compaction engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::compaction::{self, Stage, TraceEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "pairId", skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
    #[serde(rename = "pairRole", skip_serializing_if = "Option::is_none")]
    pub pair_role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducerOptions {
    pub enabled: bool,
    pub max_input_chars: Option<u32>,
    pub max_input_tokens: Option<u32>,
    pub token_chars_per_token: u32,
    pub preserve_recent_raw_turns: usize,
    pub summary_max_chars: usize,
    pub max_observation_chars: usize,
    pub min_observation_chars: usize,
    pub observation_digest_chars: usize,
    pub observation_masking: bool,
}

impl Default for ReducerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_input_chars: None,
            max_input_tokens: None,
            token_chars_per_token: compaction::DEFAULT_CHARS_PER_TOKEN,
            preserve_recent_raw_turns: 4,
            summary_max_chars: 1400,
            max_observation_chars: 80,
            min_observation_chars: 24,
            observation_digest_chars: 48,
            observation_masking: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantStatus {
    Ok,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReduceResult {
    pub messages: Vec<ChatMessage>,
    pub reduced: bool,
    pub dropped_count: usize,
    pub invariant_status: InvariantStatus,
    pub masked_count: usize,
    pub masked_chars: usize,
    pub reduction_stage: Option<Stage>,
    pub before_tokens: u32,
    pub after_tokens: u32,
    pub compression_ratio: f64,
    pub stage_used: Vec<TraceEntry>,
}

fn total_chars(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(|m| m.content.chars().count() as u32).sum()
}

fn total_tokens(messages: &[ChatMessage], chars_per_token: u32) -> u32 {
    messages
        .iter()
        .map(|m| compaction::estimate_tokens(&m.content, chars_per_token))
        .sum()
}

fn over_budget(messages: &[ChatMessage], options: &ReducerOptions) -> bool {
    if let Some(max_chars) = options.max_input_chars {
        if total_chars(messages) > max_chars {
            return true;
        }
    }
    if let Some(max_tokens) = options.max_input_tokens {
        if total_tokens(messages, options.token_chars_per_token) > max_tokens {
            return true;
        }
    }
    false
}

/// Indices that must survive: all system messages, the last N non-system
/// messages, and any pair mate of a kept `pairId` group.
fn keep_set(messages: &[ChatMessage], preserve_recent_raw_turns: usize) -> HashSet<usize> {
    let mut keep = HashSet::new();
    for (i, m) in messages.iter().enumerate() {
        if m.is_system() {
            keep.insert(i);
        }
    }

    let non_system_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_system())
        .map(|(i, _)| i)
        .collect();
    for &i in non_system_indices.iter().rev().take(preserve_recent_raw_turns) {
        keep.insert(i);
    }

    let mut kept_pair_ids: HashSet<&str> = keep
        .iter()
        .filter_map(|&i| messages[i].pair_id.as_deref())
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for (i, m) in messages.iter().enumerate() {
            if let Some(pid) = m.pair_id.as_deref() {
                if kept_pair_ids.contains(pid) && keep.insert(i) {
                    changed = true;
                }
                if keep.contains(&i) && kept_pair_ids.insert(pid) {
                    changed = true;
                }
            }
        }
    }

    keep
}

fn stage1_mask(messages: &[ChatMessage], keep: &HashSet<usize>, options: &ReducerOptions) -> (Vec<ChatMessage>, usize, usize) {
    let mut masked_count = 0;
    let mut masked_chars = 0;
    let out = messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if keep.contains(&i) || m.is_system() || !options.observation_masking {
                return m.clone();
            }
            let before_len = m.content.chars().count();
            let masked = compaction::mask_preserving_dispatch_blocks(
                &m.content,
                options.observation_digest_chars,
                options.min_observation_chars,
            );
            if masked.len() < m.content.len() {
                masked_count += 1;
                masked_chars += before_len.saturating_sub(masked.chars().count());
            }
            ChatMessage {
                content: masked,
                ..m.clone()
            }
        })
        .collect();
    (out, masked_count, masked_chars)
}

fn stage2_summarize(messages: &[ChatMessage], keep: &HashSet<usize>, options: &ReducerOptions) -> Vec<ChatMessage> {
    let objective = messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let unresolved: Vec<&str> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| !keep.contains(i) && m.tags.iter().any(|t| t == "unresolved"))
        .map(|(_, m)| m.content.as_str())
        .take(6)
        .collect();

    let outcomes: Vec<&str> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| !keep.contains(i) && (m.role == "tool" || m.tool_call_id.is_some()))
        .map(|(_, m)| m.content.as_str())
        .take(6)
        .collect();

    let constraints: Vec<&str> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| !keep.contains(i) && m.tags.iter().any(|t| t == "constraint"))
        .map(|(_, m)| m.content.as_str())
        .take(8)
        .collect();

    let mut summary = format!("Objective: {}\n", truncate_chars(&objective, 300));
    if !unresolved.is_empty() {
        summary.push_str("Unresolved:\n");
        for u in &unresolved {
            summary.push_str(&format!("- {}\n", truncate_chars(u, 120)));
        }
    }
    if !outcomes.is_empty() {
        summary.push_str("Tool outcomes:\n");
        for o in &outcomes {
            summary.push_str(&format!("- {}\n", truncate_chars(o, 120)));
        }
    }
    if !constraints.is_empty() {
        summary.push_str("Constraints:\n");
        for c in &constraints {
            summary.push_str(&format!("- {}\n", truncate_chars(c, 120)));
        }
    }
    let summary = truncate_chars(&summary, options.summary_max_chars);

    let summary_msg = ChatMessage {
        role: "system".to_string(),
        content: summary,
        name: None,
        tool_call_id: None,
        pair_id: None,
        pair_role: None,
        tags: vec!["history-summary".to_string()],
    };

    let mut out: Vec<ChatMessage> = messages
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, m)| m.clone())
        .collect();
    out.push(summary_msg);
    out
}

fn stage3_truncate(messages: &[ChatMessage], keep: &HashSet<usize>) -> Vec<ChatMessage> {
    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, m)| m.clone())
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Reduce `messages` to fit under the configured budget. No-op (invariant 8)
/// when `enabled = false` or there are at most 2 messages.
pub fn reduce(messages: &[ChatMessage], options: &ReducerOptions) -> ReduceResult {
    let before_tokens = total_tokens(messages, options.token_chars_per_token);

    if !options.enabled || messages.len() <= 2 || !over_budget(messages, options) {
        return ReduceResult {
            messages: messages.to_vec(),
            reduced: false,
            dropped_count: 0,
            invariant_status: InvariantStatus::Ok,
            masked_count: 0,
            masked_chars: 0,
            reduction_stage: None,
            before_tokens,
            after_tokens: before_tokens,
            compression_ratio: 1.0,
            stage_used: Vec::new(),
        };
    }

    let keep = keep_set(messages, options.preserve_recent_raw_turns);
    let mut trace = Vec::new();

    let (masked, masked_count, masked_chars) = stage1_mask(messages, &keep, options);
    let masked_tokens = total_tokens(&masked, options.token_chars_per_token);
    trace.push(TraceEntry {
        stage: Stage::Mask,
        prompt_tokens: masked_tokens,
    });

    if !over_budget(&masked, options) {
        let after_tokens = masked_tokens;
        return finish(
            masked,
            messages.len(),
            InvariantStatus::Ok,
            masked_count,
            masked_chars,
            Stage::Mask,
            before_tokens,
            after_tokens,
            trace,
        );
    }

    let summarized = stage2_summarize(&masked, &keep, options);
    let summarized_tokens = total_tokens(&summarized, options.token_chars_per_token);
    trace.push(TraceEntry {
        stage: Stage::Summarize,
        prompt_tokens: summarized_tokens,
    });

    if !over_budget(&summarized, options) {
        let after_tokens = summarized_tokens;
        let dropped = messages.len() - summarized.len() + 1; // +1 for the injected summary message
        return finish(
            summarized,
            dropped,
            InvariantStatus::Ok,
            masked_count,
            masked_chars,
            Stage::Summarize,
            before_tokens,
            after_tokens,
            trace,
        );
    }

    let truncated = stage3_truncate(messages, &keep);
    let truncated_tokens = total_tokens(&truncated, options.token_chars_per_token).min(summarized_tokens);
    trace.push(TraceEntry {
        stage: Stage::Truncate,
        prompt_tokens: truncated_tokens,
    });
    let dropped = messages.len() - truncated.len();
    finish(
        truncated,
        dropped,
        InvariantStatus::Fallback,
        masked_count,
        masked_chars,
        Stage::Truncate,
        before_tokens,
        truncated_tokens,
        trace,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish(
    messages: Vec<ChatMessage>,
    dropped_count: usize,
    invariant_status: InvariantStatus,
    masked_count: usize,
    masked_chars: usize,
    stage: Stage,
    before_tokens: u32,
    after_tokens: u32,
    trace: Vec<TraceEntry>,
) -> ReduceResult {
    debug_assert!(compaction::is_monotonic(&trace));
    let compression_ratio = if before_tokens == 0 {
        1.0
    } else {
        after_tokens as f64 / before_tokens as f64
    };
    ReduceResult {
        messages,
        reduced: true,
        dropped_count,
        invariant_status,
        masked_count,
        masked_chars,
        reduction_stage: Some(stage),
        before_tokens,
        after_tokens,
        compression_ratio,
        stage_used: trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
            tool_call_id: None,
            pair_id: None,
            pair_role: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn noop_when_disabled() {
        let messages = vec![msg("system", "sys"), msg("user", &"x".repeat(1000)), msg("assistant", "y")];
        let options = ReducerOptions {
            enabled: false,
            max_input_chars: Some(10),
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(!result.reduced);
        assert_eq!(result.messages.len(), messages.len());
    }

    #[test]
    fn noop_when_two_or_fewer_messages() {
        let messages = vec![msg("system", "sys"), msg("user", &"x".repeat(10_000))];
        let options = ReducerOptions {
            max_input_chars: Some(10),
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(!result.reduced);
    }

    #[test]
    fn noop_when_within_budget() {
        let messages = vec![msg("system", "sys"), msg("user", "hi"), msg("assistant", "hello")];
        let options = ReducerOptions {
            max_input_chars: Some(10_000),
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(!result.reduced);
    }

    #[test]
    fn masking_preserves_all_system_messages() {
        let mut messages = vec![msg("system", "sys-1")];
        for i in 0..20 {
            messages.push(msg("tool", &format!("observation {i} {}", "x".repeat(200))));
        }
        let options = ReducerOptions {
            max_input_chars: Some(500),
            preserve_recent_raw_turns: 2,
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(result.reduced);
        let system_count = result.messages.iter().filter(|m| m.is_system()).count();
        assert!(system_count >= 1);
        assert!(result.messages.iter().any(|m| m.content == "sys-1"));
    }

    #[test]
    fn masking_preserves_dispatch_blocks() {
        let dispatch = format!(
            "prefix noise {}\nBEGIN_DISPATCH_RESULT\n{{\"status\":\"completed\"}}\nEND_DISPATCH_RESULT\nsuffix noise {}",
            "n".repeat(100),
            "n".repeat(100)
        );
        let mut messages = vec![msg("system", "sys")];
        for _ in 0..10 {
            messages.push(msg("tool", &dispatch));
        }
        let options = ReducerOptions {
            max_input_chars: Some(400),
            preserve_recent_raw_turns: 1,
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(result.reduced);
        assert!(result
            .messages
            .iter()
            .any(|m| m.content.contains("\"status\":\"completed\"")));
    }

    #[test]
    fn falls_back_to_truncation_when_still_over_budget_after_summarize() {
        let mut messages = vec![msg("system", "sys")];
        for i in 0..50 {
            messages.push(msg("user", &format!("turn {i} {}", "z".repeat(500))));
        }
        let options = ReducerOptions {
            max_input_chars: Some(50), // unreachable even after summarization
            preserve_recent_raw_turns: 2,
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(result.reduced);
        assert_eq!(result.invariant_status, InvariantStatus::Fallback);
        assert_eq!(result.reduction_stage, Some(Stage::Truncate));
    }

    #[test]
    fn trace_is_monotonic() {
        let mut messages = vec![msg("system", "sys")];
        for i in 0..30 {
            messages.push(msg("tool", &format!("obs {i} {}", "x".repeat(300))));
        }
        let options = ReducerOptions {
            max_input_chars: Some(600),
            preserve_recent_raw_turns: 2,
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        assert!(compaction::is_monotonic(&result.stage_used));
    }

    #[test]
    fn pair_mates_kept_together() {
        let mut messages = vec![msg("system", "sys")];
        let mut call = msg("assistant", "calling tool");
        call.pair_id = Some("p1".to_string());
        call.pair_role = Some("call".to_string());
        messages.push(call);
        for i in 0..20 {
            messages.push(msg("user", &format!("filler {i} {}", "y".repeat(100))));
        }
        let mut result_msg = msg("tool", &"z".repeat(200));
        result_msg.pair_id = Some("p1".to_string());
        result_msg.pair_role = Some("result".to_string());
        messages.push(result_msg);

        let options = ReducerOptions {
            max_input_chars: Some(300),
            preserve_recent_raw_turns: 1,
            ..Default::default()
        };
        let result = reduce(&messages, &options);
        let pair_present: Vec<_> = result
            .messages
            .iter()
            .filter(|m| m.pair_id.as_deref() == Some("p1"))
            .collect();
        // both pair mates survive together, or neither does (never exactly one),
        // unless the run fell back to truncation.
        if result.invariant_status == InvariantStatus::Ok {
            assert_ne!(pair_present.len(), 1);
        }
    }
}
