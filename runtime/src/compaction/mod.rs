//! Shared staged-compaction engine.
//!
//! Both `compile_prompt`'s over-budget handling (4.A) and the History
//! Reducer (4.D) apply the same shape — mask, then summarize, then
//! truncate, with a monotonically non-increasing token trace — so the
//! primitives live here once instead of being duplicated per call site.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CHARS_PER_TOKEN: u32 = 4;

const BEGIN_MARKER: &str = "BEGIN_DISPATCH_RESULT";
const END_MARKER: &str = "END_DISPATCH_RESULT";

/// `ceil(chars / chars_per_token)`.
pub fn estimate_tokens(text: &str, chars_per_token: u32) -> u32 {
    let chars_per_token = chars_per_token.max(1);
    let len = text.chars().count() as u32;
    len.div_ceil(chars_per_token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mask,
    Summarize,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: Stage,
    pub prompt_tokens: u32,
}

/// Invariant 6: for every `i>0`, `trace[i].prompt_tokens <= trace[i-1].prompt_tokens`.
pub fn is_monotonic(trace: &[TraceEntry]) -> bool {
    trace.windows(2).all(|w| w[1].prompt_tokens <= w[0].prompt_tokens)
}

/// Mask all content outside `BEGIN_DISPATCH_RESULT…END_DISPATCH_RESULT`
/// blocks with a bounded digest, preserving the blocks verbatim. Never
/// shrinks the non-block remainder below `min_chars` unless it was
/// already shorter.
pub fn mask_preserving_dispatch_blocks(text: &str, digest_chars: usize, min_chars: usize) -> String {
    let mut out = String::new();
    let mut rest = text;
    let mut block_count = 0usize;

    loop {
        match rest.find(BEGIN_MARKER) {
            None => {
                out.push_str(&mask_segment(rest, digest_chars, min_chars));
                break;
            }
            Some(start) => {
                let (before, after_begin) = rest.split_at(start);
                out.push_str(&mask_segment(before, digest_chars, min_chars));
                match after_begin.find(END_MARKER) {
                    None => {
                        // Unterminated block: treat the remainder as verbatim, do not mask.
                        out.push_str(after_begin);
                        break;
                    }
                    Some(end_rel) => {
                        let end_idx = end_rel + END_MARKER.len();
                        out.push_str(&after_begin[..end_idx]);
                        block_count += 1;
                        rest = &after_begin[end_idx..];
                    }
                }
            }
        }
    }

    let _ = block_count;
    out
}

fn mask_segment(segment: &str, digest_chars: usize, min_chars: usize) -> String {
    if segment.trim().is_empty() {
        return segment.to_string();
    }
    let n = segment.chars().count();
    if n <= min_chars {
        return segment.to_string();
    }
    let digest: String = segment.chars().take(digest_chars).collect();
    format!("[observation masked — {n} chars | digest: {digest}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("abcde", 4), 2); // 5/4 -> 2
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("", 4), 0);
    }

    #[test]
    fn monotonic_trace_passes() {
        let trace = vec![
            TraceEntry { stage: Stage::Mask, prompt_tokens: 100 },
            TraceEntry { stage: Stage::Summarize, prompt_tokens: 60 },
            TraceEntry { stage: Stage::Truncate, prompt_tokens: 60 },
        ];
        assert!(is_monotonic(&trace));
    }

    #[test]
    fn non_monotonic_trace_fails() {
        let trace = vec![
            TraceEntry { stage: Stage::Mask, prompt_tokens: 50 },
            TraceEntry { stage: Stage::Summarize, prompt_tokens: 80 },
        ];
        assert!(!is_monotonic(&trace));
    }

    #[test]
    fn masking_preserves_dispatch_blocks_verbatim() {
        let text = format!(
            "some long preceding tool noise that should be masked out entirely\n{BEGIN_MARKER}\n{{\"task_id\":\"1\"}}\n{END_MARKER}\ntrailing noise also long enough to mask"
        );
        let masked = mask_preserving_dispatch_blocks(&text, 10, 5);
        assert!(masked.contains(BEGIN_MARKER));
        assert!(masked.contains(END_MARKER));
        assert!(masked.contains("\"task_id\":\"1\""));
        assert!(masked.contains("masked"));
    }

    #[test]
    fn masking_leaves_short_segments_untouched() {
        let masked = mask_preserving_dispatch_blocks("short", 10, 20);
        assert_eq!(masked, "short");
    }

    #[test]
    fn masking_with_no_blocks_masks_whole_text() {
        let long = "x".repeat(100);
        let masked = mask_preserving_dispatch_blocks(&long, 10, 5);
        assert!(masked.starts_with("[observation masked"));
    }
}
