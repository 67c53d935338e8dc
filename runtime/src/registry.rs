//! Tool Visibility Registry — a process-scoped `(mode, tier)` singleton
//! gating which MCP tools are advertised and callable per session role.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Undetermined,
    Orchestrator,
    Implementer,
    Reviewer,
}

/// The tool names in this module are the literal strings the MCP surface
/// advertises; kept as `&'static str` rather than an enum so the catalog
/// reads the same as the tool registration table in `main.rs`.
const ENTRY_POINT_GUIDES: &[&str] = &[
    "spec-workflow-guide",
    "steering-guide",
    "get-brainstorm-guide",
    "get-implementer-guide",
    "get-reviewer-guide",
];

const STATUS_TOOLS: &[&str] = &["spec-status"];

const SEARCH_TOOLS: &[&str] = &["search"];
const RESEARCH_TOOLS: &[&str] = &["code_research"];

const ORCHESTRATOR_BROAD: &[&str] = &[
    "spec-workflow-guide",
    "steering-guide",
    "get-brainstorm-guide",
    "get-implementer-guide",
    "get-reviewer-guide",
    "spec-status",
    "search",
    "code_research",
    "approvals",
    "wait-for-approval",
    "dispatch-runtime",
];

const ALL_TOOLS: &[&str] = &[
    "spec-workflow-guide",
    "steering-guide",
    "get-brainstorm-guide",
    "get-implementer-guide",
    "get-reviewer-guide",
    "spec-status",
    "search",
    "code_research",
    "approvals",
    "wait-for-approval",
    "dispatch-runtime",
];

fn entry_point_target(name: &str) -> Option<Mode> {
    match name {
        "spec-workflow-guide" | "steering-guide" | "get-brainstorm-guide" => {
            Some(Mode::Orchestrator)
        }
        "get-implementer-guide" => Some(Mode::Implementer),
        "get-reviewer-guide" => Some(Mode::Reviewer),
        _ => None,
    }
}

fn tier_set<'a>(mode: Mode, tier: u8) -> Vec<&'a str> {
    match (mode, tier) {
        (Mode::Undetermined, 1) | (Mode::Undetermined, 2) => {
            let mut v: Vec<&str> = ENTRY_POINT_GUIDES.to_vec();
            v.extend_from_slice(STATUS_TOOLS);
            v
        }
        (Mode::Undetermined, _) => ALL_TOOLS.to_vec(),
        (Mode::Orchestrator, 1) | (Mode::Orchestrator, 2) => ORCHESTRATOR_BROAD.to_vec(),
        (Mode::Orchestrator, _) => ALL_TOOLS.to_vec(),
        (Mode::Implementer, 1) => {
            let mut v = vec!["get-implementer-guide"];
            v.extend_from_slice(STATUS_TOOLS);
            v.extend_from_slice(SEARCH_TOOLS);
            v
        }
        (Mode::Implementer, 2) => {
            let mut v = tier_set(Mode::Implementer, 1);
            v.extend_from_slice(RESEARCH_TOOLS);
            v
        }
        (Mode::Implementer, _) => ALL_TOOLS.to_vec(),
        (Mode::Reviewer, 1) => {
            let mut v = vec!["get-reviewer-guide"];
            v.extend_from_slice(SEARCH_TOOLS);
            v
        }
        (Mode::Reviewer, 2) => {
            let mut v = tier_set(Mode::Reviewer, 1);
            v.extend_from_slice(RESEARCH_TOOLS);
            v.extend_from_slice(STATUS_TOOLS);
            v
        }
        (Mode::Reviewer, _) => ALL_TOOLS.to_vec(),
    }
}

/// Process-scoped session registry state, guarded for interior mutability
/// since the MCP transport serializes tool calls but handler methods take
/// `&self`.
#[derive(Debug)]
pub struct VisibilityRegistry {
    inner: Mutex<State>,
}

#[derive(Debug, Clone, Copy)]
struct State {
    mode: Mode,
    tier: u8,
}

impl Default for VisibilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State {
                mode: Mode::Undetermined,
                tier: 1,
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().unwrap().mode
    }

    pub fn tier(&self) -> u8 {
        self.inner.lock().unwrap().tier
    }

    /// If currently undetermined and `name` is an entry point, lock the
    /// mode and return `true` (indicating a transition happened). Mode is
    /// write-once: once locked, subsequent calls always return `false`.
    pub fn process_tool_call(&self, name: &str) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.mode != Mode::Undetermined {
            return false;
        }
        match entry_point_target(name) {
            Some(target) => {
                state.mode = target;
                true
            }
            None => false,
        }
    }

    /// Advance the tier exactly one step, clamped at 3.
    pub fn escalate_tier(&self) -> u8 {
        let mut state = self.inner.lock().unwrap();
        state.tier = (state.tier + 1).min(3);
        state.tier
    }

    /// Clamp the tier upward to at least `n` (never downward).
    pub fn ensure_tier_at_least(&self, n: u8) -> u8 {
        let mut state = self.inner.lock().unwrap();
        state.tier = state.tier.max(n.min(3));
        state.tier
    }

    pub fn is_tool_visible(&self, name: &str) -> bool {
        let state = self.inner.lock().unwrap();
        tier_set(state.mode, state.tier).contains(&name)
    }

    /// The full tool list currently advertised, for `tools/list` responses.
    pub fn visible_tools(&self) -> Vec<&'static str> {
        let state = self.inner.lock().unwrap();
        tier_set(state.mode, state.tier)
    }
}
