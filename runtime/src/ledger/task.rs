//! Task ledger — accumulated implementer/reviewer outcome history for a
//! single `(run_id, task_id)`, including the stalled-progress counter.

use serde::{Deserialize, Serialize};

use super::facts::{Fact, FactStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementerStatus {
    Completed,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerAssessment {
    Approved,
    NeedsChanges,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Important,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerIssue {
    pub severity: IssueSeverity,
    pub message: String,
    pub file: Option<String>,
}

/// The outcome of a single implementer or reviewer dispatch, used to drive
/// ledger accumulation. Modeled as a tagged variant per the "dynamic typing"
/// design note rather than structural duck-typing.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Implementer {
        status: ImplementerStatus,
        summary: String,
        follow_up_actions: Vec<String>,
    },
    Reviewer {
        assessment: ReviewerAssessment,
        issues: Vec<ReviewerIssue>,
        required_fixes: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stalled {
    pub consecutive_non_progress: u32,
    pub threshold: u32,
    pub flagged: bool,
}

impl Stalled {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_non_progress: 0,
            threshold,
            flagged: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub plan_version: u32,
    pub summary: Option<String>,
    pub reviewer_assessment: Option<ReviewerAssessment>,
    pub reviewer_issues: Vec<ReviewerIssue>,
    pub blockers: Vec<String>,
    pub required_fixes: Vec<String>,
    pub stalled: Stalled,
    pub replan_hint: Option<String>,
}

impl TaskLedger {
    pub fn new(stalled_threshold: u32) -> Self {
        Self {
            plan_version: 1,
            summary: None,
            reviewer_assessment: None,
            reviewer_issues: Vec::new(),
            blockers: Vec::new(),
            required_fixes: Vec::new(),
            stalled: Stalled::new(stalled_threshold),
            replan_hint: None,
        }
    }
}

enum Signal {
    Progress,
    NonProgress,
    Neutral,
}

fn signal_of(outcome: &Outcome) -> Signal {
    match outcome {
        Outcome::Implementer { status, .. } => match status {
            ImplementerStatus::Completed => Signal::Progress,
            ImplementerStatus::Blocked | ImplementerStatus::Failed => Signal::NonProgress,
        },
        Outcome::Reviewer { assessment, .. } => match assessment {
            ReviewerAssessment::Approved => Signal::Progress,
            ReviewerAssessment::Blocked => Signal::NonProgress,
            ReviewerAssessment::NeedsChanges => Signal::Neutral,
        },
    }
}

fn dedup_push(list: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

/// Pure outcome-application function: `(currentLedger, outcome) -> nextLedger`.
pub fn apply_outcome(current: &TaskLedger, outcome: &Outcome) -> TaskLedger {
    let mut next = current.clone();
    next.plan_version += 1;

    match outcome {
        Outcome::Implementer {
            status,
            summary,
            follow_up_actions,
        } => {
            next.summary = Some(summary.clone());
            match status {
                ImplementerStatus::Completed => {
                    next.blockers.clear();
                }
                ImplementerStatus::Blocked | ImplementerStatus::Failed => {
                    dedup_push(&mut next.blockers, follow_up_actions.clone());
                }
            }
        }
        Outcome::Reviewer {
            assessment,
            issues,
            required_fixes,
        } => {
            next.reviewer_assessment = Some(*assessment);
            next.reviewer_issues = issues.clone();
            next.required_fixes = Vec::new();
            dedup_push(&mut next.required_fixes, required_fixes.clone());

            match assessment {
                ReviewerAssessment::Approved => {
                    next.blockers.clear();
                    next.required_fixes.clear();
                }
                ReviewerAssessment::Blocked => {
                    let fixes = next.required_fixes.clone();
                    dedup_push(&mut next.blockers, fixes);
                }
                ReviewerAssessment::NeedsChanges => {}
            }
        }
    }

    apply_stalled_rule(&mut next, outcome);
    next
}

fn apply_stalled_rule(ledger: &mut TaskLedger, outcome: &Outcome) {
    match signal_of(outcome) {
        Signal::Progress => {
            ledger.stalled.consecutive_non_progress = 0;
            ledger.stalled.flagged = false;
            ledger.replan_hint = None;
        }
        Signal::Neutral => {}
        Signal::NonProgress => {
            ledger.stalled.consecutive_non_progress += 1;
            let was_flagged = ledger.stalled.flagged;
            ledger.stalled.flagged =
                ledger.stalled.consecutive_non_progress >= ledger.stalled.threshold;
            if ledger.stalled.flagged && !was_flagged {
                ledger.replan_hint = Some(format!(
                    "Stalled after {} non-progress outcomes (threshold={}); split the task, relax constraints, or resolve missing dependencies before redispatch.",
                    ledger.stalled.consecutive_non_progress, ledger.stalled.threshold
                ));
            }
        }
    }
}

const PREFIX: &str = "ledger.task";

pub fn to_facts(ledger: &TaskLedger) -> Vec<Fact> {
    vec![
        Fact::new(format!("{PREFIX}.plan_version"), ledger.plan_version.to_string(), 1.0),
        Fact::new(
            format!("{PREFIX}.summary"),
            ledger.summary.clone().unwrap_or_default(),
            1.0,
        ),
        Fact::json(format!("{PREFIX}.reviewer_assessment"), &ledger.reviewer_assessment, 1.0),
        Fact::json(format!("{PREFIX}.reviewer_issues"), &ledger.reviewer_issues, 1.0),
        Fact::json(format!("{PREFIX}.blockers"), &ledger.blockers, 1.0),
        Fact::json(format!("{PREFIX}.required_fixes"), &ledger.required_fixes, 1.0),
        Fact::json(format!("{PREFIX}.stalled"), &ledger.stalled, 1.0),
        Fact::new(
            format!("{PREFIX}.replan_hint"),
            ledger.replan_hint.clone().unwrap_or_default(),
            1.0,
        ),
    ]
}

pub fn from_facts(store: &FactStore) -> Option<TaskLedger> {
    let plan_version: u32 = store.latest(&format!("{PREFIX}.plan_version"))?.parse().ok()?;
    let summary = store
        .latest(&format!("{PREFIX}.summary"))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let reviewer_assessment: Option<ReviewerAssessment> =
        serde_json::from_str(store.latest(&format!("{PREFIX}.reviewer_assessment"))?).ok()?;
    let reviewer_issues: Vec<ReviewerIssue> =
        serde_json::from_str(store.latest(&format!("{PREFIX}.reviewer_issues"))?).ok()?;
    let blockers: Vec<String> = serde_json::from_str(store.latest(&format!("{PREFIX}.blockers"))?).ok()?;
    let required_fixes: Vec<String> =
        serde_json::from_str(store.latest(&format!("{PREFIX}.required_fixes"))?).ok()?;
    let stalled: Stalled = serde_json::from_str(store.latest(&format!("{PREFIX}.stalled"))?).ok()?;
    let replan_hint = store
        .latest(&format!("{PREFIX}.replan_hint"))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    Some(TaskLedger {
        plan_version,
        summary,
        reviewer_assessment,
        reviewer_issues,
        blockers,
        required_fixes,
        stalled,
        replan_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implementer_completed_clears_blockers_and_is_progress() {
        let mut ledger = TaskLedger::new(2);
        ledger.blockers = vec!["missing dependency".into()];
        let next = apply_outcome(
            &ledger,
            &Outcome::Implementer {
                status: ImplementerStatus::Completed,
                summary: "resolved the missing dependency".into(),
                follow_up_actions: vec![],
            },
        );
        assert!(next.blockers.is_empty());
        assert_eq!(next.plan_version, 2);
        assert_eq!(next.stalled.consecutive_non_progress, 0);
        assert_eq!(next.summary.as_deref(), Some("resolved the missing dependency"));
    }

    #[test]
    fn implementer_blocked_appends_deduped_follow_ups() {
        let ledger = TaskLedger::new(2);
        let next = apply_outcome(
            &ledger,
            &Outcome::Implementer {
                status: ImplementerStatus::Blocked,
                summary: "could not resolve the merge conflict".into(),
                follow_up_actions: vec!["fix a".into(), "fix a".into()],
            },
        );
        assert_eq!(next.blockers, vec!["fix a".to_string()]);
        assert_eq!(next.stalled.consecutive_non_progress, 1);
        assert!(!next.stalled.flagged);
    }

    #[test]
    fn reviewer_approved_clears_blockers_and_fixes() {
        let mut ledger = TaskLedger::new(2);
        ledger.blockers = vec!["x".into()];
        ledger.required_fixes = vec!["y".into()];
        let next = apply_outcome(
            &ledger,
            &Outcome::Reviewer {
                assessment: ReviewerAssessment::Approved,
                issues: vec![],
                required_fixes: vec![],
            },
        );
        assert!(next.blockers.is_empty());
        assert!(next.required_fixes.is_empty());
    }

    #[test]
    fn reviewer_blocked_merges_required_fixes_into_blockers() {
        let ledger = TaskLedger::new(2);
        let next = apply_outcome(
            &ledger,
            &Outcome::Reviewer {
                assessment: ReviewerAssessment::Blocked,
                issues: vec![],
                required_fixes: vec!["address race condition".into()],
            },
        );
        assert_eq!(next.blockers, vec!["address race condition".to_string()]);
    }

    #[test]
    fn stalled_flips_at_threshold_and_sets_replan_hint() {
        let mut ledger = TaskLedger::new(2);
        ledger = apply_outcome(
            &ledger,
            &Outcome::Implementer {
                status: ImplementerStatus::Blocked,
                summary: "blocked on missing credentials".into(),
                follow_up_actions: vec![],
            },
        );
        assert!(!ledger.stalled.flagged);
        assert!(ledger.replan_hint.is_none());

        ledger = apply_outcome(
            &ledger,
            &Outcome::Reviewer {
                assessment: ReviewerAssessment::Blocked,
                issues: vec![],
                required_fixes: vec![],
            },
        );
        assert!(ledger.stalled.flagged);
        assert_eq!(ledger.stalled.consecutive_non_progress, 2);
        assert!(ledger.replan_hint.is_some());

        ledger = apply_outcome(
            &ledger,
            &Outcome::Implementer {
                status: ImplementerStatus::Completed,
                summary: "credentials rotated, task done".into(),
                follow_up_actions: vec![],
            },
        );
        assert!(!ledger.stalled.flagged);
        assert_eq!(ledger.stalled.consecutive_non_progress, 0);
        assert!(ledger.replan_hint.is_none());
    }

    #[test]
    fn needs_changes_is_neutral_and_does_not_touch_stalled_counter() {
        let mut ledger = TaskLedger::new(2);
        ledger = apply_outcome(
            &ledger,
            &Outcome::Implementer {
                status: ImplementerStatus::Blocked,
                summary: "blocked on flaky test".into(),
                follow_up_actions: vec![],
            },
        );
        assert_eq!(ledger.stalled.consecutive_non_progress, 1);

        let next = apply_outcome(
            &ledger,
            &Outcome::Reviewer {
                assessment: ReviewerAssessment::NeedsChanges,
                issues: vec![],
                required_fixes: vec!["tweak".into()],
            },
        );
        assert_eq!(next.stalled.consecutive_non_progress, 1);
        assert!(!next.stalled.flagged);
    }

    #[test]
    fn facts_round_trip() {
        let mut ledger = TaskLedger::new(3);
        ledger.summary = Some("did the thing".into());
        ledger.blockers = vec!["b1".into()];
        let mut store = FactStore::new();
        store.extend(to_facts(&ledger));
        let restored = from_facts(&store).unwrap();
        assert_eq!(restored, ledger);
    }

    #[test]
    fn from_facts_missing_is_none() {
        let store = FactStore::new();
        assert!(from_facts(&store).is_none());
    }
}
