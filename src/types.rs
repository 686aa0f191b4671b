//! Core data model: the records that flow through a healing run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the six canonical bug kinds a [`crate::classifier`] can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BugKind {
    Linting,
    Syntax,
    Logic,
    #[serde(rename = "TYPE_ERROR")]
    TypeError,
    Import,
    Indentation,
}

impl BugKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BugKind::Linting => "LINTING",
            BugKind::Syntax => "SYNTAX",
            BugKind::Logic => "LOGIC",
            BugKind::TypeError => "TYPE_ERROR",
            BugKind::Import => "IMPORT",
            BugKind::Indentation => "INDENTATION",
        }
    }
}

impl std::fmt::Display for BugKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record extracted from test-runner output.
///
/// Uniqueness key is `(file, line, error_type_head)`; see
/// [`crate::failure_parser`] for dedup handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub bug_kind: BugKind,
    pub file: String,
    pub line: u32,
    pub error_message: String,
    pub snippet: String,
    /// Truncated raw-output slice, kept for prompt context.
    pub raw_output: String,
}

impl Failure {
    pub fn dedup_key(&self) -> (String, u32, String) {
        let head = self
            .error_message
            .split(':')
            .next()
            .unwrap_or(&self.error_message)
            .trim()
            .to_string();
        (self.file.clone(), self.line, head)
    }
}

/// Lifecycle status of a [`Fix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Pending,
    Generated,
    Applied,
    ApplyFailed,
    Fixed,
    Unfixable,
    Error,
}

impl FixStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::Generated => "generated",
            FixStatus::Applied => "applied",
            FixStatus::ApplyFailed => "apply_failed",
            FixStatus::Fixed => "fixed",
            FixStatus::Unfixable => "unfixable",
            FixStatus::Error => "error",
        }
    }
}

/// A proposed or applied patch against one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fix {
    pub file: String,
    pub bug_kind: BugKind,
    pub line: u32,
    pub summary: String,
    pub diff: String,
    pub commit_message: String,
    pub status: FixStatus,
    pub confidence: f32,
    pub root_cause: String,
}

impl Fix {
    /// `true` once the patch applier has written this fix to disk, and it
    /// has not since failed verification again.
    pub fn is_committable(&self) -> bool {
        matches!(self.status, FixStatus::Applied | FixStatus::Fixed)
    }
}

/// `{phase, timestamp, details}`, append-only per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub phase: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Derived score breakdown. Never persisted independent of a run's
/// results document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub base: i64,
    pub speed_bonus: i64,
    pub efficiency_penalty: i64,
    pub total_commits: u32,
    pub final_score: i64,
}

const SCORE_BASE: i64 = 100;
const SPEED_BONUS_THRESHOLD_SECS: f64 = 300.0;
const SPEED_BONUS: i64 = 10;
const FREE_COMMITS: u32 = 20;
const PENALTY_PER_COMMIT: i64 = 2;

impl Score {
    pub fn calculate(total_time_seconds: f64, total_commits: u32) -> Self {
        let speed_bonus = if total_time_seconds < SPEED_BONUS_THRESHOLD_SECS {
            SPEED_BONUS
        } else {
            0
        };
        let extra_commits = total_commits.saturating_sub(FREE_COMMITS);
        let efficiency_penalty = i64::from(extra_commits) * PENALTY_PER_COMMIT;
        let final_score = (SCORE_BASE + speed_bonus - efficiency_penalty).max(0);

        Self {
            base: SCORE_BASE,
            speed_bonus,
            efficiency_penalty,
            total_commits,
            final_score,
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_gives_speed_bonus_under_five_minutes() {
        let s = Score::calculate(120.0, 3);
        assert_eq!(s.speed_bonus, 10);
        assert_eq!(s.efficiency_penalty, 0);
        assert_eq!(s.final_score, 110);
    }

    #[test]
    fn score_penalizes_commits_beyond_twenty() {
        let s = Score::calculate(600.0, 25);
        assert_eq!(s.speed_bonus, 0);
        assert_eq!(s.efficiency_penalty, 10);
        assert_eq!(s.final_score, 90);
    }

    #[test]
    fn score_floors_at_zero() {
        let s = Score::calculate(600.0, 1000);
        assert_eq!(s.final_score, 0);
    }

    #[test]
    fn dedup_key_uses_error_type_head() {
        let f = Failure {
            bug_kind: BugKind::Logic,
            file: "a.py".into(),
            line: 10,
            error_message: "AssertionError: expected 1 got 2".into(),
            snippet: String::new(),
            raw_output: String::new(),
        };
        assert_eq!(f.dedup_key(), ("a.py".to_string(), 10, "AssertionError".to_string()));
    }

    #[test]
    fn bug_kind_serializes_to_canonical_uppercase() {
        assert_eq!(
            serde_json::to_string(&BugKind::TypeError).unwrap(),
            "\"TYPE_ERROR\""
        );
        assert_eq!(serde_json::to_string(&BugKind::Logic).unwrap(), "\"LOGIC\"");
    }
}
