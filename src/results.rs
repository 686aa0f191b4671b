//! Results Builder: assembles the final result document for a run and
//! writes it to the results directory and, when possible, the repo root.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::{Fix, RunStatus, Score, TimelineEvent};

#[derive(Debug, Serialize)]
pub struct ResultsDocument {
    pub repository: String,
    pub team_name: String,
    pub leader_name: String,
    pub branch_name: String,
    pub total_failures: u32,
    pub total_fixes: u32,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub final_status: RunStatus,
    pub total_time: String,
    pub total_time_seconds: f64,
    pub score: Score,
    pub fixes: Vec<Fix>,
    pub timeline: Vec<TimelineEvent>,
    pub generated_at: chrono::DateTime<Utc>,
}

/// Format seconds as `1h 2m 3s` / `2m 45s` / `8s`, dropping leading
/// zero components.
#[must_use]
pub fn format_duration_human(total_seconds: f64) -> String {
    let total = total_seconds.max(0.0) as u64;
    let (m, s) = (total / 60, total % 60);
    if m >= 60 {
        let (h, m) = (m / 60, m % 60);
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn build(
    repository: String,
    team_name: String,
    leader_name: String,
    branch_name: String,
    total_failures: u32,
    iterations_used: u32,
    max_iterations: u32,
    final_status: RunStatus,
    total_time_seconds: f64,
    total_commits: u32,
    fixes: Vec<Fix>,
    timeline: Vec<TimelineEvent>,
) -> ResultsDocument {
    let score = Score::calculate(total_time_seconds, total_commits);
    ResultsDocument {
        repository,
        team_name,
        leader_name,
        branch_name,
        total_failures,
        total_fixes: fixes.len() as u32,
        iterations_used,
        max_iterations,
        final_status,
        total_time: format_duration_human(total_time_seconds),
        total_time_seconds: (total_time_seconds * 100.0).round() / 100.0,
        score,
        fixes,
        timeline,
        generated_at: Utc::now(),
    }
}

/// Persist `doc` at `<results_dir>/<run_id>/results.json`, and duplicate
/// at `<repo_path>/results.json` when the working tree still exists.
/// The duplicate write is best-effort: its failure is logged, never
/// propagated.
pub fn save(
    doc: &ResultsDocument,
    results_dir: &Path,
    run_id: &str,
    repo_path: Option<&Path>,
) -> std::io::Result<std::path::PathBuf> {
    let dir = results_dir.join(run_id);
    std::fs::create_dir_all(&dir)?;
    let primary_path = dir.join("results.json");
    let payload = serde_json::to_string_pretty(doc)?;
    std::fs::write(&primary_path, &payload)?;
    info!(path = %primary_path.display(), "results.json saved");

    if let Some(repo_path) = repo_path {
        let repo_results = repo_path.join("results.json");
        if let Err(e) = std::fs::write(&repo_results, &payload) {
            warn!(path = %repo_results.display(), error = %e, "could not write results.json to repo");
        } else {
            info!(path = %repo_results.display(), "results.json also saved in repo");
        }
    }

    Ok(primary_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BugKind;

    #[test]
    fn duration_formats_drop_leading_zero_components() {
        assert_eq!(format_duration_human(8.0), "8s");
        assert_eq!(format_duration_human(165.0), "2m 45s");
        assert_eq!(format_duration_human(3725.0), "1h 2m 5s");
    }

    #[test]
    fn build_computes_score_and_counts_from_fixes() {
        let fixes = vec![Fix {
            file: "a.py".to_string(),
            bug_kind: BugKind::Logic,
            line: 1,
            summary: "s".to_string(),
            diff: "d".to_string(),
            commit_message: "m".to_string(),
            status: crate::types::FixStatus::Fixed,
            confidence: 0.9,
            root_cause: "r".to_string(),
        }];
        let doc = build(
            "https://github.com/acme/widgets".to_string(),
            "teamx".to_string(),
            "alice".to_string(),
            "TEAMX_ALICE_AI_Fix".to_string(),
            1,
            1,
            5,
            RunStatus::Passed,
            120.0,
            3,
            fixes,
            vec![],
        );
        assert_eq!(doc.total_fixes, 1);
        assert_eq!(doc.score.final_score, 110);
        assert_eq!(doc.total_time, "2m 0s");
    }

    #[test]
    fn save_writes_primary_and_repo_duplicate() {
        let results_dir = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let doc = build(
            "https://github.com/acme/widgets".to_string(),
            "teamx".to_string(),
            "alice".to_string(),
            "TEAMX_ALICE_AI_Fix".to_string(),
            0,
            0,
            5,
            RunStatus::Passed,
            10.0,
            0,
            vec![],
            vec![],
        );
        let primary = save(&doc, results_dir.path(), "run-1", Some(repo_dir.path())).unwrap();
        assert!(primary.exists());
        assert!(repo_dir.path().join("results.json").exists());
    }
}
