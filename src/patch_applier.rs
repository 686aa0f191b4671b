//! Patch Applier: applies a unified diff via three escalating strategies.
//!
//! 1. `git apply --whitespace=fix`
//! 2. `git apply --3way`
//! 3. Manual hunk-split / string-replace fallback
//!
//! Writes only if at least one hunk matched and the resulting content
//! differs from what was there before; never promotes a Fix past
//! `applied` itself — that is the Orchestrator's job once verification
//! passes.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ApplyError;

const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(30);

static DIFF_FILE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:---|\+\+\+)\s+[ab]/(.+)$").unwrap()
});

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^@@[^@]*@@.*$").unwrap());

/// Apply `diff` against the repository rooted at `repo_path`. `target_file`
/// is used for the manual fallback when the diff's own `---`/`+++`
/// headers don't resolve to an existing file.
///
/// Returns `Ok(())` on success, [`ApplyError::NoMatch`] if no strategy
/// could apply any hunk.
pub async fn apply(repo_path: &Path, diff: &str, target_file: &str) -> Result<(), ApplyError> {
    if try_git_apply(repo_path, diff, &["--whitespace=fix"]).await {
        return Ok(());
    }
    if try_git_apply(repo_path, diff, &["--3way"]).await {
        return Ok(());
    }
    if apply_manually(repo_path, diff, target_file)? {
        return Ok(());
    }
    Err(ApplyError::NoMatch)
}

async fn try_git_apply(repo_path: &Path, diff: &str, extra_args: &[&str]) -> bool {
    let patch_path = repo_path.join(format!(".healer_patch_{}.diff", Uuid::new_v4()));
    if tokio::fs::write(&patch_path, diff).await.is_err() {
        return false;
    }

    let mut args = vec!["apply".to_string()];
    args.extend(extra_args.iter().map(|s| (*s).to_string()));
    args.push(patch_path.to_string_lossy().into_owned());

    let result = Command::new("git")
        .args(&args)
        .current_dir(repo_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let applied = match result {
        Ok(child) => tokio::time::timeout(GIT_APPLY_TIMEOUT, child.wait_with_output())
            .await
            .ok()
            .and_then(Result::ok)
            .is_some_and(|o| o.status.success()),
        Err(e) => {
            warn!(error = %e, "failed to spawn git apply");
            false
        }
    };

    let _ = tokio::fs::remove_file(&patch_path).await;
    applied
}

/// Manual fallback: split the diff at hunk headers; within each hunk,
/// collect `-`/context lines as `old_block` and `+`/context lines as
/// `new_block`. Context lines without the unified-diff leading space (a
/// common model error) are tolerated. If `old_block` isn't found
/// verbatim, retries with right-trimmed lines.
fn apply_manually(repo_path: &Path, diff: &str, target_file: &str) -> Result<bool, ApplyError> {
    let file_path = DIFF_FILE_HEADER
        .captures(diff)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| target_file.to_string());

    let mut abs_path = repo_path.join(&file_path);
    if !abs_path.exists() {
        abs_path = repo_path.join(target_file);
        if !abs_path.exists() {
            return Ok(false);
        }
    }

    let original = std::fs::read_to_string(&abs_path)?;
    let mut content = original.clone();

    let hunks = split_hunks(diff);
    let mut applied_any = false;

    for hunk in &hunks {
        let (old_lines, new_lines) = split_hunk_lines(hunk);
        if old_lines.is_empty() && new_lines.is_empty() {
            continue;
        }

        let old_block = old_lines.join("\n");
        let new_block = new_lines.join("\n");

        if !old_block.is_empty() && content.contains(&old_block) {
            content = content.replacen(&old_block, &new_block, 1);
            applied_any = true;
            continue;
        }

        if !old_block.is_empty() {
            if let Some(replacement) = replace_with_rtrim_match(&content, &old_lines, &new_block) {
                content = replacement;
                applied_any = true;
            }
        }
    }

    if applied_any && content != original {
        std::fs::write(&abs_path, &content)?;
        debug!(file = %file_path, "manual patch applier wrote changes");
        return Ok(true);
    }

    Ok(false)
}

fn split_hunks(diff: &str) -> Vec<&str> {
    let mut hunks: Vec<&str> = HUNK_HEADER.split(diff).collect();
    if hunks.len() <= 1 {
        return vec![diff];
    }
    hunks.remove(0);
    hunks
}

fn split_hunk_lines(hunk: &str) -> (Vec<String>, Vec<String>) {
    let mut old_lines = Vec::new();
    let mut new_lines = Vec::new();

    for line in hunk.lines() {
        if line.starts_with('-') && !line.starts_with("---") {
            old_lines.push(line[1..].to_string());
        } else if line.starts_with('+') && !line.starts_with("+++") {
            new_lines.push(line[1..].to_string());
        } else if let Some(rest) = line.strip_prefix(' ') {
            old_lines.push(rest.to_string());
            new_lines.push(rest.to_string());
        } else if !(line.starts_with('\\') || line.starts_with("diff") || line.starts_with("---") || line.starts_with("+++")) {
            old_lines.push(line.to_string());
            new_lines.push(line.to_string());
        }
    }

    (old_lines, new_lines)
}

fn replace_with_rtrim_match(content: &str, old_lines: &[String], new_block: &str) -> Option<String> {
    let content_lines: Vec<&str> = content.lines().collect();
    let window_len = old_lines.len();
    if window_len == 0 || window_len > content_lines.len() {
        return None;
    }

    let stripped_old: Vec<String> = old_lines.iter().map(|l| l.trim_end().to_string()).collect();

    for start in 0..=(content_lines.len() - window_len) {
        let window: Vec<String> = content_lines[start..start + window_len]
            .iter()
            .map(|l| l.trim_end().to_string())
            .collect();
        if window == stripped_old {
            let before = content_lines[..start].join("\n");
            let after = content_lines[start + window_len..].join("\n");
            let mut out = String::new();
            if !before.is_empty() {
                out.push_str(&before);
                out.push('\n');
            }
            out.push_str(new_block);
            if !after.is_empty() {
                out.push('\n');
                out.push_str(&after);
            }
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn manual_apply_replaces_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.py", "def f():\n    return 1\n");
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n def f():\n-    return 1\n+    return 2\n";
        let applied = apply_manually(dir.path(), diff, "a.py").unwrap();
        assert!(applied);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.contains("return 2"));
    }

    #[test]
    fn manual_apply_retries_with_right_trim_on_whitespace_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.py", "def f():   \n    return 1\n");
        // Diff's context line has no trailing whitespace, unlike the file's.
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n def f():\n-    return 1\n+    return 2\n";
        let applied = apply_manually(dir.path(), diff, "a.py").unwrap();
        assert!(applied);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.contains("return 2"));
    }

    #[test]
    fn manual_apply_tolerates_missing_leading_space_context_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.py", "x = 1\ny = 2\n");
        // "y = 2" here is context but missing its leading space (model error).
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n-x = 1\n+x = 10\ny = 2\n";
        let applied = apply_manually(dir.path(), diff, "a.py").unwrap();
        assert!(applied);
    }

    #[test]
    fn manual_apply_fails_when_old_block_not_found_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.py", "totally different content\n");
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,1 +1,1 @@\n-nonexistent line\n+replacement line\n";
        let applied = apply_manually(dir.path(), diff, "a.py").unwrap();
        assert!(!applied);
    }

    #[test]
    fn manual_apply_returns_false_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "--- a/missing.py\n+++ b/missing.py\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        let applied = apply_manually(dir.path(), diff, "missing.py").unwrap();
        assert!(!applied);
    }

    #[test]
    fn no_op_diff_reports_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.py", "x = 1\n");
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,1 +1,1 @@\n-x = 1\n+x = 1\n";
        let applied = apply_manually(dir.path(), diff, "a.py").unwrap();
        assert!(!applied);
    }
}
