//! Failure Parser: converts raw test-runner output into a deduplicated
//! list of structured [`Failure`] records.
//!
//! Cascade, stopping at the first strategy that yields at
//! least one record: generic traceback extractor → JS runner patterns →
//! lint-tool patterns → synthetic fallback. The synthetic fallback is
//! essential: a non-zero exit with nothing parsed must never read as
//! success.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::classifier::classify_bug_type;
use crate::types::{BugKind, Failure};

const RAW_OUTPUT_WINDOW: usize = 2000;
const SANDBOX_MOUNT_PREFIX: &[&str] = &["workspace/", "app/"];

static PY_TRACEBACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap()
});

static PY_EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Failure|Warning)):\s*(.*)$").unwrap()
});

static JS_FAIL_FILE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"FAIL\s+(\S+)").unwrap());

static JS_AT_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"at\s+\S+\s+\(([^:)]+):(\d+):\d+\)").unwrap()
});

static JS_SYNTAX_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SyntaxError:\s*(/?\S+\.(?:js|jsx|ts|tsx))\S*.*?\((\d+):\d+\)").unwrap()
});

static JS_ANY_FILE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:/workspace/)?(\S+\.(?:js|jsx|ts|tsx)):(\d+):\d+").unwrap()
});

static JS_SRC_FILE_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:src|lib|test|tests|__tests__)/\S+\.(?:js|jsx|ts|tsx))").unwrap()
});

static JS_EXPECT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(expect\(.+?\)\.to\S+\(.*?\))").unwrap()
});

static JS_EXPECTED_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)(Expected .+)").unwrap());

static JS_TESTING_LIBRARY_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(TestingLibraryElementError:\s*.+?)(?:\n\n|\n\s*\n)").unwrap()
});

static JS_GENERIC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)((?:Syntax|Type|Reference)?Error:\s*.+?)(?:\n\s*at\s|\z)").unwrap()
});

static ESLINT_FILE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\S+\.(?:js|jsx|ts|tsx))\s*$").unwrap()
});

static ESLINT_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s+(\d+):(\d+)\s+(error|warning)\s+(.+?)\s+(\S+)\s*$").unwrap()
});

static SOURCE_PATH_GUESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:src|lib|app|test|tests)/\S+\.(?:js|jsx|ts|tsx|py|go|rs))").unwrap()
});

/// Strip a leading sandbox-mount prefix (`/workspace/`, `/app/`) and any
/// remaining leading slash.
fn normalize_path(path: &str) -> String {
    let mut p = path.trim_start_matches('/');
    for prefix in SANDBOX_MOUNT_PREFIX {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest;
            break;
        }
    }
    p.to_string()
}

fn snippet_for(repo_path: &Path, file: &str, line: u32) -> String {
    if line == 0 {
        return String::new();
    }
    let abs = repo_path.join(file);
    let Ok(content) = std::fs::read_to_string(&abs) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let idx = (line - 1) as usize;
    let start = idx.saturating_sub(3);
    let end = (idx + 4).min(lines.len());
    if start >= lines.len() {
        return String::new();
    }
    (start..end)
        .map(|i| format!("{}: {}", i + 1, lines[i]))
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_failure(
    bug_kind: BugKind,
    file: String,
    line: u32,
    error_message: String,
    snippet: String,
    raw_output: &str,
) -> Failure {
    Failure {
        bug_kind,
        file,
        line,
        error_message,
        snippet,
        raw_output: raw_output.chars().take(RAW_OUTPUT_WINDOW).collect(),
    }
}

/// Strategy 1: recognize Python-style tracebacks and bare
/// `ErrorType: message` lines common across languages.
fn parse_generic_frames(output: &str, repo_path: &Path) -> Vec<Failure> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for exc_match in PY_EXCEPTION_LINE.captures_iter(output) {
        let error_type = exc_match[1].to_string();
        let message = exc_match[2].trim().to_string();

        // Prefer the last traceback frame preceding this exception line —
        // that's the one that actually raised.
        let exc_pos = exc_match.get(0).unwrap().start();
        let prefix = &output[..exc_pos];
        let (mut file, mut line) = (String::from("unknown"), 0u32);
        if let Some(frame) = PY_TRACEBACK_FRAME.captures_iter(prefix).last() {
            file = normalize_path(&frame[1]);
            line = frame[2].parse().unwrap_or(0);
        }

        let bug_kind = classify_bug_type(&error_type, &message, output);
        let snippet = snippet_for(repo_path, &file, line);
        let failure = make_failure(bug_kind, file, line, format!("{error_type}: {message}"), snippet, output);

        if !seen.insert(failure.dedup_key()) {
            continue;
        }
        out.push(failure);
    }

    out
}

/// Strategy 2: Jest/Vitest/Mocha `FAIL <file>` + `● <test name>` blocks.
fn parse_js_failures(output: &str, repo_path: &Path) -> Vec<Failure> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    let fail_files: Vec<&str> = JS_FAIL_FILE.captures_iter(output).map(|c| c.get(1).unwrap().as_str()).collect();

    let blocks: Vec<&str> = output.split('\u{25cf}').collect();
    for block in blocks.iter().skip(1) {
        let test_name = block.trim().lines().next().unwrap_or("unknown test").trim().to_string();

        let mut file_line: Option<(String, u32)> = None;
        if let Some(m) = JS_AT_LOCATION.captures(block) {
            let path = &m[1];
            if !path.contains("node_modules") {
                file_line = Some((path.to_string(), m[2].parse().unwrap_or(0)));
            }
        }
        if file_line.is_none() {
            if let Some(m) = JS_SYNTAX_LOCATION.captures(block) {
                file_line = Some((m[1].to_string(), m[2].parse().unwrap_or(0)));
            }
        }
        if file_line.is_none() {
            for m in JS_ANY_FILE_REF.captures_iter(block) {
                if !m[1].contains("node_modules") {
                    file_line = Some((m[1].to_string(), m[2].parse().unwrap_or(0)));
                    break;
                }
            }
        }
        if file_line.is_none() {
            if let Some(m) = JS_SRC_FILE_FALLBACK.captures(block) {
                file_line = Some((m[1].to_string(), 0));
            }
        }

        let (file, line) = file_line.unwrap_or_else(|| {
            (fail_files.first().map(|s| (*s).to_string()).unwrap_or_else(|| "unknown".to_string()), 0)
        });
        let file = normalize_path(&file);

        let mut err_msg = test_name.clone();
        if let Some(m) = JS_EXPECT_LINE.captures(block) {
            err_msg = format!("{test_name}: {}", m[1].replace('\n', " "));
        } else if let Some(m) = JS_EXPECTED_LINE.captures(block) {
            err_msg = format!("{test_name}: {}", m[1].replace('\n', " "));
        } else if let Some(m) = JS_TESTING_LIBRARY_ERROR.captures(block) {
            err_msg = format!("{test_name}: {}", m[1].replace('\n', " "));
        } else if let Some(m) = JS_GENERIC_ERROR.captures(block) {
            err_msg = format!("{test_name}: {}", m[1].replace('\n', " "));
        }
        let err_msg: String = err_msg.chars().take(300).collect();

        let bug_kind = classify_bug_type("AssertionError", &err_msg, block);
        let snippet = snippet_for(repo_path, &file, line);
        let failure = make_failure(bug_kind, file, line, err_msg, snippet, block);

        if !seen.insert(failure.dedup_key()) {
            continue;
        }
        out.push(failure);
    }

    if out.is_empty() {
        for f in fail_files {
            let file = normalize_path(f);
            let failure = make_failure(BugKind::Logic, file.clone(), 0, format!("Test suite failed: {file}"), String::new(), output);
            if !seen.insert(failure.dedup_key()) {
                continue;
            }
            out.push(failure);
        }
    }

    out
}

/// Strategy 3: ESLint-style `file` header + indented `line:col severity
/// message rule` rows.
fn parse_lint_failures(output: &str) -> Vec<Failure> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut current_file: Option<String> = None;

    for line_text in output.lines() {
        if let Some(m) = ESLINT_FILE_HEADER.captures(line_text) {
            current_file = Some(normalize_path(&m[1]));
            continue;
        }
        if let Some(m) = ESLINT_ROW.captures(line_text) {
            let Some(file) = current_file.clone() else { continue };
            let line: u32 = m[1].parse().unwrap_or(0);
            let severity = &m[3];
            let message = &m[4];
            let rule = &m[5];

            // Dedups on the rule id rather than `Failure::dedup_key()`'s
            // message-head split: lint messages don't carry an error-type
            // prefix before a colon, so the rule id is the real identity
            // here — two different rules firing on the same line are
            // distinct failures, not duplicates.
            let key = (file.clone(), line, rule.to_string());
            if !seen.insert(key) {
                continue;
            }

            out.push(make_failure(
                BugKind::Linting,
                file,
                line,
                format!("ESLint {severity}: {message} ({rule})"),
                String::new(),
                output,
            ));
        }
    }

    out
}

fn extract_first_error_line(output: &str) -> String {
    for line in output.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        let lower = stripped.to_lowercase();
        if ["error", "fail", "exception", "traceback", "assert"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            return stripped.chars().take(300).collect();
        }
    }
    output
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().chars().take(300).collect())
        .unwrap_or_else(|| "Test process exited with non-zero code".to_string())
}

/// Strategy 4: synthetic fallback. Guarantees that a non-zero exit with
/// nothing parsed never reads as "no failures".
fn synthetic_fallback(output: &str) -> Vec<Failure> {
    if output.trim().is_empty() {
        return Vec::new();
    }
    let file = SOURCE_PATH_GUESS
        .captures(output)
        .map(|m| normalize_path(&m[1]))
        .unwrap_or_else(|| "unknown".to_string());
    let message = extract_first_error_line(output);
    let bug_kind = classify_bug_type("Error", &message, output);
    vec![make_failure(bug_kind, file, 0, message, String::new(), output)]
}

/// Parse raw test-runner `output` into a deduplicated failure list.
///
/// Runs the cascade in order, stopping at the first strategy yielding at
/// least one record. If the exit code is non-zero and nothing was
/// parsed, falls back to a single synthetic failure — this function
/// MUST NEVER return empty when `exit_code != 0` and `output` is
/// non-blank.
#[must_use]
pub fn parse_failures(output: &str, repo_path: &Path, exit_code: i32) -> Vec<Failure> {
    let mut failures = parse_generic_frames(output, repo_path);
    if failures.is_empty() {
        failures = parse_js_failures(output, repo_path);
    }
    if failures.is_empty() {
        failures = parse_lint_failures(output);
    }
    if failures.is_empty() && exit_code != 0 {
        failures = synthetic_fallback(output);
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn parses_python_traceback_with_snippet() {
        let dir = repo();
        std::fs::write(
            dir.path().join("utils.py"),
            "def f():\n    pass\n\n\ndef g():\n    assert 1 == 2\n",
        )
        .unwrap();
        let output = "Traceback (most recent call last):\n  File \"utils.py\", line 6, in g\nAssertionError: expected 1 got 2\n";
        let failures = parse_failures(output, dir.path(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "utils.py");
        assert_eq!(failures[0].line, 6);
        assert_eq!(failures[0].bug_kind, BugKind::Logic);
        assert!(!failures[0].snippet.is_empty());
    }

    #[test]
    fn dedups_repeated_exceptions() {
        let dir = repo();
        let output = "File \"a.py\", line 1\nValueError: bad\nFile \"a.py\", line 1\nValueError: bad\n";
        let failures = parse_failures(output, dir.path(), 1);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn parses_jest_fail_block_skipping_node_modules_frames() {
        let dir = repo();
        let output = "FAIL src/App.test.js\n\u{25cf} renders heading\n\n  expect(received).toBe(expected)\n\n    at Object.<anonymous> (node_modules/foo/bar.js:1:1)\n    at Object.<anonymous> (src/App.test.js:10:5)\n";
        let failures = parse_failures(output, dir.path(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "src/App.test.js");
        assert_eq!(failures[0].line, 10);
    }

    #[test]
    fn parses_testing_library_multi_element_error() {
        let dir = repo();
        let output = "FAIL src/App.test.js\n\u{25cf} finds button\n\n    at Object.<anonymous> (src/App.test.js:20:3)\nTestingLibraryElementError: Found multiple elements with the text: Add Note\n\n(more context follows)\n";
        let failures = parse_failures(output, dir.path(), 1);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error_message.contains("TestingLibraryElementError"));
        assert_eq!(failures[0].bug_kind, BugKind::Logic);
    }

    #[test]
    fn parses_eslint_style_output() {
        let output = "src/App.js\n  10:5  error  'x' is defined but never used  no-unused-vars\n";
        let failures = parse_failures(output, Path::new("/tmp/does-not-matter"), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].bug_kind, BugKind::Linting);
        assert_eq!(failures[0].line, 10);
    }

    #[test]
    fn synthetic_fallback_never_returns_empty_on_nonzero_exit() {
        let output = "some totally unstructured crash output with no recognizable frames\nbut it does say error somewhere";
        let failures = parse_failures(output, Path::new("/tmp/does-not-matter"), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].line, 0);
    }

    #[test]
    fn exit_zero_with_unparseable_output_yields_no_synthetic_failure() {
        let failures = parse_failures("all good, nothing to see", Path::new("/tmp/x"), 0);
        assert!(failures.is_empty());
    }

    #[test]
    fn normalizes_workspace_mount_prefix() {
        assert_eq!(normalize_path("/workspace/src/App.js"), "src/App.js");
        assert_eq!(normalize_path("app/main.py"), "main.py");
    }
}
