//! Bug Classifier: maps an error shape to one of six canonical bug kinds.
//!
//! Resolution order: exact error-type match, then an
//! ordered regex cascade (indentation → syntax → import → type → linting
//! → logic), then a `LOGIC` fallback.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::BugKind;

static MESSAGE_PATTERNS: LazyLock<Vec<(Regex, BugKind)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)unexpected indent|indentationerror|taberror|indentation").unwrap(),
            BugKind::Indentation,
        ),
        (
            Regex::new(r"(?i)syntaxerror|invalid syntax|unexpected token|parsing error").unwrap(),
            BugKind::Syntax,
        ),
        (
            Regex::new(r"(?i)importerror|modulenotfounderror|cannot find module|no module named|cannot resolve")
                .unwrap(),
            BugKind::Import,
        ),
        (
            Regex::new(r"(?i)typeerror|type error|not callable|not iterable|is not a function").unwrap(),
            BugKind::TypeError,
        ),
        (
            Regex::new(r"(?i)lint|flake8|pylint|eslint|E\d{3}|W\d{3}|C\d{3}|F\d{3}|unused|trailing whitespace|line too long")
                .unwrap(),
            BugKind::Linting,
        ),
        (
            Regex::new(r"(?i)nameerror|keyerror|indexerror|valueerror|attributeerror|assertionerror|referenceerror|undefined|is not defined")
                .unwrap(),
            BugKind::Logic,
        ),
    ]
});

/// Exact error-type name → canonical kind. Checked before the regex cascade.
fn exact_match(error_type: &str) -> Option<BugKind> {
    Some(match error_type.trim() {
        "SyntaxError" => BugKind::Syntax,
        "IndentationError" | "TabError" => BugKind::Indentation,
        "TypeError" => BugKind::TypeError,
        "ImportError" | "ModuleNotFoundError" => BugKind::Import,
        "NameError" | "AttributeError" | "ValueError" | "KeyError" | "IndexError"
        | "ZeroDivisionError" | "RuntimeError" | "AssertionError" | "UnboundLocalError"
        | "RecursionError" | "StopIteration" | "FileNotFoundError" | "PermissionError"
        | "OSError" | "IOError" | "ReferenceError" | "RangeError" | "URIError"
        | "EvalError" | "TestFailure" | "TestSuiteFailure" => BugKind::Logic,
        "LintError" | "StyleError" => BugKind::Linting,
        _ => return None,
    })
}

/// Classify an error into one of the six canonical bug kinds.
///
/// `error_type` is checked for an exact match first; on miss, `error_type`,
/// `error_message`, and `test_output` are concatenated and matched against
/// an ordered regex table. Never fails — unmatched input falls back to
/// `LOGIC`.
#[must_use]
pub fn classify_bug_type(error_type: &str, error_message: &str, test_output: &str) -> BugKind {
    if let Some(kind) = exact_match(error_type) {
        return kind;
    }

    let combined = format!("{error_type} {error_message} {test_output}");
    for (pattern, kind) in MESSAGE_PATTERNS.iter() {
        if pattern.is_match(&combined) {
            return *kind;
        }
    }

    BugKind::Logic
}

/// Format the canonical summary line:
/// `<KIND> error in <file> line <n> → Fix: <description>`.
#[must_use]
pub fn format_summary_line(kind: BugKind, file: &str, line: u32, fix_description: &str) -> String {
    format!("{kind} error in {file} line {line} \u{2192} Fix: {fix_description}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_exact_match() {
        assert_eq!(classify_bug_type("SyntaxError", "", ""), BugKind::Syntax);
    }

    #[test]
    fn indentation_shadows_nothing_ahead_of_it() {
        assert_eq!(
            classify_bug_type("Error", "unexpected indent on line 4", ""),
            BugKind::Indentation
        );
    }

    #[test]
    fn import_error_exact_match() {
        assert_eq!(classify_bug_type("ModuleNotFoundError", "", ""), BugKind::Import);
    }

    #[test]
    fn unknown_error_type_falls_through_to_regex() {
        assert_eq!(
            classify_bug_type("Error", "TypeError: x is not a function", ""),
            BugKind::TypeError
        );
    }

    #[test]
    fn unmatched_input_falls_back_to_logic() {
        assert_eq!(classify_bug_type("WeirdError", "nothing recognizable here", ""), BugKind::Logic);
    }

    #[test]
    fn linting_pattern_does_not_get_shadowed_by_logic_bucket() {
        assert_eq!(
            classify_bug_type("LintError", "unused variable 'x'", ""),
            BugKind::Linting
        );
    }

    #[test]
    fn summary_line_uses_exact_arrow_character() {
        let line = format_summary_line(BugKind::Logic, "src/utils.py", 42, "guard against None");
        assert_eq!(line, "LOGIC error in src/utils.py line 42 \u{2192} Fix: guard against None");
    }
}
