//! Framework Probe: detects the test framework in use and the command to
//! invoke it.
//!
//! Detection cascade: config file → `package.json` dependency
//! match → Python test-file presence → JS test-file presence → Go test
//! files → ultimate `pytest` fallback.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

/// One of the seven frameworks the probe can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Pytest,
    Unittest,
    Jest,
    Mocha,
    Vitest,
    GoTest,
    CargoTest,
}

impl Framework {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Framework::Pytest => "pytest",
            Framework::Unittest => "unittest",
            Framework::Jest => "jest",
            Framework::Mocha => "mocha",
            Framework::Vitest => "vitest",
            Framework::GoTest => "go_test",
            Framework::CargoTest => "cargo_test",
        }
    }

    fn is_js(self) -> bool {
        matches!(self, Framework::Jest | Framework::Mocha | Framework::Vitest)
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directories skipped during every filesystem scan, to avoid dependency
/// trees and build caches.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    "venv",
    ".venv",
    "env",
    ".env",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "coverage",
    ".pytest_cache",
    ".mypy_cache",
    "htmlcov",
    ".tox",
];

const FRAMEWORK_CONFIG_FILES: &[(Framework, &[&str])] = &[
    (Framework::Pytest, &["pytest.ini"]),
    (Framework::Jest, &["jest.config.js", "jest.config.ts", "jest.config.mjs", "jest.config.cjs"]),
    (Framework::Mocha, &[".mocharc.yml", ".mocharc.yaml", ".mocharc.json", ".mocharc.js"]),
    (Framework::Vitest, &["vitest.config.ts", "vitest.config.js", "vitest.config.mts"]),
    (Framework::GoTest, &["go.mod"]),
    (Framework::CargoTest, &["Cargo.toml"]),
];

/// Detect the primary test framework in a cloned repository.
#[must_use]
pub fn detect_test_framework(repo_path: &Path) -> Framework {
    for (framework, files) in FRAMEWORK_CONFIG_FILES {
        for cfg in *files {
            if repo_path.join(cfg).is_file() {
                return *framework;
            }
        }
    }

    // pyproject.toml is only a pytest signal if it actually mentions pytest.
    let pyproject = repo_path.join("pyproject.toml");
    if let Ok(content) = std::fs::read_to_string(&pyproject) {
        if content.contains("[tool.pytest") || content.contains("pytest") {
            return Framework::Pytest;
        }
    }

    if let Some(fw) = detect_via_package_json(repo_path) {
        return fw;
    }

    if has_matching_file(repo_path, is_python_test_file) {
        if let Some(req_file) = requirements_file_mentioning_pytest(repo_path) {
            debug!(file = %req_file, "pytest listed in requirements file, deciding signal for framework detection");
        }
        return Framework::Pytest;
    }

    if has_matching_file(repo_path, is_js_test_file) {
        return Framework::Jest;
    }

    if has_matching_file(repo_path, |name| name.ends_with("_test.go")) {
        return Framework::GoTest;
    }

    Framework::Pytest
}

fn detect_via_package_json(repo_path: &Path) -> Option<Framework> {
    let raw = std::fs::read_to_string(repo_path.join("package.json")).ok()?;
    let pkg: Value = serde_json::from_str(&raw).ok()?;
    let mut all_deps = serde_json::Map::new();
    if let Some(Value::Object(deps)) = pkg.get("dependencies") {
        all_deps.extend(deps.clone());
    }
    if let Some(Value::Object(dev_deps)) = pkg.get("devDependencies") {
        all_deps.extend(dev_deps.clone());
    }
    for (framework, dep_name) in [
        (Framework::Jest, "jest"),
        (Framework::Mocha, "mocha"),
        (Framework::Vitest, "vitest"),
    ] {
        if all_deps.contains_key(dep_name) {
            return Some(framework);
        }
    }
    None
}

/// Root-level `requirements*.txt` file that mentions `pytest`, if any.
/// Purely informational here — `pytest` is already the default for any
/// Python project with test files, so this only names the signal that
/// confirmed the choice.
fn requirements_file_mentioning_pytest(repo_path: &Path) -> Option<String> {
    let entries = std::fs::read_dir(repo_path).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if name.starts_with("requirements") && name.ends_with(".txt") {
            if let Ok(content) = std::fs::read_to_string(&path) {
                if content.to_lowercase().contains("pytest") {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

fn is_python_test_file(name: &str) -> bool {
    name.starts_with("test_") && name.ends_with(".py") || name.ends_with("_test.py")
}

fn is_js_test_file(name: &str) -> bool {
    for ext in [".js", ".jsx", ".ts", ".tsx"] {
        if name.ends_with(&format!(".test{ext}")) || name.ends_with(&format!(".spec{ext}")) {
            return true;
        }
    }
    false
}

fn has_matching_file(root: &Path, predicate: impl Fn(&str) -> bool) -> bool {
    walk(root, &mut |path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(&predicate)
    })
}

fn walk(dir: &Path, found: &mut impl FnMut(&Path) -> bool) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if SKIP_DIRS.contains(&name) {
                    continue;
                }
            }
            if walk(&path, found) {
                return true;
            }
        } else if found(&path) {
            return true;
        }
    }
    false
}

/// Discover every test file under `repo_path` for `framework`, relative
/// to the repo root, sorted and deduplicated.
#[must_use]
pub fn discover_tests(repo_path: &Path, framework: Framework) -> Vec<String> {
    let predicate: Box<dyn Fn(&str) -> bool> = match framework {
        Framework::Pytest | Framework::Unittest => Box::new(is_python_test_file),
        Framework::Jest | Framework::Mocha | Framework::Vitest => Box::new(is_js_test_file),
        Framework::GoTest => Box::new(|name: &str| name.ends_with("_test.go")),
        Framework::CargoTest => Box::new(|name: &str| name.ends_with(".rs")),
    };

    let mut found = Vec::new();
    collect(repo_path, repo_path, &predicate, &mut found);
    found.sort();
    found.dedup();
    found
}

fn collect(root: &Path, dir: &Path, predicate: &dyn Fn(&str) -> bool, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if SKIP_DIRS.contains(&name) {
                    continue;
                }
            }
            collect(root, &path, predicate, out);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if predicate(name) {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().into_owned());
                }
            }
        }
    }
}

/// Build the test-run command for `framework`.
///
/// For JS frameworks, prefers the project's `package.json` `scripts.test`
/// entry (split at `&&`/`||`), appending `--watchAll=false` for CRA-style
/// runners and prefixing `npx` when the first token isn't a known local
/// invoker. Everything else uses a fixed, non-interactive command table.
#[must_use]
pub fn get_test_command(framework: Framework, repo_path: &Path) -> Vec<String> {
    if framework.is_js() {
        if let Some(cmd) = project_test_script(repo_path) {
            return cmd;
        }
    }

    fixed_command(framework)
}

fn project_test_script(repo_path: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(repo_path.join("package.json")).ok()?;
    let pkg: Value = serde_json::from_str(&raw).ok()?;
    let test_script = pkg.get("scripts")?.get("test")?.as_str()?;
    if test_script.trim().is_empty() {
        return None;
    }

    let first_clause = test_script.split("&&").next().unwrap_or(test_script);
    let first_clause = first_clause.split("||").next().unwrap_or(first_clause).trim();

    let mut parts: Vec<String> = first_clause.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return None;
    }

    let is_cra_style = ["react-scripts", "craco", "react-app-rewired"]
        .iter()
        .any(|runner| first_clause.contains(runner));
    if is_cra_style && !first_clause.contains("--watchAll=false") {
        parts.push("--watchAll=false".to_string());
    }

    if !matches!(parts[0].as_str(), "npx" | "npm" | "node") {
        parts.insert(0, "npx".to_string());
    }

    Some(parts)
}

const SETUP_TESTS_CONTENTS: &str =
    "// jest-dom adds custom jest matchers for asserting on DOM nodes.\n\
     // allows you to do things like:\n\
     // expect(element).toHaveTextContent(/react/i)\n\
     // learn more: https://github.com/testing-library/jest-dom\n\
     import '@testing-library/jest-dom';\n";

/// Auto-create `src/setupTests.js` for a CRA-style project that depends
/// on `@testing-library/jest-dom` (and has it installed) but is missing
/// a setup file, which otherwise fails every test with `toBeInTheDocument
/// is not a function`. Returns the created path, or `None` if the
/// project doesn't need it or already has one.
pub fn ensure_cra_setup_tests(repo_path: &Path) -> Option<PathBuf> {
    let raw = std::fs::read_to_string(repo_path.join("package.json")).ok()?;
    let pkg: Value = serde_json::from_str(&raw).ok()?;
    let mut all_deps = serde_json::Map::new();
    if let Some(Value::Object(deps)) = pkg.get("dependencies") {
        all_deps.extend(deps.clone());
    }
    if let Some(Value::Object(dev_deps)) = pkg.get("devDependencies") {
        all_deps.extend(dev_deps.clone());
    }
    if !all_deps.contains_key("@testing-library/jest-dom") {
        return None;
    }

    if !repo_path.join("node_modules/@testing-library/jest-dom").exists() {
        debug!("skipping setupTests.js — @testing-library/jest-dom not in node_modules");
        return None;
    }

    if repo_path.join("src/setupTests.js").exists() || repo_path.join("src/setupTests.ts").exists() {
        return None;
    }

    let setup_path = repo_path.join("src/setupTests.js");
    if let Some(parent) = setup_path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    std::fs::write(&setup_path, SETUP_TESTS_CONTENTS).ok()?;
    Some(setup_path)
}

fn fixed_command(framework: Framework) -> Vec<String> {
    let parts: &[&str] = match framework {
        Framework::Pytest => &["python", "-m", "pytest", "-v", "--tb=short", "-q"],
        Framework::Unittest => &["python", "-m", "unittest", "discover", "-v"],
        Framework::Jest => &["npx", "jest", "--no-coverage", "--forceExit", "--detectOpenHandles"],
        Framework::Mocha => &["npx", "mocha", "--recursive"],
        Framework::Vitest => &["npx", "vitest", "run", "--reporter=verbose"],
        Framework::GoTest => &["go", "test", "./...", "-v"],
        Framework::CargoTest => &["cargo", "test", "--", "--nocapture"],
    };
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// `true` if `file` looks like a test file by suffix (used by the
/// Reasoner Adapter to decide whether to include a sibling source file).
#[must_use]
pub fn looks_like_test_file(file: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        ".test.js", ".test.jsx", ".test.ts", ".test.tsx",
        ".spec.js", ".spec.jsx", ".spec.ts", ".spec.tsx",
        "_test.py", "_test.go",
    ];
    SUFFIXES.iter().any(|s| file.ends_with(s))
}

/// Map a test file to its candidate sibling source files:
/// strip the test suffix and try each source extension.
#[must_use]
pub fn sibling_source_candidates(test_file: &str) -> Vec<PathBuf> {
    const SUFFIXES: &[&str] = &[
        ".test.js", ".test.jsx", ".test.ts", ".test.tsx",
        ".spec.js", ".spec.jsx", ".spec.ts", ".spec.tsx",
        "_test.py", "_test.go",
    ];
    const SOURCE_EXTS: &[&str] = &[".js", ".jsx", ".ts", ".tsx", ".py", ".go"];

    for suffix in SUFFIXES {
        if let Some(base) = test_file.strip_suffix(suffix) {
            return SOURCE_EXTS.iter().map(|ext| PathBuf::from(format!("{base}{ext}"))).collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_repo() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn detects_pytest_via_config_file() {
        let dir = tmp_repo();
        fs::write(dir.path().join("pytest.ini"), "[pytest]").unwrap();
        assert_eq!(detect_test_framework(dir.path()), Framework::Pytest);
    }

    #[test]
    fn detects_jest_via_package_json_dependency() {
        let dir = tmp_repo();
        fs::write(dir.path().join("package.json"), r#"{"devDependencies": {"jest": "^29.0.0"}}"#).unwrap();
        assert_eq!(detect_test_framework(dir.path()), Framework::Jest);
    }

    #[test]
    fn pyproject_without_pytest_mention_is_not_a_signal() {
        let dir = tmp_repo();
        fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\nname = \"x\"").unwrap();
        assert_eq!(detect_test_framework(dir.path()), Framework::Pytest);
    }

    #[test]
    fn requirements_txt_mentioning_pytest_is_detected() {
        let dir = tmp_repo();
        fs::write(dir.path().join("test_thing.py"), "def test_x(): pass").unwrap();
        fs::write(dir.path().join("requirements.txt"), "pytest==7.4.0\nrequests\n").unwrap();
        assert_eq!(
            requirements_file_mentioning_pytest(dir.path()),
            Some("requirements.txt".to_string())
        );
        assert_eq!(detect_test_framework(dir.path()), Framework::Pytest);
    }

    #[test]
    fn requirements_txt_without_pytest_mention_reports_none() {
        let dir = tmp_repo();
        fs::write(dir.path().join("requirements.txt"), "requests\nflask\n").unwrap();
        assert_eq!(requirements_file_mentioning_pytest(dir.path()), None);
    }

    #[test]
    fn falls_back_to_pytest_on_empty_repo() {
        let dir = tmp_repo();
        assert_eq!(detect_test_framework(dir.path()), Framework::Pytest);
    }

    #[test]
    fn discover_tests_skips_node_modules() {
        let dir = tmp_repo();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/App.test.js"), "").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/App.test.js"), "").unwrap();
        let found = discover_tests(dir.path(), Framework::Jest);
        assert_eq!(found, vec!["src/App.test.js".to_string()]);
    }

    #[test]
    fn test_command_prefers_package_json_script() {
        let dir = tmp_repo();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "react-scripts test --watchAll=false"}}"#,
        )
        .unwrap();
        let cmd = get_test_command(Framework::Jest, dir.path());
        assert_eq!(cmd, vec!["npx", "react-scripts", "test", "--watchAll=false"]);
    }

    #[test]
    fn test_command_appends_watch_all_false_for_cra() {
        let dir = tmp_repo();
        fs::write(dir.path().join("package.json"), r#"{"scripts": {"test": "react-scripts test"}}"#).unwrap();
        let cmd = get_test_command(Framework::Jest, dir.path());
        assert!(cmd.contains(&"--watchAll=false".to_string()));
    }

    #[test]
    fn test_command_splits_at_shell_operators() {
        let dir = tmp_repo();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest && echo done"}}"#,
        )
        .unwrap();
        let cmd = get_test_command(Framework::Jest, dir.path());
        assert_eq!(cmd, vec!["npx", "jest"]);
    }

    #[test]
    fn test_command_falls_back_to_fixed_table() {
        let dir = tmp_repo();
        let cmd = get_test_command(Framework::Pytest, dir.path());
        assert_eq!(cmd, vec!["python", "-m", "pytest", "-v", "--tb=short", "-q"]);
    }

    #[test]
    fn sibling_source_candidates_strip_test_suffix() {
        let candidates = sibling_source_candidates("src/App.test.js");
        assert!(candidates.contains(&PathBuf::from("src/App.js")));
    }

    #[test]
    fn ensure_cra_setup_tests_creates_file_when_dependency_installed() {
        let dir = tmp_repo();
        fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies": {"@testing-library/jest-dom": "^6.0.0"}}"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("node_modules/@testing-library/jest-dom")).unwrap();

        let created = ensure_cra_setup_tests(dir.path());
        assert_eq!(created, Some(dir.path().join("src/setupTests.js")));
        let content = fs::read_to_string(dir.path().join("src/setupTests.js")).unwrap();
        assert!(content.contains("@testing-library/jest-dom"));
    }

    #[test]
    fn ensure_cra_setup_tests_skips_when_dependency_not_installed() {
        let dir = tmp_repo();
        fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies": {"@testing-library/jest-dom": "^6.0.0"}}"#,
        )
        .unwrap();
        // No node_modules/@testing-library/jest-dom present.
        assert_eq!(ensure_cra_setup_tests(dir.path()), None);
    }

    #[test]
    fn ensure_cra_setup_tests_does_not_overwrite_existing_setup_file() {
        let dir = tmp_repo();
        fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies": {"@testing-library/jest-dom": "^6.0.0"}}"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("node_modules/@testing-library/jest-dom")).unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/setupTests.ts"), "// already here\n").unwrap();

        assert_eq!(ensure_cra_setup_tests(dir.path()), None);
    }

    #[test]
    fn ensure_cra_setup_tests_skips_without_jest_dom_dependency() {
        let dir = tmp_repo();
        fs::write(dir.path().join("package.json"), r#"{"devDependencies": {"jest": "^29.0.0"}}"#).unwrap();
        assert_eq!(ensure_cra_setup_tests(dir.path()), None);
    }

    #[test]
    fn looks_like_test_file_matches_known_suffixes() {
        assert!(looks_like_test_file("src/App.test.tsx"));
        assert!(!looks_like_test_file("src/App.tsx"));
    }
}
