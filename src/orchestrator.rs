//! Pipeline Orchestrator: the state machine gluing every other component
//! together. `Phase` is an exhaustive tagged enum rather than an untyped
//! map; every transition is driven by a match over the current phase,
//! folding in the outcome of that phase's own work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use crate::config::Config;
use crate::credential::CredentialBroker;
use crate::errors::OrchestratorError;
use crate::events::EventSink;
use crate::framework_probe::{self, Framework};
use crate::git_driver::{self, GitDriver};
use crate::patch_applier;
use crate::reasoner::{self, ReasonerClient};
use crate::results::{self, ResultsDocument};
use crate::sandbox::{base_image, SandboxOutput, SandboxRunner};
use crate::types::{Failure, Fix, FixStatus, RunStatus, TimelineEvent};
use crate::failure_parser;

/// The tagged state of a run's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Cloning,
    DetectFramework,
    InstallDeps,
    RunTests,
    AnalyzeFailures,
    GenerateFix,
    ApplyFix,
    Verify,
    Publish,
    GenerateResults,
    End,
}

/// Outcome of `ANALYZE_FAILURES`, per the `has_failures` conditional
/// edge.
enum AnalyzeOutcome {
    AllPassed,
    HasFailures,
}

/// Outcome of `VERIFY`, per the `should_retry` conditional edge.
enum VerifyOutcome {
    AllPassed,
    RetryBoundExceededAnyApplied,
    RetryBoundExceededNoneApplied,
    Retry,
}

/// Inputs for one healing run, supplied by the HTTP surface or the CLI.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub repository_url: String,
    pub team_name: String,
    pub leader_name: String,
}

/// Derive `TEAM_LEADER_AI_Fix`: uppercase, collapse whitespace, replace
/// any run of non-alphanumeric characters with `_`.
#[must_use]
pub fn make_branch_name(team: &str, leader: &str) -> String {
    format!("{}_{}_AI_Fix", sanitize_branch_component(team), sanitize_branch_component(leader))
}

fn sanitize_branch_component(s: &str) -> String {
    static NON_ALNUM: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| Regex::new(r"[^A-Z0-9]+").unwrap());
    let upper = s.trim().to_uppercase();
    NON_ALNUM.replace_all(&upper, "_").trim_matches('_').to_string()
}

/// Accumulated state for a single run, mutated only by the Orchestrator
/// that owns it. Each run gets its own instance; no run shares mutable
/// state with another other than the Credential Broker's caches.
struct RunState {
    request: RunRequest,
    branch_name: String,
    repo_path: PathBuf,
    framework: Framework,
    test_output: String,
    all_passed: bool,
    failures: Vec<Failure>,
    fixes: Vec<Fix>,
    commit_count: u32,
    iteration: u32,
    timeline: Vec<TimelineEvent>,
    started_at: Instant,
}

impl RunState {
    fn record(&mut self, phase: &str, details: serde_json::Value) {
        self.timeline.push(TimelineEvent { phase: phase.to_string(), timestamp: chrono::Utc::now(), details });
    }
}

/// Drives one healing run end-to-end, emitting events through an
/// [`EventSink`] and producing a [`ResultsDocument`] even when a
/// terminal error cuts the run short.
pub struct Orchestrator {
    config: Config,
    git: GitDriver,
    events: Arc<dyn EventSink>,
    reasoner: Arc<dyn ReasonerClient>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Config,
        credential: Arc<CredentialBroker>,
        events: Arc<dyn EventSink>,
        reasoner: Arc<dyn ReasonerClient>,
    ) -> Self {
        let git = GitDriver::new(credential, config.github_token.clone());
        Self { config, git, events, reasoner }
    }

    pub async fn run(&self, request: RunRequest) -> ResultsDocument {
        let branch_name = make_branch_name(&request.team_name, &request.leader_name);
        let run_id = request.run_id.clone();
        let repository_url = request.repository_url.clone();

        let mut state = RunState {
            request,
            branch_name: branch_name.clone(),
            repo_path: PathBuf::new(),
            framework: Framework::Pytest,
            test_output: String::new(),
            all_passed: false,
            failures: Vec::new(),
            fixes: Vec::new(),
            commit_count: 0,
            iteration: 1,
            timeline: Vec::new(),
            started_at: Instant::now(),
        };

        let mut sandbox = SandboxRunner::new();
        let mut phase = Phase::Start;

        let final_status = loop {
            phase = match phase {
                Phase::Start => Phase::Cloning,

                Phase::Cloning => match self.do_clone(&mut state).await {
                    Ok(()) => Phase::DetectFramework,
                    Err(e) => break self.terminal_failure(&mut state, "CLONING", &e).await,
                },

                Phase::DetectFramework => match self.do_detect_framework(&mut state).await {
                    Ok(()) => Phase::InstallDeps,
                    Err(e) => break self.terminal_failure(&mut state, "FRAMEWORK_DETECTED", &e).await,
                },

                Phase::InstallDeps => {
                    self.do_install_deps(&mut state, &mut sandbox).await;
                    Phase::RunTests
                }

                Phase::RunTests => {
                    self.do_run_tests(&mut state, &mut sandbox).await;
                    Phase::AnalyzeFailures
                }

                Phase::AnalyzeFailures => match self.do_analyze_failures(&mut state).await {
                    AnalyzeOutcome::AllPassed => Phase::GenerateResults,
                    AnalyzeOutcome::HasFailures => Phase::GenerateFix,
                },

                Phase::GenerateFix => {
                    self.do_generate_fix(&mut state).await;
                    Phase::ApplyFix
                }

                Phase::ApplyFix => {
                    self.do_apply_fix(&mut state).await;
                    Phase::Verify
                }

                Phase::Verify => match self.do_verify(&mut state, &mut sandbox).await {
                    VerifyOutcome::AllPassed | VerifyOutcome::RetryBoundExceededAnyApplied => Phase::Publish,
                    VerifyOutcome::RetryBoundExceededNoneApplied => Phase::GenerateResults,
                    VerifyOutcome::Retry => Phase::AnalyzeFailures,
                },

                Phase::Publish => match self.do_publish(&mut state).await {
                    Ok(()) => Phase::GenerateResults,
                    Err(e) => break self.terminal_failure(&mut state, "PUBLISH", &e).await,
                },

                Phase::GenerateResults => break if state.all_passed { RunStatus::Passed } else { RunStatus::Failed },

                Phase::End => unreachable!("End is never entered via the match; the loop exits via `break`"),
            };
        };

        self.build_and_save_results(&mut state, &repository_url, final_status).await
    }

    async fn terminal_failure(&self, state: &mut RunState, phase: &str, error: &OrchestratorError) -> RunStatus {
        let message = crate::errors::clip(&error.to_string(), 500);
        warn!(run_id = %state.request.run_id, phase, error = %message, "run terminated");
        state.record(phase, serde_json::json!({"error": message}));
        self.events.error(&state.request.run_id, &message).await;
        RunStatus::Failed
    }

    async fn do_clone(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "cloning", "running", serde_json::Value::Null).await;
        self.events.log(&run_id, "System", "INFO", &format!("Cloning {}...", state.request.repository_url)).await;

        let dest = git_driver::working_dir(std::path::Path::new(&self.config.clone_dir), &run_id);

        self.git
            .clone(&state.request.repository_url, &dest, None, 0, Duration::from_secs(self.config.clone_timeout_secs))
            .await?;

        state.repo_path = dest;
        state.record("CLONING", serde_json::json!({"url": state.request.repository_url}));
        self.events.step_update(&run_id, "cloning", "completed", serde_json::Value::Null).await;
        self.events.log(&run_id, "System", "INFO", "Repository cloned successfully").await;
        Ok(())
    }

    async fn do_detect_framework(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "detecting_framework", "running", serde_json::Value::Null).await;

        if !state.repo_path.exists() {
            return Err(OrchestratorError::EmptyRepository);
        }

        let framework = framework_probe::detect_test_framework(&state.repo_path);
        let tests = framework_probe::discover_tests(&state.repo_path, framework);
        state.framework = framework;

        self.events
            .log(&run_id, "System", "INFO", &format!("Detected framework: {framework} ({} test files)", tests.len()))
            .await;
        self.events
            .step_update(
                &run_id,
                "detecting_framework",
                "completed",
                serde_json::json!({"test_framework": framework.as_str(), "test_count": tests.len()}),
            )
            .await;
        state.record("FRAMEWORK_DETECTED", serde_json::json!({"framework": framework.as_str(), "tests": tests.len()}));
        Ok(())
    }

    async fn do_install_deps(&self, state: &mut RunState, sandbox: &mut SandboxRunner) {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "installing_deps", "running", serde_json::Value::Null).await;
        self.events.log(&run_id, "System", "INFO", &format!("Installing dependencies for {}...", state.framework)).await;

        let Some(cmd) = install_command(state.framework, &state.repo_path) else {
            self.events.log(&run_id, "System", "INFO", "No dependency manifest found — skipping install").await;
            self.events.step_update(&run_id, "installing_deps", "completed", serde_json::json!({"success": true})).await;
            state.record("DEPS_INSTALLED", serde_json::json!({"framework": state.framework.as_str(), "success": true}));
            return;
        };

        let image = base_image(state.framework, &self.config.default_sandbox_image);
        let timeout = Duration::from_secs(self.config.install_timeout_secs);
        let success = match sandbox.run(&state.repo_path, image, &cmd, &HashMap::new(), timeout).await {
            Ok(output) => {
                if !output.passed() {
                    self.events
                        .log(&run_id, "System", "WARN", &format!("Dependency install exited {}: {}", output.exit_code, crate::errors::clip(&output.stderr, 300)))
                        .await;
                }
                output.passed()
            }
            Err(e) => {
                self.events.log(&run_id, "System", "WARN", &format!("Install failed: {e}")).await;
                false
            }
        };

        self.maybe_fix_cra_setup_tests(state).await;

        self.events.step_update(&run_id, "installing_deps", "completed", serde_json::json!({"success": success})).await;
        state.record("DEPS_INSTALLED", serde_json::json!({"framework": state.framework.as_str(), "success": success}));
    }

    /// For JS frameworks, auto-creates `src/setupTests.js` when the
    /// project depends on `@testing-library/jest-dom` but has no setup
    /// file, otherwise every test fails with `toBeInTheDocument is not a
    /// function` instead of surfacing a real failure.
    async fn maybe_fix_cra_setup_tests(&self, state: &RunState) {
        if !matches!(state.framework, Framework::Jest | Framework::Mocha | Framework::Vitest) {
            return;
        }
        if let Some(path) = framework_probe::ensure_cra_setup_tests(&state.repo_path) {
            self.events
                .log(&state.request.run_id, "System", "INFO", &format!("Auto-created {}", path.display()))
                .await;
        }
    }

    async fn do_run_tests(&self, state: &mut RunState, sandbox: &mut SandboxRunner) {
        let run_id = state.request.run_id.clone();
        self.events
            .step_update(&run_id, "running_tests", "running", serde_json::json!({"iteration": state.iteration}))
            .await;
        self.events.log(&run_id, "Verifier", "INFO", &format!("Running tests (iteration {})...", state.iteration)).await;

        self.maybe_fix_cra_setup_tests(state).await;
        let output = self.execute_tests(state, sandbox).await;
        state.all_passed = output.passed();
        state.test_output = output.combined();

        self.events.step_update(&run_id, "running_tests", "completed", serde_json::json!({"passed": state.all_passed})).await;
        state.record("TESTS_RUN", serde_json::json!({"iteration": state.iteration, "passed": state.all_passed}));
    }

    async fn execute_tests(&self, state: &RunState, sandbox: &mut SandboxRunner) -> SandboxOutput {
        let cmd = framework_probe::get_test_command(state.framework, &state.repo_path);
        let image = base_image(state.framework, &self.config.default_sandbox_image);
        let timeout = Duration::from_secs(self.config.sandbox_timeout_secs);

        let mut env = HashMap::new();
        if matches!(state.framework, Framework::Jest | Framework::Mocha | Framework::Vitest) {
            env.insert("CI".to_string(), "true".to_string());
        }

        match sandbox.run(&state.repo_path, image, &cmd, &env, timeout).await {
            Ok(output) => output,
            Err(e) => SandboxOutput { stdout: String::new(), stderr: e.to_string(), exit_code: -1 },
        }
    }

    async fn do_analyze_failures(&self, state: &mut RunState) -> AnalyzeOutcome {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "analyzing_failures", "running", serde_json::Value::Null).await;
        self.events.log(&run_id, "Detective", "INFO", "Analyzing test failures...").await;

        if state.all_passed {
            self.events.step_update(&run_id, "analyzing_failures", "completed", serde_json::json!({"failure_count": 0})).await;
            state.record("FAILURES_ANALYZED", serde_json::json!({"count": 0}));
            return AnalyzeOutcome::AllPassed;
        }

        // all_passed is false here (handled above), so the exit code is always non-zero.
        let failures = failure_parser::parse_failures(&state.test_output, &state.repo_path, 1);

        for failure in &failures {
            self.events.failure(&run_id, failure).await;
        }

        self.events
            .step_update(&run_id, "analyzing_failures", "completed", serde_json::json!({"failure_count": failures.len()}))
            .await;
        self.events.log(&run_id, "Detective", "INFO", &format!("Found {} failure(s)", failures.len())).await;
        state.record("FAILURES_ANALYZED", serde_json::json!({"count": failures.len()}));

        state.failures = failures;
        AnalyzeOutcome::HasFailures
    }

    async fn do_generate_fix(&self, state: &mut RunState) {
        let run_id = state.request.run_id.clone();
        if state.failures.is_empty() {
            return;
        }

        self.events.step_update(&run_id, "generating_fix", "running", serde_json::Value::Null).await;
        self.events.log(&run_id, "Reasoner", "INFO", "Generating fixes with LLM...").await;

        let delay = Duration::from_secs(self.config.reasoner_delay_secs);
        for (idx, failure) in state.failures.clone().iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(delay).await;
            }

            self.events
                .log(&run_id, "Reasoner", "INFO", &format!("Fixing {} in {} line {}", failure.bug_kind, failure.file, failure.line))
                .await;

            let fix = reasoner::generate_fix(self.reasoner.as_ref(), failure, &state.repo_path).await;
            self.events.fix(&run_id, &fix, state.iteration).await;
            state.fixes.push(fix);
        }

        self.events
            .step_update(&run_id, "generating_fix", "completed", serde_json::json!({"fixes": state.fixes.len()}))
            .await;
        state.record("FIXES_GENERATED", serde_json::json!({"count": state.fixes.len()}));
    }

    async fn do_apply_fix(&self, state: &mut RunState) {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "applying_fix", "running", serde_json::Value::Null).await;

        for fix in &mut state.fixes {
            if fix.status != FixStatus::Generated || fix.diff.is_empty() {
                continue;
            }

            match patch_applier::apply(&state.repo_path, &fix.diff, &fix.file).await {
                Ok(()) => {
                    fix.status = FixStatus::Applied;
                    self.events.log(&run_id, "System", "INFO", &format!("Patch applied to {}", fix.file)).await;
                }
                Err(e) => {
                    fix.status = FixStatus::ApplyFailed;
                    self.events.log(&run_id, "System", "WARN", &format!("Patch failed for {} ({e})", fix.file)).await;
                }
            }
        }

        self.events.step_update(&run_id, "applying_fix", "completed", serde_json::Value::Null).await;
    }

    async fn do_verify(&self, state: &mut RunState, sandbox: &mut SandboxRunner) -> VerifyOutcome {
        let run_id = state.request.run_id.clone();
        self.events
            .step_update(&run_id, "verifying", "running", serde_json::json!({"iteration": state.iteration}))
            .await;
        self.events.log(&run_id, "Verifier", "INFO", &format!("Verifying fixes (iteration {})...", state.iteration)).await;

        let output = self.execute_tests(state, sandbox).await;
        state.all_passed = output.passed();
        state.test_output = output.combined();

        let remaining = if state.all_passed { 0 } else { state.failures.len() };
        let fixes_applied = state.fixes.iter().filter(|f| matches!(f.status, FixStatus::Applied | FixStatus::Fixed)).count();

        self.events
            .iteration(&run_id, state.iteration, self.config.max_retries, state.all_passed, remaining, fixes_applied)
            .await;
        state.record("VERIFICATION", serde_json::json!({"iteration": state.iteration, "passed": state.all_passed}));

        if state.all_passed {
            for fix in &mut state.fixes {
                if fix.status == FixStatus::Applied {
                    fix.status = FixStatus::Fixed;
                }
            }
        }

        state.iteration += 1;

        if state.all_passed {
            return VerifyOutcome::AllPassed;
        }
        if state.iteration > self.config.max_retries {
            let any_applied = state.fixes.iter().any(|f| matches!(f.status, FixStatus::Applied | FixStatus::Fixed));
            return if any_applied {
                VerifyOutcome::RetryBoundExceededAnyApplied
            } else {
                VerifyOutcome::RetryBoundExceededNoneApplied
            };
        }
        VerifyOutcome::Retry
    }

    async fn do_publish(&self, state: &mut RunState) -> Result<(), OrchestratorError> {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "publishing", "running", serde_json::Value::Null).await;
        self.events.log(&run_id, "Publisher", "INFO", "Pushing fixes to GitHub...").await;

        let fixed_files: Vec<String> = state
            .fixes
            .iter()
            .filter(|f| f.is_committable())
            .map(|f| f.file.clone())
            .collect();

        if fixed_files.is_empty() {
            warn!(run_id = %run_id, "no fixes to commit, skipping publish");
            self.events.log(&run_id, "Publisher", "WARN", "No fixes to commit — skipping publish").await;
            self.events.step_update(&run_id, "publishing", "completed", serde_json::json!({"skipped": true})).await;
            state.record("PUBLISH_SKIPPED", serde_json::json!({"reason": "no fixes to commit"}));
            return Ok(());
        }

        git_driver::checkout(&state.repo_path, &state.branch_name, true)
            .await
            .map_err(|e| OrchestratorError::Publish(e.to_string()))?;

        let commit_message = format!(
            "[NeverDown-AI] Fix {} issue(s) in {}",
            fixed_files.len(),
            fixed_files.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        );

        let committed = git_driver::commit(&state.repo_path, &commit_message)
            .await
            .map_err(|e| OrchestratorError::Publish(e.to_string()))?;

        if !committed {
            self.events.log(&run_id, "Publisher", "WARN", "No staged changes — skipping commit").await;
            self.events.step_update(&run_id, "publishing", "completed", serde_json::json!({"skipped": true})).await;
            return Ok(());
        }
        state.commit_count += 1;

        self.git
            .push(&state.repo_path, &state.request.repository_url, &state.branch_name)
            .await
            .map_err(|e| OrchestratorError::Publish(e.to_string()))?;

        info!(run_id = %run_id, branch = %state.branch_name, "pushed branch to GitHub");
        self.events.log(&run_id, "Publisher", "INFO", &format!("Pushed branch {}", state.branch_name)).await;
        self.events
            .step_update(&run_id, "publishing", "completed", serde_json::json!({"branch_name": state.branch_name}))
            .await;
        state.record("PUBLISHED", serde_json::json!({"branch": state.branch_name}));
        Ok(())
    }

    async fn build_and_save_results(&self, state: &mut RunState, repository_url: &str, final_status: RunStatus) -> ResultsDocument {
        let run_id = state.request.run_id.clone();
        self.events.step_update(&run_id, "generating_results", "running", serde_json::Value::Null).await;

        let total_time = state.started_at.elapsed().as_secs_f64();
        let iterations_used = state.iteration.saturating_sub(1);

        let doc = results::build(
            repository_url.to_string(),
            state.request.team_name.clone(),
            state.request.leader_name.clone(),
            state.branch_name.clone(),
            state.failures.len() as u32,
            iterations_used,
            self.config.max_retries,
            final_status,
            total_time,
            state.commit_count,
            state.fixes.clone(),
            state.timeline.clone(),
        );

        let results_dir = std::path::Path::new(&self.config.results_dir);
        let repo_path = if state.repo_path.exists() { Some(state.repo_path.as_path()) } else { None };
        if let Err(e) = results::save(&doc, results_dir, &run_id, repo_path) {
            warn!(run_id = %run_id, error = %e, "failed to persist results.json");
        }

        let doc_value = serde_json::to_value(&doc).unwrap_or(serde_json::Value::Null);
        self.events.result(&run_id, &doc_value).await;
        self.events
            .step_update(&run_id, if final_status == RunStatus::Passed { "completed" } else { "failed" }, "completed", serde_json::Value::Null)
            .await;

        git_driver::cleanup(&state.repo_path).await;
        doc
    }
}

/// Framework-keyed install command, `None` when the relevant manifest is
/// absent.
fn install_command(framework: Framework, repo_path: &std::path::Path) -> Option<Vec<String>> {
    match framework {
        Framework::Pytest | Framework::Unittest => {
            if repo_path.join("requirements.txt").is_file() {
                Some(vec!["pip".into(), "install".into(), "-r".into(), "requirements.txt".into()])
            } else if repo_path.join("pyproject.toml").is_file() {
                Some(vec!["pip".into(), "install".into(), "-e".into(), ".".into()])
            } else {
                None
            }
        }
        Framework::Jest | Framework::Mocha | Framework::Vitest => {
            repo_path.join("package.json").is_file().then(|| vec!["npm".into(), "install".into(), "--legacy-peer-deps".into()])
        }
        Framework::GoTest => {
            repo_path.join("go.mod").is_file().then(|| vec!["go".into(), "mod".into(), "download".into()])
        }
        Framework::CargoTest => {
            repo_path.join("Cargo.toml").is_file().then(|| vec!["cargo".into(), "fetch".into()])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_uppercases_and_sanitizes() {
        assert_eq!(make_branch_name("team x", "alice jones"), "TEAM_X_ALICE_JONES_AI_Fix");
    }

    #[test]
    fn branch_name_collapses_non_alphanumeric_runs() {
        assert_eq!(make_branch_name("team--x!!", "bob"), "TEAM_X_BOB_AI_Fix");
    }

    #[test]
    fn branch_name_contains_only_allowed_characters_before_suffix() {
        let name = make_branch_name("  weird@@chars##here  ", "leader");
        let prefix = name.strip_suffix("_LEADER_AI_Fix").unwrap();
        assert!(prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn install_command_skips_python_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(install_command(Framework::Pytest, dir.path()).is_none());
    }

    #[test]
    fn install_command_prefers_requirements_over_pyproject() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "pytest\n").unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\n").unwrap();
        let cmd = install_command(Framework::Pytest, dir.path()).unwrap();
        assert_eq!(cmd, vec!["pip", "install", "-r", "requirements.txt"]);
    }
}
