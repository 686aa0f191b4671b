//! Sandbox Runner: executes a command against a repository directory in a
//! framework-appropriate container image, with a process-level fallback
//! when the container runtime is unavailable.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::SandboxError;
use crate::framework_probe::Framework;

/// Framework → container base image.
#[must_use]
pub fn base_image(framework: Framework, default_image: &str) -> &str {
    match framework {
        Framework::Pytest | Framework::Unittest => "python:3.11-slim",
        Framework::Jest | Framework::Mocha | Framework::Vitest => "node:18-slim",
        Framework::GoTest => "golang:1.21-bookworm",
        Framework::CargoTest => "rust:1.74-slim-bookworm",
        #[allow(unreachable_patterns)]
        _ => default_image,
    }
}

/// Result of a sandboxed command execution.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SandboxOutput {
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes commands either inside a Docker container or, when the
/// container runtime is unavailable, directly on the host.
pub struct SandboxRunner {
    docker_checked: bool,
    docker_available: bool,
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            docker_checked: false,
            docker_available: false,
        }
    }

    /// Probe once whether the `docker` binary is usable, caching the
    /// result for subsequent calls on this runner.
    pub async fn check_docker_available(&mut self) -> bool {
        if self.docker_checked {
            return self.docker_available;
        }
        self.docker_checked = true;
        self.docker_available = Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        self.docker_available
    }

    /// Run `cmd` against `repo_path`, mounted read-write inside `image` if
    /// Docker is available, otherwise spawned directly against
    /// `repo_path` as the working directory.
    pub async fn run(
        &mut self,
        repo_path: &Path,
        image: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        if cmd.is_empty() {
            return Err(SandboxError::Spawn("empty command".to_string()));
        }

        if self.check_docker_available().await {
            self.run_in_container(repo_path, image, cmd, env, timeout).await
        } else {
            warn!("docker unavailable, falling back to local process execution");
            run_local(repo_path, cmd, env, timeout).await
        }
    }

    async fn run_in_container(
        &self,
        repo_path: &Path,
        image: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let mount = format!("{}:/workspace", repo_path.display());
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            mount,
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(image.to_string());
        args.extend(cmd.iter().cloned());

        let child = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout(timeout.as_secs()))?
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Process-level fallback: run `cmd` directly against `repo_path`.
async fn run_local(
    repo_path: &Path,
    cmd: &[String],
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<SandboxOutput, SandboxError> {
    let mut command = Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .current_dir(repo_path)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| SandboxError::Timeout(timeout.as_secs()))?
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;

    info!(exit_code = output.status.code(), "local sandbox command finished");

    Ok(SandboxOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_image_maps_each_framework() {
        assert_eq!(base_image(Framework::Pytest, "ubuntu:22.04"), "python:3.11-slim");
        assert_eq!(base_image(Framework::Jest, "ubuntu:22.04"), "node:18-slim");
        assert_eq!(base_image(Framework::GoTest, "ubuntu:22.04"), "golang:1.21-bookworm");
        assert_eq!(base_image(Framework::CargoTest, "ubuntu:22.04"), "rust:1.74-slim-bookworm");
    }

    #[tokio::test]
    async fn run_local_captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo hi; exit 3".to_string()];
        let out = run_local(dir.path(), &cmd, &HashMap::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.contains("hi"));
        assert!(!out.passed());
    }

    #[tokio::test]
    async fn run_local_rejects_empty_command_upstream() {
        let mut runner = SandboxRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let err = runner
            .run(dir.path(), "ubuntu:22.04", &[], &HashMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)));
    }
}
