//! Process-wide configuration, loaded from environment variables.
//!
//! Mirrors the constants named throughout the design: retry bound, the
//! various subprocess timeouts, the reasoner rate-limit delay, GitHub App
//! JWT timing, and the installation-token safety margin.

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Directory results.json artifacts are written under.
    #[arg(long, env = "HEALER_RESULTS_DIR", default_value = "./results")]
    pub results_dir: String,

    /// Directory repositories are cloned into.
    #[arg(long, env = "HEALER_CLONE_DIR", default_value = "./clones")]
    pub clone_dir: String,

    /// Maximum analyze→fix→apply→verify iterations per run.
    #[arg(long, env = "HEALER_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Clone timeout, in seconds.
    #[arg(long, env = "HEALER_CLONE_TIMEOUT_SECS", default_value_t = 120)]
    pub clone_timeout_secs: u64,

    /// Dependency-install timeout, in seconds.
    #[arg(long, env = "HEALER_INSTALL_TIMEOUT_SECS", default_value_t = 300)]
    pub install_timeout_secs: u64,

    /// Test-run / verify timeout, in seconds.
    #[arg(long, env = "HEALER_SANDBOX_TIMEOUT_SECS", default_value_t = 300)]
    pub sandbox_timeout_secs: u64,

    /// Delay between consecutive reasoner calls within one iteration.
    #[arg(long, env = "HEALER_REASONER_DELAY_SECS", default_value_t = 13)]
    pub reasoner_delay_secs: u64,

    /// Override for the sandbox base image when a framework has no fixed
    /// mapping.
    #[arg(long, env = "HEALER_DEFAULT_SANDBOX_IMAGE", default_value = "ubuntu:22.04")]
    pub default_sandbox_image: String,

    /// GitHub API base URL, overridable for GitHub Enterprise.
    #[arg(long, env = "HEALER_GITHUB_API_URL", default_value = "https://api.github.com")]
    pub github_api_url: String,

    /// GitHub App id, if the App credential path is configured.
    #[arg(long, env = "HEALER_GITHUB_APP_ID")]
    pub github_app_id: Option<String>,

    /// GitHub App slug, used only to build the installation redirect URL.
    #[arg(long, env = "HEALER_GITHUB_APP_SLUG")]
    pub github_app_slug: Option<String>,

    /// GitHub App private key (PEM, RS256), read from the environment
    /// directly rather than a file path.
    #[arg(long, env = "HEALER_GITHUB_APP_PRIVATE_KEY")]
    pub github_app_private_key: Option<String>,

    /// Long-lived fallback token (PAT), used when no App installation is
    /// found for the target repository.
    #[arg(long, env = "HEALER_GITHUB_TOKEN")]
    pub github_token: Option<String>,

    /// Reasoner endpoint, if the concrete client is reached over HTTP.
    #[arg(long, env = "HEALER_REASONER_URL")]
    pub reasoner_url: Option<String>,

    /// Bind address for the HTTP surface.
    #[arg(long, env = "HEALER_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,
}

impl Config {
    pub fn is_app_configured(&self) -> bool {
        self.github_app_id.is_some() && self.github_app_private_key.is_some()
    }

    pub fn has_fallback(&self) -> bool {
        self.github_token.is_some()
    }

    /// `"github_app" | "pat" | "none"`, a pure read with no network call.
    pub fn auth_method(&self) -> &'static str {
        if self.is_app_configured() {
            "github_app"
        } else if self.has_fallback() {
            "pat"
        } else {
            "none"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        Harness::parse_from(std::iter::once(&"healer").chain(args)).config
    }

    #[test]
    fn defaults_report_no_auth_method() {
        let cfg = parse(&[]);
        assert_eq!(cfg.auth_method(), "none");
        assert_eq!(cfg.max_retries, 5);
    }

    #[test]
    fn app_requires_both_id_and_key() {
        let mut cfg = parse(&[]);
        cfg.github_app_id = Some("123".into());
        assert!(!cfg.is_app_configured());
        cfg.github_app_private_key = Some("pem".into());
        assert!(cfg.is_app_configured());
        assert_eq!(cfg.auth_method(), "github_app");
    }

    #[test]
    fn fallback_only_reports_pat() {
        let mut cfg = parse(&[]);
        cfg.github_token = Some("ghp_x".into());
        assert_eq!(cfg.auth_method(), "pat");
    }
}
