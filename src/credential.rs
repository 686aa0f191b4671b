//! Installation-aware credential broker: resolves a short-lived GitHub
//! App installation token for a repository, falling back to a long-lived
//! secret, with caching and transparent refresh.
//!
//! Kept as an explicit, constructor-injected dependency rather than a
//! module-level singleton, shared only via `Arc`, with one instance
//! built at the HTTP boundary where handlers need it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::CredentialError;

const JWT_BACKDATE: Duration = Duration::seconds(60);
const JWT_LIFETIME: Duration = Duration::minutes(9);
const INSTALLATION_TOKEN_SAFETY_MARGIN: Duration = Duration::minutes(5);

/// Which credential path ultimately satisfied a `resolveToken` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    App,
    Fallback,
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Clone)]
struct CachedInstallationToken {
    token: String,
    /// `server_expiry - 5min`; compared directly against `now`.
    safe_expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct InstallationLookupResponse {
    id: u64,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: u64,
    pub account_login: Option<String>,
}

#[derive(Deserialize)]
struct RawInstallation {
    id: u64,
    account: Option<RawAccount>,
}

#[derive(Deserialize)]
struct RawAccount {
    login: Option<String>,
}

/// One repository accessible to an installation, as returned by
/// `GET /installation/repositories`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationRepo {
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub private: bool,
}

#[derive(Deserialize)]
struct RawRepoListResponse {
    #[serde(default)]
    repositories: Vec<RawRepo>,
}

#[derive(Deserialize)]
struct RawRepo {
    name: String,
    full_name: String,
    html_url: String,
    #[serde(default)]
    private: bool,
}

/// Per-repository token resolution, installation lookup, and admin reads.
///
/// Caches are keyed by `owner/repo` (installation discovery) and by
/// installation id (installation tokens), and are safe to share across
/// concurrent runs.
pub struct CredentialBroker {
    config: Config,
    http: reqwest::Client,
    installation_cache: Arc<RwLock<HashMap<String, u64>>>,
    token_cache: Arc<RwLock<HashMap<u64, CachedInstallationToken>>>,
}

impl CredentialBroker {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            installation_cache: Arc::new(RwLock::new(HashMap::new())),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_app_configured(&self) -> bool {
        self.config.is_app_configured()
    }

    pub fn has_fallback(&self) -> bool {
        self.config.has_fallback()
    }

    pub fn auth_method(&self) -> &'static str {
        self.config.auth_method()
    }

    /// Drop both in-memory caches. Used by admin tooling and tests.
    pub async fn clear_cache(&self) {
        self.installation_cache.write().await.clear();
        self.token_cache.write().await.clear();
    }

    /// Mint a fresh RS256 application assertion.
    ///
    /// Claims: `iat = now - 60s`, `exp = now + 9min`, `iss = app_id`. The
    /// backdate absorbs clock skew between us and GitHub; the lifetime
    /// stays inside GitHub's 10-minute ceiling.
    fn generate_app_jwt(&self) -> Result<String, CredentialError> {
        let app_id = self
            .config
            .github_app_id
            .as_ref()
            .ok_or(CredentialError::NoCredential)?;
        let pem = self
            .config
            .github_app_private_key
            .as_ref()
            .ok_or(CredentialError::NoCredential)?;

        let now = Utc::now();
        let claims = JwtClaims {
            iat: (now - JWT_BACKDATE).timestamp(),
            exp: (now + JWT_LIFETIME).timestamp(),
            iss: app_id.clone(),
        };

        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| CredentialError::Jwt(e.to_string()))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| CredentialError::Jwt(e.to_string()))
    }

    /// `find_installation`: `owner/repo -> installation_id`, cached, with
    /// a `404` treated as "no installation" rather than cached as a
    /// negative result (so a later App install on that repo is picked up
    /// without a cache-clear).
    pub async fn find_installation(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<u64>, CredentialError> {
        let key = format!("{owner}/{repo}");
        if let Some(id) = self.installation_cache.read().await.get(&key).copied() {
            return Ok(Some(id));
        }

        if !self.is_app_configured() {
            return Ok(None);
        }

        let jwt = self.generate_app_jwt()?;
        let url = format!(
            "{}/repos/{owner}/{repo}/installation",
            self.config.github_api_url
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "healer")
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {
                let body: InstallationLookupResponse = resp.json().await?;
                self.installation_cache
                    .write()
                    .await
                    .insert(key, body.id);
                Ok(Some(body.id))
            }
            404 => {
                debug!(owner, repo, "no installation found, will fall back");
                Ok(None)
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                warn!(owner, repo, status, "unexpected installation lookup response");
                let _ = body;
                Ok(None)
            }
        }
    }

    /// `mint_installation_token`: consult the `installation_id -> (token,
    /// safe_expiry)` cache; on miss, mint via the GitHub API and cache
    /// `safe_expiry = server_expiry - 5min`.
    pub async fn mint_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<String, CredentialError> {
        let now = Utc::now();
        if let Some(cached) = self.token_cache.read().await.get(&installation_id) {
            if now < cached.safe_expiry {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.generate_app_jwt()?;
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.config.github_api_url
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "healer")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::UnexpectedStatus { status, body });
        }

        let body: InstallationTokenResponse = resp.json().await?;
        let safe_expiry = body.expires_at - INSTALLATION_TOKEN_SAFETY_MARGIN;
        self.token_cache.write().await.insert(
            installation_id,
            CachedInstallationToken {
                token: body.token.clone(),
                safe_expiry,
            },
        );
        Ok(body.token)
    }

    /// Prefer the application path; fall back to the long-lived secret on
    /// any failure in that path. Fails only if neither is configured.
    pub async fn resolve_token(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<(String, AuthMethod), CredentialError> {
        if self.is_app_configured() {
            match self.find_installation(owner, repo).await {
                Ok(Some(installation_id)) => match self.mint_installation_token(installation_id).await {
                    Ok(token) => return Ok((token, AuthMethod::App)),
                    Err(e) => warn!(owner, repo, error = %e, "installation token mint failed, falling back"),
                },
                Ok(None) => {
                    debug!(owner, repo, "no installation, falling back to PAT");
                }
                Err(e) => warn!(owner, repo, error = %e, "installation lookup failed, falling back"),
            }
        }

        if let Some(token) = self.config.github_token.clone() {
            return Ok((token, AuthMethod::Fallback));
        }

        Err(CredentialError::NoCredential)
    }

    /// Build the app-installation redirect URL, with an optional CSRF
    /// `state` query parameter.
    pub fn installation_url(&self, state: Option<&str>) -> Option<String> {
        let slug = self.config.github_app_slug.as_ref()?;
        let mut url = format!("https://github.com/apps/{slug}/installations/new");
        if let Some(state) = state {
            url.push_str("?state=");
            url.push_str(&urlencoding_minimal(state));
        }
        Some(url)
    }

    /// Admin read: installation details for the app-install callback.
    pub async fn handle_installation_callback(
        &self,
        installation_id: u64,
    ) -> Result<Installation, CredentialError> {
        let jwt = self.generate_app_jwt()?;
        let url = format!(
            "{}/app/installations/{installation_id}",
            self.config.github_api_url
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "healer")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::UnexpectedStatus { status, body });
        }

        let raw: RawInstallation = resp.json().await?;
        Ok(Installation {
            id: raw.id,
            account_login: raw.account.and_then(|a| a.login),
        })
    }

    /// Admin read: all installations of the configured App.
    pub async fn list_installations(&self) -> Result<Vec<Installation>, CredentialError> {
        let jwt = self.generate_app_jwt()?;
        let url = format!("{}/app/installations", self.config.github_api_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "healer")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::UnexpectedStatus { status, body });
        }

        let raw: Vec<RawInstallation> = resp.json().await?;
        Ok(raw
            .into_iter()
            .map(|r| Installation {
                id: r.id,
                account_login: r.account.and_then(|a| a.login),
            })
            .collect())
    }

    /// Admin read: repositories accessible to a single installation.
    pub async fn list_installation_repos(
        &self,
        installation_id: u64,
    ) -> Result<Vec<InstallationRepo>, CredentialError> {
        let token = self.mint_installation_token(installation_id).await?;
        let url = format!("{}/installation/repositories", self.config.github_api_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "healer")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::UnexpectedStatus { status, body });
        }

        let raw: RawRepoListResponse = resp.json().await?;
        Ok(raw
            .repositories
            .into_iter()
            .map(|r| InstallationRepo {
                name: r.name,
                full_name: r.full_name,
                url: r.html_url,
                private: r.private,
            })
            .collect())
    }
}

/// Minimal percent-encoding for the `state` query parameter; avoids
/// pulling in a dedicated URL-encoding crate for a single call site.
fn urlencoding_minimal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
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

    fn base_config() -> Config {
        Harness::parse_from(["healer"]).config
    }

    #[tokio::test]
    async fn resolve_token_fails_with_no_credential_configured() {
        let broker = CredentialBroker::new(base_config());
        let err = broker.resolve_token("acme", "widgets").await.unwrap_err();
        assert!(matches!(err, CredentialError::NoCredential));
    }

    #[tokio::test]
    async fn resolve_token_uses_fallback_when_app_not_configured() {
        let mut cfg = base_config();
        cfg.github_token = Some("ghp_fallback".into());
        let broker = CredentialBroker::new(cfg);
        let (token, method) = broker.resolve_token("acme", "widgets").await.unwrap();
        assert_eq!(token, "ghp_fallback");
        assert_eq!(method, AuthMethod::Fallback);
    }

    #[tokio::test]
    async fn installation_cache_short_circuits_lookup() {
        let broker = CredentialBroker::new(base_config());
        broker
            .installation_cache
            .write()
            .await
            .insert("acme/widgets".to_string(), 42);
        let found = broker.find_installation("acme", "widgets").await.unwrap();
        assert_eq!(found, Some(42));
    }

    #[tokio::test]
    async fn mint_installation_token_reuses_unexpired_cache_entry() {
        let broker = CredentialBroker::new(base_config());
        broker.token_cache.write().await.insert(
            7,
            CachedInstallationToken {
                token: "ghs_cached".into(),
                safe_expiry: Utc::now() + Duration::minutes(10),
            },
        );
        let token = broker.mint_installation_token(7).await.unwrap();
        assert_eq!(token, "ghs_cached");
    }

    #[test]
    fn installation_url_includes_csrf_state() {
        let mut cfg = base_config();
        cfg.github_app_slug = Some("neverdown-healer".into());
        let broker = CredentialBroker::new(cfg);
        let url = broker.installation_url(Some("run-123")).unwrap();
        assert_eq!(
            url,
            "https://github.com/apps/neverdown-healer/installations/new?state=run-123"
        );
    }

    #[test]
    fn installation_url_is_none_without_slug() {
        let broker = CredentialBroker::new(base_config());
        assert!(broker.installation_url(None).is_none());
    }

    #[test]
    fn auth_method_reflects_configuration() {
        let broker = CredentialBroker::new(base_config());
        assert_eq!(broker.auth_method(), "none");
    }
}
