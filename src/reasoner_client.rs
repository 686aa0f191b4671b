//! Concrete [`ReasonerClient`]: an HTTP call to whichever reasoning
//! model endpoint is configured. The adapter itself (prompt shape,
//! reply parsing) stays model-agnostic in `reasoner.rs`; this module is
//! the one place that knows the wire format of an actual request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::ReasonerError;
use crate::reasoner::ReasonerClient;

/// `{system, prompt} -> {content}`, a minimal envelope any reasoning
/// endpoint can be fronted with regardless of the model behind it.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    system: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

pub struct HttpReasonerClient {
    http: reqwest::Client,
    url: String,
}

impl HttpReasonerClient {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self { http: reqwest::Client::new(), url }
    }

    /// Build a client from `config.reasoner_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if no reasoner endpoint is configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let url = config
            .reasoner_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HEALER_REASONER_URL is not set; no reasoning model endpoint configured"))?;
        Ok(Self::new(url))
    }
}

#[async_trait]
impl ReasonerClient for HttpReasonerClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ReasonerError> {
        let response = self
            .http
            .post(&self.url)
            .json(&CompletionRequest { system, prompt })
            .send()
            .await
            .map_err(|e| ReasonerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReasonerError::Request(format!("reasoner endpoint returned {status}: {body}")));
        }

        let body: CompletionResponse = response.json().await.map_err(|e| ReasonerError::Request(e.to_string()))?;
        Ok(body.content)
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

    #[test]
    fn from_config_requires_reasoner_url() {
        let config = Harness::parse_from(["healer"]).config;
        assert!(HttpReasonerClient::from_config(&config).is_err());
    }

    #[test]
    fn from_config_succeeds_once_url_is_set() {
        let mut config = Harness::parse_from(["healer"]).config;
        config.reasoner_url = Some("https://reasoner.internal/complete".to_string());
        assert!(HttpReasonerClient::from_config(&config).is_ok());
    }
}
