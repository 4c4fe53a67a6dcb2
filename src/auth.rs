//! Token providers for private channels.
//!
//! Channels named `private-*` carry a short-lived token in their
//! subscription identifier. The cable transport asks its [`TokenProvider`]
//! for one each time it opens (or re-opens) such a channel.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::{CHANNEL_AUTH_PATH, HTTP_REQUEST_TIMEOUT};
use crate::message::ChannelName;

/// Source of per-channel auth tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token authorizing the current user on `channel`.
    async fn channel_token(&self, channel: &ChannelName) -> Result<String>;
}

/// Hands out the same token for every channel.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a fixed token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn channel_token(&self, _channel: &ChannelName) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Request body for the channel auth endpoint.
#[derive(Debug, Serialize)]
struct ChannelAuthRequest<'a> {
    channel: &'a str,
}

/// Response from the channel auth endpoint.
#[derive(Debug, Deserialize)]
pub struct ChannelAuthResponse {
    /// Token to embed in the subscription identifier.
    pub token: String,
}

/// Fetches tokens from `POST {server}/api/realtime/auth`.
#[derive(Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    api_token: String,
}

impl std::fmt::Debug for HttpTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenProvider")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpTokenProvider {
    /// Provider for `server_url`, authenticating with the user's API token.
    pub fn new(server_url: &str, api_token: impl Into<String>) -> Result<Self> {
        Self::with_timeout(server_url, api_token, HTTP_REQUEST_TIMEOUT)
    }

    /// Same as [`Self::new`] with an explicit request timeout.
    pub fn with_timeout(
        server_url: &str,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", server_url.trim_end_matches('/'), CHANNEL_AUTH_PATH),
            api_token: api_token.into(),
        })
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn channel_token(&self, channel: &ChannelName) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&ChannelAuthRequest {
                channel: channel.as_str(),
            })
            .send()
            .await
            .with_context(|| format!("Failed to request token for {channel}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Server returned {}: {}", status, body);
        }

        let auth: ChannelAuthResponse = response
            .json()
            .await
            .context("Invalid channel auth response")?;
        Ok(auth.token)
    }
}
