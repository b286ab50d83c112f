//! ICE server directory
//!
//! Builds the ordered ICE server list handed to a client:
//!
//! 1. the configured STUN server (always),
//! 2. the configured TURN server with fresh ephemeral credentials, when
//!    host, port and shared secret are all set,
//! 3. whatever the third-party token service returns, in its order.
//!
//! Browsers try candidates in list order. A failing token service only
//! shortens the list.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use beacon_core::{generate_turn_credentials, IceConfig, IceServer, IceUrls, TwilioConfig};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Timeout for token service requests
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a third-party ICE token service
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token service returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// A service that hands out ICE servers (usually with its own TURN relays)
#[async_trait]
pub trait IceTokenProvider: Send + Sync {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, TokenError>;
}

/// Assembles ICE server lists for clients
#[derive(Clone, Default)]
pub struct IceDirectory {
    provider: Option<Arc<dyn IceTokenProvider>>,
}

impl IceDirectory {
    pub fn new(provider: Option<Arc<dyn IceTokenProvider>>) -> Self {
        Self { provider }
    }

    /// Directory backed by Twilio when its credentials are configured
    pub fn from_config(config: &IceConfig) -> Self {
        let provider = TwilioTokenProvider::from_config(&config.twilio)
            .map(|p| Arc::new(p) as Arc<dyn IceTokenProvider>);
        Self::new(provider)
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// ICE servers for `client_id`, with TURN credentials issued now
    pub async fn server_list(&self, client_id: &str, config: &IceConfig) -> Vec<IceServer> {
        self.server_list_at(client_id, config, SystemTime::now()).await
    }

    /// ICE servers for `client_id`, with TURN credentials issued at `now`
    pub async fn server_list_at(
        &self,
        client_id: &str,
        config: &IceConfig,
        now: SystemTime,
    ) -> Vec<IceServer> {
        let mut servers = vec![IceServer::stun(&config.stun_host, config.stun_port)];

        if let Some(turn) = config.turn() {
            let creds = generate_turn_credentials(turn.secret, client_id, now);
            servers.push(IceServer::turn(turn.host, turn.port, creds));
        } else {
            debug!("TURN not configured, skipping");
        }

        if let Some(provider) = &self.provider {
            match provider.fetch_ice_servers().await {
                Ok(extra) => {
                    debug!("Token service returned {} ICE servers", extra.len());
                    servers.extend(extra);
                }
                Err(e) => warn!(error = %e, "ICE token service unavailable"),
            }
        }

        servers
    }
}

/// Twilio Network Traversal Service token client
pub struct TwilioTokenProvider {
    client: reqwest::Client,
    url: String,
    key_sid: String,
    auth_token: String,
}

impl TwilioTokenProvider {
    /// Returns `None` unless account SID, auth token and key SID are all set
    pub fn from_config(config: &TwilioConfig) -> Option<Self> {
        let creds = config.credentials()?;

        let client = match reqwest::Client::builder()
            .user_agent(format!("beacon/{}", env!("CARGO_PKG_VERSION")))
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Failed to create HTTP client, token service disabled");
                return None;
            }
        };

        Some(Self {
            client,
            url: format!(
                "{}/2010-04-01/Accounts/{}/Tokens.json",
                config.api_base.trim_end_matches('/'),
                creds.account_sid
            ),
            key_sid: creds.key_sid.to_string(),
            auth_token: creds.auth_token.to_string(),
        })
    }
}

#[async_trait]
impl IceTokenProvider for TwilioTokenProvider {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, TokenError> {
        debug!("Requesting ICE token from {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.key_sid, Some(&self.auth_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into_servers())
    }
}

/// The part of Twilio's token resource we use
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    ice_servers: Vec<TwilioIceServer>,
}

#[derive(Debug, Deserialize)]
struct TwilioIceServer {
    #[serde(default)]
    urls: Option<IceUrls>,
    /// Legacy single-URL field
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

impl TokenResponse {
    fn into_servers(self) -> Vec<IceServer> {
        self.ice_servers
            .into_iter()
            .filter_map(|s| {
                let urls = match (s.urls, s.url) {
                    (Some(urls), _) => urls.into_vec(),
                    (None, Some(url)) => vec![url],
                    (None, None) => {
                        debug!(username = ?s.username, "Skipping token service entry without urls");
                        return None;
                    }
                };
                Some(IceServer {
                    urls,
                    username: s.username,
                    credential: s.credential,
                })
            })
            .collect()
    }
}
