//! Publisher client for submitting signed reports.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use tracing::debug;
use url::Url;

use crate::auth::TokenProvider;
use crate::clock::Clock;
use crate::error::{ClientResult, PublishError};
use crate::types::{PublishResult, PublisherConfig};

mod helpers;
mod http;

pub use http::{HttpTransport, CLIENT_USER_AGENT, SubmitRequest, Transport, TransportResponse};

use helpers::{is_loopback, submit_endpoint};

/// Publishes signed reports to `{url}/junit/submit`.
#[derive(Debug, Clone)]
pub struct PublisherClient<T: Transport = HttpTransport> {
    transport: T,
    endpoint: Url,
    token_provider: TokenProvider,
    config: PublisherConfig,
}

impl PublisherClient<HttpTransport> {
    pub fn new(config: PublisherConfig) -> ClientResult<Self> {
        let token_provider = config
            .token
            .as_ref()
            .map(TokenProvider::static_token)
            .unwrap_or_else(TokenProvider::from_env);

        Self::with_token_provider(config, token_provider)
    }

    pub fn with_token_provider(
        config: PublisherConfig,
        token_provider: TokenProvider,
    ) -> ClientResult<Self> {
        let transport = HttpTransport::new(config.timeout())?;
        Self::with_transport(config, token_provider, transport)
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::new(PublisherConfig::from_env())
    }
}

impl<T: Transport> PublisherClient<T> {
    /// Build a client over any transport.
    pub fn with_transport(
        config: PublisherConfig,
        token_provider: TokenProvider,
        transport: T,
    ) -> ClientResult<Self> {
        let endpoint = submit_endpoint(&config.url)?;
        Ok(Self {
            transport,
            endpoint,
            token_provider,
            config,
        })
    }

    /// Submit signed report bytes, retrying transient failures.
    ///
    /// Remote (non-loopback) endpoints require a token; without one this
    /// fails with [`PublishError::Config`] before any request is sent.
    pub fn submit(&self, signed: &[u8], clock: &dyn Clock) -> ClientResult<PublishResult> {
        let loopback = is_loopback(&self.endpoint);
        let token = if loopback {
            None
        } else {
            Some(self.token_provider.get_token().ok_or_else(|| PublishError::Config {
                message: format!(
                    "no API token configured for remote endpoint {}",
                    self.endpoint
                ),
            })?)
        };

        debug!(
            url = %self.endpoint,
            bytes = signed.len(),
            authenticated = token.is_some(),
            "submitting report"
        );

        let request = SubmitRequest {
            url: &self.endpoint,
            body: signed,
            token,
        };
        http::submit_with_retry(&self.transport, &request, &self.config, clock)
    }

    /// Full submit URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_authenticated(&self) -> bool {
        self.token_provider.is_authenticated()
    }
}
