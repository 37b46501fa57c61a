//! Client facade for provider discovery and adapter construction.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::BezoekError;
use crate::http::DEFAULT_TIMEOUT;
use crate::model::ProviderInfo;
use crate::provider::{ParkingProvider, ProviderConfig};
use crate::registry::ProviderRegistry;

/// Per-call deployment overrides for [`BezoekClient::get_provider`].
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    /// Overrides the client-wide base URL for this adapter.
    pub base_url: Option<String>,
    /// Overrides the client-wide API prefix for this adapter.
    pub api_uri: Option<String>,
}

/// Entry point for callers: lists providers and builds their adapters.
///
/// The client holds one HTTP connection pool shared by every adapter it
/// builds. Dropping the client releases the pool once the adapters built
/// from it are gone.
pub struct BezoekClient {
    registry: Arc<ProviderRegistry>,
    http: Client,
    base_url: Option<String>,
    api_uri: Option<String>,
    timeout: Duration,
    retry_count: usize,
}

impl BezoekClient {
    /// Start building a client over the given registry.
    #[must_use]
    pub fn builder(registry: Arc<ProviderRegistry>) -> BezoekClientBuilder {
        BezoekClientBuilder {
            registry,
            http: None,
            base_url: None,
            api_uri: None,
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
        }
    }

    /// Capability listing of every registered provider.
    ///
    /// # Errors
    ///
    /// Propagates manifest validation failures.
    pub fn list_providers(&self) -> Result<Vec<ProviderInfo>, BezoekError> {
        self.registry.infos(false)
    }

    /// Build the adapter for a provider id, applying per-call overrides on
    /// top of the client-wide defaults.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Provider`] for an empty id and
    /// [`BezoekError::NotFound`] for an unknown one.
    pub fn get_provider(
        &self,
        provider_id: &str,
        overrides: ProviderOverrides,
    ) -> Result<Box<dyn ParkingProvider>, BezoekError> {
        if provider_id.is_empty() {
            return Err(BezoekError::Provider(String::from("Provider id is required.")));
        }
        let config = self.effective_config(overrides);
        self.registry.build(provider_id, self.http.clone(), config)
    }

    /// Release the client; its connection pool closes once no adapter built
    /// from it remains.
    pub fn close(self) {
        debug!("closing client");
    }

    fn effective_config(&self, overrides: ProviderOverrides) -> ProviderConfig {
        ProviderConfig {
            base_url: overrides.base_url.or_else(|| self.base_url.clone()),
            api_uri: overrides.api_uri.or_else(|| self.api_uri.clone()),
            timeout: Some(self.timeout),
            retry_count: self.retry_count,
        }
    }
}

/// Builder for [`BezoekClient`].
pub struct BezoekClientBuilder {
    registry: Arc<ProviderRegistry>,
    http: Option<Client>,
    base_url: Option<String>,
    api_uri: Option<String>,
    timeout: Duration,
    retry_count: usize,
}

impl BezoekClientBuilder {
    /// Use an externally owned HTTP client instead of creating one.
    #[must_use]
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Default base URL for every adapter built by this client.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Default API prefix for every adapter built by this client.
    #[must_use]
    pub fn api_uri(mut self, api_uri: impl Into<String>) -> Self {
        self.api_uri = Some(api_uri.into());
        self
    }

    /// Per-attempt timeout for every adapter built by this client.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Transport retries granted to GET requests.
    #[must_use]
    pub fn retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Build the client, creating an HTTP pool when none was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Network`] when the HTTP client cannot be
    /// constructed.
    pub fn build(self) -> Result<BezoekClient, BezoekError> {
        let http = match self.http {
            Some(client) => client,
            // Session-based providers need the jar to carry their login
            // cookie across requests.
            None => Client::builder().cookie_store(true).build()?,
        };
        Ok(BezoekClient {
            registry: self.registry,
            http,
            base_url: self.base_url,
            api_uri: self.api_uri,
            timeout: self.timeout,
            retry_count: self.retry_count,
        })
    }
}
