//! Provider registrations and manifest-backed adapter construction.
//!
//! Each provider crate exports a [`ProviderRegistration`] bundling its id,
//! embedded manifest document, and adapter factory. The registry validates
//! manifests through the TTL cache and dispatches construction to the
//! registered factory.

use std::sync::Arc;

use reqwest::Client;

use crate::error::BezoekError;
use crate::manifest::{DEFAULT_MANIFEST_TTL, ManifestCache, ProviderManifest, parse_manifest};
use crate::model::ProviderInfo;
use crate::provider::{ParkingProvider, ProviderConfig};

/// Factory building a boxed adapter from its validated manifest.
pub type ProviderFactory =
    fn(Client, ProviderManifest, ProviderConfig) -> Result<Box<dyn ParkingProvider>, BezoekError>;

/// One registerable provider.
pub struct ProviderRegistration {
    /// Stable provider identifier; the embedded manifest must declare the
    /// same id.
    pub id: &'static str,
    /// The provider's `manifest.json` document.
    pub manifest_json: &'static str,
    /// Adapter constructor.
    pub build: ProviderFactory,
}

/// Registered providers with a manifest cache in front of them.
pub struct ProviderRegistry {
    registrations: Vec<ProviderRegistration>,
    cache: ManifestCache,
}

impl ProviderRegistry {
    /// Build a registry with the default manifest TTL.
    #[must_use]
    pub fn new(registrations: Vec<ProviderRegistration>) -> Self {
        Self::with_cache(registrations, ManifestCache::new(Some(DEFAULT_MANIFEST_TTL)))
    }

    /// Build a registry with an explicit manifest cache.
    #[must_use]
    pub fn with_cache(registrations: Vec<ProviderRegistration>, cache: ManifestCache) -> Self {
        Self {
            registrations,
            cache,
        }
    }

    /// Validated manifests of every registration, in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first manifest validation failure; the cache is
    /// invalidated when that happens.
    pub fn manifests(&self, refresh: bool) -> Result<Arc<[ProviderManifest]>, BezoekError> {
        self.cache.load(refresh, || {
            self.registrations
                .iter()
                .map(|registration| parse_manifest(registration.manifest_json, registration.id))
                .collect()
        })
    }

    /// Capability listing for every registered provider.
    ///
    /// # Errors
    ///
    /// Propagates manifest validation failures.
    pub fn infos(&self, refresh: bool) -> Result<Vec<ProviderInfo>, BezoekError> {
        Ok(self
            .manifests(refresh)?
            .iter()
            .map(ProviderManifest::info)
            .collect())
    }

    /// The validated manifest for one provider id.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::NotFound`] when no registration matches.
    pub fn manifest(&self, provider_id: &str) -> Result<ProviderManifest, BezoekError> {
        self.manifests(false)?
            .iter()
            .find(|manifest| manifest.id == provider_id)
            .cloned()
            .ok_or_else(|| BezoekError::NotFound(String::from("Provider not found.")))
    }

    /// Construct the adapter registered under `provider_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::NotFound`] for unknown ids and propagates
    /// manifest and factory failures.
    pub fn build(
        &self,
        provider_id: &str,
        client: Client,
        config: ProviderConfig,
    ) -> Result<Box<dyn ParkingProvider>, BezoekError> {
        let manifest = self.manifest(provider_id)?;
        let registration = self
            .registrations
            .iter()
            .find(|registration| registration.id == provider_id)
            .ok_or_else(|| BezoekError::NotFound(String::from("Provider not found.")))?;
        (registration.build)(client, manifest, config)
    }
}
