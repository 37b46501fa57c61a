//! Provider contract and the request plumbing shared by every adapter.
//!
//! `ProviderCore` owns the pieces every adapter needs: the HTTP handle, the
//! validated manifest, URL building against the configured deployment, and
//! the request policy. The [`ParkingProvider`] trait defines the operations
//! a city backend must support; favorite updates are dispatched here based
//! on the capabilities the manifest declares.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::BezoekError;
use crate::http::{DEFAULT_TIMEOUT, RequestPolicy, decode_json, expect_success, send_with_policy};
use crate::manifest::ProviderManifest;
use crate::model::{Credentials, Favorite, FavoriteField, Permit, ProviderInfo, Reservation};
use crate::normalize::normalize_license_plate;

/// Connection settings applied when an adapter is built.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Root URL of the provider deployment.
    pub base_url: Option<String>,
    /// API prefix appended to the base URL; adapters supply their own
    /// default when this is unset or blank.
    pub api_uri: Option<String>,
    /// Per-attempt timeout, defaulting to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Transport retries granted to GET requests.
    pub retry_count: usize,
}

/// Shared state and request plumbing held by every adapter.
#[derive(Debug)]
pub struct ProviderCore {
    client: Client,
    manifest: ProviderManifest,
    base_url: Option<String>,
    api_uri: String,
    policy: RequestPolicy,
}

impl ProviderCore {
    /// Build the shared core from the adapter's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when `base_url` is blank.
    pub fn new(
        client: Client,
        manifest: ProviderManifest,
        config: ProviderConfig,
        default_api_uri: &str,
    ) -> Result<Self, BezoekError> {
        let base_url = match config.base_url {
            None => None,
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(BezoekError::Validation(String::from(
                        "base_url must be a non-empty string.",
                    )));
                }
                Some(trimmed.trim_end_matches('/').to_owned())
            }
        };
        let api_uri = normalize_api_uri(config.api_uri.as_deref(), default_api_uri);
        let policy = RequestPolicy {
            timeout: config.timeout.unwrap_or(DEFAULT_TIMEOUT),
            retry_count: config.retry_count,
        };
        Ok(Self {
            client,
            manifest,
            base_url,
            api_uri,
            policy,
        })
    }

    /// The validated manifest this adapter was built with.
    #[must_use]
    pub fn manifest(&self) -> &ProviderManifest {
        &self.manifest
    }

    /// Join a relative path onto the configured base URL and API prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] for empty or absolute paths and
    /// when no base URL is configured.
    pub fn build_url(&self, path: &str) -> Result<String, BezoekError> {
        if path.is_empty() {
            return Err(BezoekError::Validation(String::from(
                "Path must be a non-empty string.",
            )));
        }
        if path.starts_with("http://") || path.starts_with("https://") {
            return Err(BezoekError::Validation(String::from(
                "Use relative paths when building provider requests.",
            )));
        }
        let Some(base_url) = self.base_url.as_deref() else {
            return Err(BezoekError::Validation(String::from(
                "base_url is required to build provider requests.",
            )));
        };
        let separator = if path.starts_with('/') { "" } else { "/" };
        Ok(format!("{base_url}{api}{separator}{path}", api = self.api_uri))
    }

    /// Send a request under the adapter's policy, returning the raw
    /// response whatever its status.
    ///
    /// # Errors
    ///
    /// Propagates URL validation and transport failures.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        configure: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, BezoekError> {
        let url = self.build_url(path)?;
        send_with_policy(&self.client, &self.policy, method, &url, configure).await
    }

    /// Send a request, fail non-success statuses, and decode the JSON body.
    ///
    /// # Errors
    ///
    /// Propagates transport, status, and decode failures.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        configure: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<T, BezoekError> {
        let response = self.send(method, path, configure).await?;
        decode_json(expect_success(response)?).await
    }
}

fn normalize_api_uri(configured: Option<&str>, default_api_uri: &str) -> String {
    let chosen = match configured {
        Some(value) if !value.trim().is_empty() => value,
        _ => default_api_uri,
    };
    let stripped = chosen.trim().trim_matches('/');
    if stripped.is_empty() {
        String::new()
    } else {
        format!("/{stripped}")
    }
}

/// Look up a required, non-empty credential value.
///
/// # Errors
///
/// Returns [`BezoekError::Validation`] naming the missing key.
pub fn require_credential<'a>(
    credentials: &'a Credentials,
    key: &str,
) -> Result<&'a str, BezoekError> {
    credentials
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BezoekError::Validation(format!("{key} is required.")))
}

/// Combine a base credential map with overrides; overrides win per key.
#[must_use]
pub fn merge_credentials(base: &Credentials, overrides: &Credentials) -> Credentials {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Operations every city adapter supports.
///
/// Adapters authenticate lazily: operations needing a session establish or
/// refresh it from the credentials captured at login. A session expiring
/// mid-operation is retried exactly once after re-authentication.
#[async_trait]
pub trait ParkingProvider: Send + Sync {
    /// The manifest this adapter was built with.
    fn manifest(&self) -> &ProviderManifest;

    /// Authenticate against the backend and capture credentials for later
    /// transparent re-authentication.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] for missing credentials and
    /// [`BezoekError::Auth`] when the backend rejects them.
    async fn login(&self, credentials: &Credentials) -> Result<(), BezoekError>;

    /// The account's permit with its remaining balance and chargeable
    /// zone-validity windows.
    ///
    /// # Errors
    ///
    /// Fails when no session can be established or the backend answer is
    /// unusable.
    async fn get_permit(&self) -> Result<Permit, BezoekError>;

    /// Active and upcoming reservations.
    ///
    /// # Errors
    ///
    /// Fails when no session can be established or the backend answer is
    /// unusable.
    async fn list_reservations(&self) -> Result<Vec<Reservation>, BezoekError>;

    /// Start a reservation for a license plate over the given window.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] for an unusable plate or window
    /// before any request is sent.
    async fn start_reservation(
        &self,
        license_plate: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<Reservation, BezoekError>;

    /// Update fields of an existing reservation.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when the backend cannot change
    /// the requested fields.
    async fn update_reservation(
        &self,
        reservation_id: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        name: Option<&str>,
    ) -> Result<Reservation, BezoekError>;

    /// End a reservation at the given time.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when the reservation is unknown.
    async fn end_reservation(
        &self,
        reservation_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Reservation, BezoekError>;

    /// Stored favorite license plates.
    ///
    /// # Errors
    ///
    /// Fails when no session can be established or the backend answer is
    /// unusable.
    async fn list_favorites(&self) -> Result<Vec<Favorite>, BezoekError>;

    /// Store a license plate as a favorite.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] for an unusable plate.
    async fn add_favorite(&self, license_plate: &str, name: Option<&str>)
    -> Result<Favorite, BezoekError>;

    /// Backend-native favorite update, for adapters whose manifest declares
    /// updatable favorite fields. Callers go through
    /// [`ParkingProvider::update_favorite`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when the favorite is unknown.
    async fn update_favorite_native(
        &self,
        favorite_id: &str,
        license_plate: Option<&str>,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError>;

    /// Remove a stored favorite.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when the favorite is unknown.
    async fn remove_favorite(&self, favorite_id: &str) -> Result<(), BezoekError>;

    /// Capability listing entry for this adapter.
    fn info(&self) -> ProviderInfo {
        self.manifest().info()
    }

    /// Update a favorite, falling back to remove-and-re-add when the
    /// manifest does not declare every requested field as updatable.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when no field is requested, or
    /// when the fallback path is needed without a license plate to recreate
    /// the favorite from.
    async fn update_favorite(
        &self,
        favorite_id: &str,
        license_plate: Option<&str>,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        let mut requested = Vec::new();
        if license_plate.is_some() {
            requested.push(FavoriteField::LicensePlate);
        }
        if name.is_some() {
            requested.push(FavoriteField::Name);
        }
        if requested.is_empty() {
            return Err(BezoekError::Validation(String::from(
                "license_plate or name is required.",
            )));
        }
        let declared = &self.manifest().favorite_update_fields;
        if requested.iter().all(|field| declared.contains(field)) {
            return self
                .update_favorite_native(favorite_id, license_plate, name)
                .await;
        }
        let Some(plate) = license_plate else {
            return Err(BezoekError::Validation(String::from(
                "license_plate is required when update is not supported.",
            )));
        };
        let normalized = normalize_license_plate(plate)?;
        debug!(
            provider = self.manifest().id,
            favorite_id, "updating favorite by remove and re-add"
        );
        self.remove_favorite(favorite_id).await?;
        self.add_favorite(&normalized, name).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn manifest(favorite_update_fields: Vec<FavoriteField>) -> ProviderManifest {
        ProviderManifest {
            id: String::from("stub"),
            name: String::from("Stub"),
            favorite_update_fields,
            reservation_update_fields: vec![],
        }
    }

    fn core_with(base_url: Option<&str>, api_uri: Option<&str>) -> ProviderCore {
        let config = ProviderConfig {
            base_url: base_url.map(String::from),
            api_uri: api_uri.map(String::from),
            ..ProviderConfig::default()
        };
        ProviderCore::new(Client::new(), manifest(vec![]), config, "api").unwrap()
    }

    #[test]
    fn build_url_joins_base_prefix_and_path() {
        let core = core_with(Some("https://example.test/"), None);
        assert_eq!(
            core.build_url("/session/0").unwrap(),
            "https://example.test/api/session/0"
        );
        assert_eq!(
            core.build_url("session/0").unwrap(),
            "https://example.test/api/session/0"
        );
    }

    #[test]
    fn build_url_honors_api_uri_override() {
        let core = core_with(Some("https://example.test"), Some("/Custom/api/"));
        assert_eq!(
            core.build_url("/x").unwrap(),
            "https://example.test/Custom/api/x"
        );
        let blank = core_with(Some("https://example.test"), Some("  "));
        assert_eq!(blank.build_url("/x").unwrap(), "https://example.test/api/x");
    }

    #[test]
    fn build_url_rejects_bad_input() {
        let core = core_with(Some("https://example.test"), None);
        let err = core.build_url("").unwrap_err();
        assert_eq!(err.to_string(), "Path must be a non-empty string.");
        let err = core.build_url("https://elsewhere.test/x").unwrap_err();
        assert_eq!(err.to_string(), "Use relative paths when building provider requests.");
    }

    #[test]
    fn build_url_requires_base_url() {
        let core = core_with(None, None);
        let err = core.build_url("/x").unwrap_err();
        assert_eq!(err.to_string(), "base_url is required to build provider requests.");
    }

    #[test]
    fn blank_base_url_is_rejected_up_front() {
        let config = ProviderConfig {
            base_url: Some(String::from("   ")),
            ..ProviderConfig::default()
        };
        let err = ProviderCore::new(Client::new(), manifest(vec![]), config, "api").unwrap_err();
        assert_eq!(err.to_string(), "base_url must be a non-empty string.");
    }

    #[test]
    fn require_credential_reports_missing_keys() {
        let mut credentials = Credentials::new();
        credentials.insert(String::from("username"), String::from("resident"));
        credentials.insert(String::from("password"), String::new());
        assert_eq!(require_credential(&credentials, "username").unwrap(), "resident");
        let err = require_credential(&credentials, "password").unwrap_err();
        assert_eq!(err.to_string(), "password is required.");
    }

    #[test]
    fn merge_credentials_lets_overrides_win() {
        let mut base = Credentials::new();
        base.insert(String::from("username"), String::from("resident"));
        base.insert(String::from("password"), String::from("from-file"));
        let mut overrides = Credentials::new();
        overrides.insert(String::from("password"), String::from("from-flag"));
        overrides.insert(String::from("zone_id"), String::from("Z-1"));
        let merged = merge_credentials(&base, &overrides);
        assert_eq!(merged.get("username").unwrap(), "resident");
        assert_eq!(merged.get("password").unwrap(), "from-flag");
        assert_eq!(merged.get("zone_id").unwrap(), "Z-1");
    }

    struct StubProvider {
        manifest: ProviderManifest,
        calls: Mutex<Vec<String>>,
    }

    impl StubProvider {
        fn new(favorite_update_fields: Vec<FavoriteField>) -> Self {
            Self {
                manifest: manifest(favorite_update_fields),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn unused() -> BezoekError {
        BezoekError::Provider(String::from("not exercised"))
    }

    fn favorite(license_plate: &str) -> Favorite {
        Favorite {
            id: String::from("f1"),
            name: String::from("Stub"),
            license_plate: String::from(license_plate),
        }
    }

    #[async_trait]
    impl ParkingProvider for StubProvider {
        fn manifest(&self) -> &ProviderManifest {
            &self.manifest
        }

        async fn login(&self, _credentials: &Credentials) -> Result<(), BezoekError> {
            Ok(())
        }

        async fn get_permit(&self) -> Result<Permit, BezoekError> {
            Err(unused())
        }

        async fn list_reservations(&self) -> Result<Vec<Reservation>, BezoekError> {
            Err(unused())
        }

        async fn start_reservation(
            &self,
            _license_plate: &str,
            _start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
            _name: Option<&str>,
        ) -> Result<Reservation, BezoekError> {
            Err(unused())
        }

        async fn update_reservation(
            &self,
            _reservation_id: &str,
            _start_time: Option<DateTime<Utc>>,
            _end_time: Option<DateTime<Utc>>,
            _name: Option<&str>,
        ) -> Result<Reservation, BezoekError> {
            Err(unused())
        }

        async fn end_reservation(
            &self,
            _reservation_id: &str,
            _end_time: DateTime<Utc>,
        ) -> Result<Reservation, BezoekError> {
            Err(unused())
        }

        async fn list_favorites(&self) -> Result<Vec<Favorite>, BezoekError> {
            Err(unused())
        }

        async fn add_favorite(
            &self,
            license_plate: &str,
            name: Option<&str>,
        ) -> Result<Favorite, BezoekError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add:{license_plate}:{}", name.unwrap_or("-")));
            Ok(favorite(license_plate))
        }

        async fn update_favorite_native(
            &self,
            favorite_id: &str,
            license_plate: Option<&str>,
            name: Option<&str>,
        ) -> Result<Favorite, BezoekError> {
            self.calls.lock().unwrap().push(format!(
                "native:{favorite_id}:{}:{}",
                license_plate.unwrap_or("-"),
                name.unwrap_or("-")
            ));
            Ok(favorite(license_plate.unwrap_or("KEPT")))
        }

        async fn remove_favorite(&self, favorite_id: &str) -> Result<(), BezoekError> {
            self.calls.lock().unwrap().push(format!("remove:{favorite_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn update_uses_native_path_when_fields_are_declared() {
        let stub = StubProvider::new(vec![FavoriteField::LicensePlate, FavoriteField::Name]);
        stub.update_favorite("f1", Some("ab-12-cd"), Some("Home"))
            .await
            .unwrap();
        assert_eq!(stub.calls(), vec!["native:f1:ab-12-cd:Home"]);
    }

    #[tokio::test]
    async fn update_falls_back_when_a_requested_field_is_undeclared() {
        let stub = StubProvider::new(vec![FavoriteField::Name]);
        stub.update_favorite("f1", Some("ab-12-cd"), Some("Home"))
            .await
            .unwrap();
        assert_eq!(stub.calls(), vec!["remove:f1", "add:AB12CD:Home"]);
    }

    #[tokio::test]
    async fn fallback_requires_a_license_plate() {
        let stub = StubProvider::new(vec![]);
        let err = stub.update_favorite("f1", None, Some("Home")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "license_plate is required when update is not supported."
        );
        assert!(stub.calls().is_empty());
    }

    #[tokio::test]
    async fn update_rejects_an_empty_request() {
        let stub = StubProvider::new(vec![FavoriteField::LicensePlate, FavoriteField::Name]);
        let err = stub.update_favorite("f1", None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "license_plate or name is required.");
    }
}
