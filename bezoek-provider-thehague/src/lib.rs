//! Provider adapter for The Hague visitor parking.
//!
//! The backend authenticates with HTTP basic auth against a session
//! endpoint and keeps the session in a cookie afterwards, so the shared
//! HTTP client must carry a cookie store. Error responses with status 400
//! may embed a backend `pv` code; known codes are translated to readable
//! messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bezoek_core::{
    error::BezoekError,
    http::{decode_json, expect_success, status_error},
    manifest::ProviderManifest,
    model::{Credentials, Favorite, Permit, Reservation, ZoneValidityBlock},
    normalize::{
        filter_chargeable, format_timestamp, normalize_license_plate, parse_timestamp,
        truncate_subseconds, validate_reservation_window,
    },
    provider::{ParkingProvider, ProviderConfig, ProviderCore, require_credential},
    registry::ProviderRegistration,
};

/// Identifier this adapter registers under.
pub const PROVIDER_ID: &str = "the_hague";

const DEFAULT_API_URI: &str = "api";
const SESSION_ENDPOINT: &str = "/session/0";
const ACCOUNT_ENDPOINT: &str = "/account/0";
const RESERVATION_ENDPOINT: &str = "/reservation";
const FAVORITE_ENDPOINT: &str = "/favorite";

const PERMIT_MEDIA_TYPE_HEADER: &str = "x-permit-media-type-id";
const REQUESTED_WITH_HEADER: &str = "x-requested-with";
const DEFAULT_REQUESTED_WITH: &str = "angular";
const USER_AGENT: &str = "bezoek-the-hague";

/// Backend error codes with a readable translation.
const ERROR_MESSAGES: &[(&str, &str)] = &[("pv76", "No paid parking at this time")];

/// Registration consumed by the provider registry.
#[must_use]
pub fn registration() -> ProviderRegistration {
    ProviderRegistration {
        id: PROVIDER_ID,
        manifest_json: include_str!("../manifest.json"),
        build: |client, manifest, config| {
            Ok(Box::new(TheHagueProvider::new(client, manifest, config)?))
        },
    }
}

/// Account document from `/account/0`.
#[derive(Debug, Deserialize)]
struct AccountDocument {
    #[serde(default)]
    id: Option<ResponseId>,
    #[serde(default)]
    debit_minutes: Option<FlexibleInt>,
    #[serde(default)]
    zone_validity: Option<Vec<ValidityEntry>>,
    /// Some deployments return one zone object instead of the list.
    #[serde(default)]
    zone: Option<ValidityEntry>,
}

#[derive(Debug, Deserialize)]
struct ValidityEntry {
    #[serde(default)]
    is_free: Option<bool>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

/// Reservation document, returned standalone and as list elements.
#[derive(Debug, Deserialize)]
struct ReservationDocument {
    #[serde(default)]
    id: Option<ResponseId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    license_plate: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FavoriteDocument {
    #[serde(default)]
    id: Option<ResponseId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    license_plate: Option<String>,
}

/// Body of a 400 response; `description` carries the backend error code.
#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    description: Option<String>,
}

/// Identifier that arrives as a JSON number or string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ResponseId {
    Number(i64),
    Text(String),
}

impl ResponseId {
    fn into_non_empty(self) -> Option<String> {
        let text = match self {
            ResponseId::Number(number) => number.to_string(),
            ResponseId::Text(text) => text.trim().to_owned(),
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Counter that arrives as a JSON number or numeric string; anything else
/// counts as zero.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FlexibleInt {
    Number(i64),
    Text(String),
    Other(Value),
}

impl FlexibleInt {
    fn value(&self) -> i64 {
        match self {
            FlexibleInt::Number(number) => *number,
            FlexibleInt::Text(text) => text.trim().parse().unwrap_or(0),
            FlexibleInt::Other(_) => 0,
        }
    }
}

#[derive(Serialize)]
struct ReservationCreate<'a> {
    id: Option<&'a str>,
    name: &'a str,
    license_plate: &'a str,
    start_time: String,
    end_time: String,
}

#[derive(Serialize)]
struct ReservationPatch {
    end_time: String,
}

#[derive(Serialize)]
struct FavoriteWrite<'a> {
    name: &'a str,
    license_plate: &'a str,
}

#[derive(Default)]
struct SessionState {
    credentials: Option<Credentials>,
    permit_media_type_id: Option<String>,
    logged_in: bool,
}

/// The Hague visitor parking adapter.
pub struct TheHagueProvider {
    core: ProviderCore,
    state: Mutex<SessionState>,
}

impl TheHagueProvider {
    /// Build the adapter from its manifest and connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`BezoekError::Validation`] when the configuration is
    /// unusable.
    pub fn new(
        client: Client,
        manifest: ProviderManifest,
        config: ProviderConfig,
    ) -> Result<Self, BezoekError> {
        Ok(Self {
            core: ProviderCore::new(client, manifest, config, DEFAULT_API_URI)?,
            state: Mutex::new(SessionState::default()),
        })
    }

    async fn ensure_authenticated(&self) -> Result<(), BezoekError> {
        let (logged_in, credentials) = {
            let state = self.state.lock().await;
            (state.logged_in, state.credentials.clone())
        };
        if logged_in {
            return Ok(());
        }
        let Some(credentials) = credentials else {
            return Err(BezoekError::Auth(String::from("Authentication required.")));
        };
        self.login(&credentials).await
    }

    async fn reauthenticate(&self) -> Result<(), BezoekError> {
        let credentials = {
            let mut state = self.state.lock().await;
            state.logged_in = false;
            state.credentials.clone()
        };
        let Some(credentials) = credentials else {
            return Err(BezoekError::Auth(String::from("Authentication required.")));
        };
        warn!(provider = PROVIDER_ID, "session rejected, logging in again");
        self.login(&credentials).await
    }

    /// One attempt against the backend. 400 bodies are inspected for an
    /// embedded error code before the generic status mapping applies.
    async fn attempt<P: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&P>,
        basic: Option<(&str, &str)>,
    ) -> Result<Response, BezoekError> {
        let media_type = self.state.lock().await.permit_media_type_id.clone();
        let response = self
            .core
            .send(method, path, |request| {
                let mut request = apply_headers(request, media_type.as_deref());
                if let Some((username, password)) = basic {
                    request = request.basic_auth(username, Some(password));
                }
                match body {
                    Some(payload) => request.json(payload),
                    None => request,
                }
            })
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            if let Some(message) = embedded_error_message(response).await {
                return Err(BezoekError::Provider(message));
            }
            return Err(status_error(StatusCode::BAD_REQUEST));
        }
        expect_success(response)
    }

    /// Send a request inside the session, logging in again once when the
    /// session has expired mid-operation.
    async fn request_json<P: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&P>,
    ) -> Result<Value, BezoekError> {
        self.ensure_authenticated().await?;
        let outcome = self.attempt(method.clone(), path, body, None).await;
        let response = match outcome {
            Err(BezoekError::Auth(_)) => {
                self.reauthenticate().await?;
                self.attempt(method, path, body, None).await?
            }
            other => other?,
        };
        decode_json(response).await
    }

    /// Like [`Self::request_json`] for endpoints whose body is irrelevant.
    async fn request_text(&self, method: Method, path: &str) -> Result<(), BezoekError> {
        self.ensure_authenticated().await?;
        let outcome = self.attempt(method.clone(), path, None::<&Value>, None).await;
        match outcome {
            Err(BezoekError::Auth(_)) => {
                self.reauthenticate().await?;
                self.attempt(method, path, None::<&Value>, None).await?;
            }
            other => {
                other?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ParkingProvider for TheHagueProvider {
    fn manifest(&self) -> &ProviderManifest {
        self.core.manifest()
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), BezoekError> {
        let username = require_credential(credentials, "username")?.to_owned();
        let password = require_credential(credentials, "password")?.to_owned();
        let provided_media_type = credentials
            .get("permit_media_type_id")
            .or_else(|| credentials.get("permitMediaTypeId"))
            .map(|value| normalize_media_type_id(value))
            .transpose()?;
        let stored_media_type = self.state.lock().await.permit_media_type_id.clone();
        // The handshake itself still carries the previously stored media
        // type header; the new value applies once the login succeeded.
        let media_type = provided_media_type.or(stored_media_type);
        self.attempt(
            Method::GET,
            SESSION_ENDPOINT,
            None::<&Value>,
            Some((&username, &password)),
        )
        .await?;
        let mut state = self.state.lock().await;
        let mut saved = Credentials::new();
        saved.insert(String::from("username"), username);
        saved.insert(String::from("password"), password);
        if let Some(media_type) = &media_type {
            saved.insert(String::from("permit_media_type_id"), media_type.clone());
        }
        state.credentials = Some(saved);
        state.permit_media_type_id = media_type;
        state.logged_in = true;
        debug!(provider = PROVIDER_ID, "login succeeded");
        Ok(())
    }

    async fn get_permit(&self) -> Result<Permit, BezoekError> {
        let account = self
            .request_json(Method::GET, ACCOUNT_ENDPOINT, None::<&Value>)
            .await?;
        map_permit(account)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, BezoekError> {
        let data = self
            .request_json(Method::GET, RESERVATION_ENDPOINT, None::<&Value>)
            .await?;
        map_reservation_list(data)
    }

    async fn start_reservation(
        &self,
        license_plate: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<Reservation, BezoekError> {
        validate_reservation_window(Some(start_time), Some(end_time), true)?;
        let start = truncate_subseconds(start_time);
        let end = truncate_subseconds(end_time);
        let plate = normalize_license_plate(license_plate)?;
        // The backend requires a name; default to the normalized plate.
        let label = name.filter(|value| !value.is_empty()).unwrap_or(plate.as_str());
        let payload = ReservationCreate {
            id: None,
            name: label,
            license_plate: &plate,
            start_time: format_timestamp(start),
            end_time: format_timestamp(end),
        };
        let data = self
            .request_json(Method::POST, RESERVATION_ENDPOINT, Some(&payload))
            .await?;
        map_reservation_value(data)
    }

    async fn update_reservation(
        &self,
        reservation_id: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        name: Option<&str>,
    ) -> Result<Reservation, BezoekError> {
        if start_time.is_some() || name.is_some() {
            return Err(BezoekError::Validation(String::from(
                "Only end_time can be updated.",
            )));
        }
        let Some(end_time) = end_time else {
            return Err(BezoekError::Validation(String::from("end_time is required.")));
        };
        let id = require_id(reservation_id, "reservation_id")?;
        let payload = ReservationPatch {
            end_time: format_timestamp(end_time),
        };
        let data = self
            .request_json(Method::PATCH, &format!("{RESERVATION_ENDPOINT}/{id}"), Some(&payload))
            .await?;
        map_reservation_value(data)
    }

    async fn end_reservation(
        &self,
        reservation_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Reservation, BezoekError> {
        let id = require_id(reservation_id, "reservation_id")?;
        let end = truncate_subseconds(end_time);
        let reservations = self.list_reservations().await?;
        let Some(existing) = reservations
            .into_iter()
            .find(|reservation| reservation.id == id)
        else {
            return Err(BezoekError::Validation(String::from(
                "reservation_id was not found.",
            )));
        };
        self.request_text(Method::DELETE, &format!("{RESERVATION_ENDPOINT}/{id}"))
            .await?;
        Ok(Reservation {
            end_time: end,
            ..existing
        })
    }

    async fn list_favorites(&self) -> Result<Vec<Favorite>, BezoekError> {
        let data = self
            .request_json(Method::GET, FAVORITE_ENDPOINT, None::<&Value>)
            .await?;
        map_favorite_list(data)
    }

    async fn add_favorite(
        &self,
        license_plate: &str,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        let plate = normalize_license_plate(license_plate)?;
        let existing = self.list_favorites().await?;
        if existing.iter().any(|favorite| favorite.license_plate == plate) {
            return Err(BezoekError::Validation(String::from(
                "license_plate is already a favorite.",
            )));
        }
        let label = name.filter(|value| !value.is_empty()).unwrap_or(plate.as_str());
        let payload = FavoriteWrite {
            name: label,
            license_plate: &plate,
        };
        let data = self
            .request_json(Method::POST, FAVORITE_ENDPOINT, Some(&payload))
            .await?;
        map_favorite_value(data)
    }

    async fn update_favorite_native(
        &self,
        favorite_id: &str,
        license_plate: Option<&str>,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        let id = require_id(favorite_id, "favorite_id")?;
        if license_plate.is_none() && name.is_none() {
            return Err(BezoekError::Validation(String::from(
                "license_plate or name is required.",
            )));
        }
        // Unspecified fields keep their stored value, so a partial update
        // needs the current favorite.
        let existing = if license_plate.is_none() || name.is_none() {
            let favorites = self.list_favorites().await?;
            let Some(found) = favorites.into_iter().find(|favorite| favorite.id == id) else {
                return Err(BezoekError::Validation(String::from(
                    "favorite_id was not found.",
                )));
            };
            Some(found)
        } else {
            None
        };
        let plate_source = license_plate
            .map(str::to_owned)
            .or_else(|| existing.as_ref().map(|favorite| favorite.license_plate.clone()));
        let Some(plate_source) = plate_source else {
            return Err(BezoekError::Validation(String::from("license_plate is required.")));
        };
        let plate = normalize_license_plate(&plate_source)?;
        let label = name
            .map(str::to_owned)
            .or_else(|| existing.as_ref().map(|favorite| favorite.name.clone()))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| plate.clone());
        let payload = FavoriteWrite {
            name: &label,
            license_plate: &plate,
        };
        let data = self
            .request_json(Method::PATCH, &format!("{FAVORITE_ENDPOINT}/{id}"), Some(&payload))
            .await?;
        map_favorite_value(data)
    }

    async fn remove_favorite(&self, favorite_id: &str) -> Result<(), BezoekError> {
        let id = require_id(favorite_id, "favorite_id")?;
        self.request_text(Method::DELETE, &format!("{FAVORITE_ENDPOINT}/{id}"))
            .await
    }
}

fn apply_headers(request: RequestBuilder, media_type: Option<&str>) -> RequestBuilder {
    let request = request
        .header(header::ACCEPT, "application/json")
        .header(header::USER_AGENT, USER_AGENT)
        .header(REQUESTED_WITH_HEADER, DEFAULT_REQUESTED_WITH);
    match media_type {
        Some(value) => request.header(PERMIT_MEDIA_TYPE_HEADER, value),
        None => request,
    }
}

fn normalize_media_type_id(value: &str) -> Result<String, BezoekError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(BezoekError::Validation(String::from(
            "permit_media_type_id must be non-empty.",
        )));
    }
    Ok(normalized.to_owned())
}

fn require_id(value: &str, field: &str) -> Result<String, BezoekError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BezoekError::Validation(format!("{field} is required.")));
    }
    Ok(trimmed.to_owned())
}

fn missing_field(field: &str) -> BezoekError {
    BezoekError::Provider(format!("Provider response missing {field}."))
}

fn invalid_data(entity: &str) -> BezoekError {
    BezoekError::Provider(format!("Provider returned invalid {entity} data."))
}

fn ensure_utc(raw: &str, entity: &str) -> Result<DateTime<Utc>, BezoekError> {
    parse_timestamp(raw).map_err(|_| invalid_data(entity))
}

fn map_permit(account: Value) -> Result<Permit, BezoekError> {
    let document: AccountDocument = serde_json::from_value(account).map_err(|_| {
        BezoekError::Provider(String::from("Provider response included invalid account data."))
    })?;
    let id = document
        .id
        .and_then(ResponseId::into_non_empty)
        .ok_or_else(|| missing_field("account id"))?;
    let remaining_balance = document.debit_minutes.as_ref().map_or(0, FlexibleInt::value);
    let zone_validity = match document.zone_validity {
        Some(entries) => map_zone_validity(entries)?,
        None => document
            .zone
            .map(|zone| map_zone_validity(vec![zone]))
            .transpose()?
            .unwrap_or_default(),
    };
    Ok(Permit {
        id,
        remaining_balance,
        zone_validity,
    })
}

fn map_zone_validity(entries: Vec<ValidityEntry>) -> Result<Vec<ZoneValidityBlock>, BezoekError> {
    let mut blocks = Vec::new();
    for entry in entries {
        let chargeable = entry.is_free != Some(true);
        let (Some(start_raw), Some(end_raw)) = (entry.start_time, entry.end_time) else {
            continue;
        };
        if start_raw.is_empty() || end_raw.is_empty() {
            continue;
        }
        let start_time = ensure_utc(&start_raw, "zone validity")?;
        let end_time = ensure_utc(&end_raw, "zone validity")?;
        blocks.push((
            ZoneValidityBlock {
                start_time,
                end_time,
            },
            chargeable,
        ));
    }
    Ok(filter_chargeable(blocks))
}

fn map_reservation_list(data: Value) -> Result<Vec<Reservation>, BezoekError> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    let documents: Vec<ReservationDocument> = serde_json::from_value(data).map_err(|_| {
        BezoekError::Provider(String::from("Provider response included invalid reservations."))
    })?;
    documents.into_iter().map(map_reservation).collect()
}

fn map_reservation_value(data: Value) -> Result<Reservation, BezoekError> {
    let document: ReservationDocument = serde_json::from_value(data).map_err(|_| {
        BezoekError::Provider(String::from(
            "Provider response included invalid reservation data.",
        ))
    })?;
    map_reservation(document)
}

fn map_reservation(document: ReservationDocument) -> Result<Reservation, BezoekError> {
    let id = document
        .id
        .and_then(ResponseId::into_non_empty)
        .ok_or_else(|| missing_field("reservation id"))?;
    let (Some(plate_raw), Some(start_raw), Some(end_raw)) =
        (document.license_plate, document.start_time, document.end_time)
    else {
        return Err(BezoekError::Provider(String::from(
            "Provider response missing reservation fields.",
        )));
    };
    let license_plate =
        normalize_license_plate(&plate_raw).map_err(|_| invalid_data("reservation"))?;
    let start_time = ensure_utc(&start_raw, "reservation")?;
    let end_time = ensure_utc(&end_raw, "reservation")?;
    let name = document
        .name
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| license_plate.clone());
    Ok(Reservation {
        id,
        name,
        license_plate,
        start_time,
        end_time,
    })
}

fn map_favorite_list(data: Value) -> Result<Vec<Favorite>, BezoekError> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    let documents: Vec<FavoriteDocument> = serde_json::from_value(data).map_err(|_| {
        BezoekError::Provider(String::from("Provider response included invalid favorites."))
    })?;
    documents.into_iter().map(map_favorite).collect()
}

fn map_favorite_value(data: Value) -> Result<Favorite, BezoekError> {
    let document: FavoriteDocument = serde_json::from_value(data).map_err(|_| {
        BezoekError::Provider(String::from("Provider response included invalid favorite data."))
    })?;
    map_favorite(document)
}

fn map_favorite(document: FavoriteDocument) -> Result<Favorite, BezoekError> {
    let id = document
        .id
        .and_then(ResponseId::into_non_empty)
        .ok_or_else(|| missing_field("favorite id"))?;
    let Some(plate_raw) = document.license_plate else {
        return Err(BezoekError::Provider(String::from(
            "Provider response missing favorite fields.",
        )));
    };
    let license_plate =
        normalize_license_plate(&plate_raw).map_err(|_| invalid_data("favorite"))?;
    let name = document
        .name
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| license_plate.clone());
    Ok(Favorite {
        id,
        name,
        license_plate,
    })
}

/// Normalize a backend error code: lowercase, with leading zeros stripped
/// from every digit run. Codes containing anything but ASCII alphanumerics
/// are not translatable.
fn normalize_error_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|symbol| symbol.is_ascii_alphanumeric()) {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    let mut normalized = String::with_capacity(lowered.len());
    let mut digits = String::new();
    for symbol in lowered.chars() {
        if symbol.is_ascii_digit() {
            digits.push(symbol);
        } else {
            flush_digit_run(&mut normalized, &mut digits);
            normalized.push(symbol);
        }
    }
    flush_digit_run(&mut normalized, &mut digits);
    Some(normalized)
}

fn flush_digit_run(target: &mut String, digits: &mut String) {
    if digits.is_empty() {
        return;
    }
    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        target.push('0');
    } else {
        target.push_str(stripped);
    }
    digits.clear();
}

fn error_message_for_code(raw: &str) -> Option<String> {
    let code = normalize_error_code(raw)?;
    let translation = ERROR_MESSAGES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, message)| *message);
    Some(match translation {
        Some(message) => format!("Provider error {code}: {message}"),
        None => format!("Provider error {code}."),
    })
}

async fn embedded_error_message(response: Response) -> Option<String> {
    let document: ErrorDocument = response.json().await.ok()?;
    error_message_for_code(document.description.as_deref()?)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn manifest() -> ProviderManifest {
        bezoek_core::manifest::parse_manifest(include_str!("../manifest.json"), PROVIDER_ID)
            .unwrap()
    }

    fn provider(base_url: &str) -> TheHagueProvider {
        let config = ProviderConfig {
            base_url: Some(base_url.to_owned()),
            ..ProviderConfig::default()
        };
        TheHagueProvider::new(Client::new(), manifest(), config).unwrap()
    }

    fn credentials(pairs: &[(&str, &str)]) -> Credentials {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    async fn seeded_provider(
        base_url: &str,
        media_type: Option<&str>,
        saved: Credentials,
    ) -> TheHagueProvider {
        let provider = provider(base_url);
        {
            let mut state = provider.state.lock().await;
            state.credentials = Some(saved);
            state.permit_media_type_id = media_type.map(str::to_owned);
            state.logged_in = true;
        }
        provider
    }

    fn account_sample() -> Value {
        json!({
            "id": 42,
            "debit_minutes": 90,
            "reservation_count": 1,
            "zone_validity": [
                {
                    "is_free": true,
                    "start_time": "2024-01-01T09:00:00+01:00",
                    "end_time": "2024-01-01T18:00:00+01:00"
                },
                {
                    "is_free": false,
                    "start_time": "2024-01-02T09:00:00+01:00",
                    "end_time": "2024-01-02T18:00:00+01:00"
                }
            ]
        })
    }

    #[test]
    fn map_permit_filters_free_blocks_and_converts_utc() {
        let permit = map_permit(account_sample()).unwrap();
        assert_eq!(permit.id, "42");
        assert_eq!(permit.remaining_balance, 90);
        assert_eq!(permit.zone_validity.len(), 1);
        let block = permit.zone_validity.first().unwrap();
        assert_eq!(format_timestamp(block.start_time), "2024-01-02T08:00:00Z");
        assert_eq!(format_timestamp(block.end_time), "2024-01-02T17:00:00Z");
    }

    #[test]
    fn map_permit_uses_zone_fallback_when_list_is_missing() {
        let permit = map_permit(json!({
            "id": 7,
            "debit_minutes": 120,
            "zone": {
                "id": "10",
                "name": "Benoordenhout",
                "start_time": "2025-12-19T08:00:00Z",
                "end_time": "2025-12-19T23:00:00Z"
            }
        }))
        .unwrap();
        assert_eq!(permit.zone_validity.len(), 1);
        let block = permit.zone_validity.first().unwrap();
        assert_eq!(format_timestamp(block.start_time), "2025-12-19T08:00:00Z");
        assert_eq!(format_timestamp(block.end_time), "2025-12-19T23:00:00Z");
    }

    #[test]
    fn map_permit_accepts_numeric_strings_and_defaults_balance() {
        let permit = map_permit(json!({"id": "9", "debit_minutes": "120"})).unwrap();
        assert_eq!(permit.remaining_balance, 120);
        let permit = map_permit(json!({"id": "9", "debit_minutes": true})).unwrap();
        assert_eq!(permit.remaining_balance, 0);
    }

    #[test]
    fn map_permit_rejects_malformed_documents() {
        let err = map_permit(json!({"id": 9, "zone_validity": "invalid"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provider response included invalid account data."
        );
        let err = map_permit(json!({"debit_minutes": 1})).unwrap_err();
        assert_eq!(err.to_string(), "Provider response missing account id.");
    }

    #[test]
    fn map_reservation_normalizes_plate_and_utc() {
        let reservation = map_reservation_value(json!({
            "id": 123,
            "name": "Visitor",
            "license_plate": "ab-12 cd",
            "start_time": "2024-01-01T10:00:00+02:00",
            "end_time": "2024-01-01T11:00:00+02:00"
        }))
        .unwrap();
        assert_eq!(reservation.id, "123");
        assert_eq!(reservation.name, "Visitor");
        assert_eq!(reservation.license_plate, "AB12CD");
        assert_eq!(format_timestamp(reservation.start_time), "2024-01-01T08:00:00Z");
        assert_eq!(format_timestamp(reservation.end_time), "2024-01-01T09:00:00Z");
    }

    #[test]
    fn map_reservation_requires_core_fields() {
        let err = map_reservation_value(json!({"id": 1, "license_plate": "AB12CD"})).unwrap_err();
        assert_eq!(err.to_string(), "Provider response missing reservation fields.");
        let err = map_reservation_value(json!({"name": "x"})).unwrap_err();
        assert_eq!(err.to_string(), "Provider response missing reservation id.");
    }

    #[test]
    fn map_reservation_defaults_name_to_plate() {
        let reservation = map_reservation_value(json!({
            "id": 5,
            "license_plate": "xy-99-zz",
            "start_time": "2024-01-01T10:00:00Z",
            "end_time": "2024-01-01T11:00:00Z"
        }))
        .unwrap();
        assert_eq!(reservation.name, "XY99ZZ");
    }

    #[test]
    fn map_favorite_normalizes_plate() {
        let favorite = map_favorite_value(json!({
            "id": 9,
            "name": "Family",
            "license_plate": "xy-99-zz"
        }))
        .unwrap();
        assert_eq!(favorite.id, "9");
        assert_eq!(favorite.name, "Family");
        assert_eq!(favorite.license_plate, "XY99ZZ");
    }

    #[test]
    fn error_code_normalization_tiers() {
        assert_eq!(
            error_message_for_code("PV00076").unwrap(),
            "Provider error pv76: No paid parking at this time"
        );
        assert_eq!(
            error_message_for_code("pv00076").unwrap(),
            "Provider error pv76: No paid parking at this time"
        );
        assert_eq!(error_message_for_code("pv999").unwrap(), "Provider error pv999.");
        assert_eq!(error_message_for_code("###"), None);
        assert_eq!(error_message_for_code("  "), None);
    }

    #[tokio::test]
    async fn operations_require_authentication_before_any_request() {
        let server = MockServer::start();
        let account = server.mock(|when, then| {
            when.method(GET).path("/api/account/0");
            then.status(200).json_body(json!({"id": 1}));
        });
        let provider = provider(&server.base_url());
        let err = provider.get_permit().await.unwrap_err();
        assert_eq!(err.to_string(), "Authentication required.");
        account.assert_hits(0);
    }

    #[tokio::test]
    async fn expired_session_is_reauthenticated_once_and_retried() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(GET).path("/api/session/0");
            then.status(200);
        });
        let stale = server.mock(|when, then| {
            when.method(GET)
                .path("/api/account/0")
                .header(PERMIT_MEDIA_TYPE_HEADER, "old");
            then.status(401);
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/api/account/0")
                .header(PERMIT_MEDIA_TYPE_HEADER, "2");
            then.status(200).json_body(json!({"id": 1, "debit_minutes": 30}));
        });
        let provider = seeded_provider(
            &server.base_url(),
            Some("old"),
            credentials(&[
                ("username", "resident"),
                ("password", "secret"),
                ("permit_media_type_id", "2"),
            ]),
        )
        .await;
        let permit = provider.get_permit().await.unwrap();
        assert_eq!(permit.id, "1");
        stale.assert();
        login.assert();
        fresh.assert();
    }

    #[tokio::test]
    async fn reauthentication_happens_at_most_once() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(GET).path("/api/session/0");
            then.status(200);
        });
        let account = server.mock(|when, then| {
            when.method(GET).path("/api/account/0");
            then.status(401);
        });
        let provider = seeded_provider(
            &server.base_url(),
            None,
            credentials(&[("username", "resident"), ("password", "secret")]),
        )
        .await;
        let err = provider.get_permit().await.unwrap_err();
        assert_eq!(err.to_string(), "Authentication failed.");
        account.assert_hits(2);
        login.assert_hits(1);
    }
}
