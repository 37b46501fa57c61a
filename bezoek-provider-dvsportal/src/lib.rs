//! Provider adapter for DVSPortal-based municipalities.
//!
//! The backend serves one aggregate document: `POST login/getbase` returns
//! the permit, its media cards, active reservations, and stored plates in a
//! single response, and every mutation answers with the same aggregate.
//! Session state is therefore held under one lock for a whole operation, so
//! the fetch, the mutation, and the refetched aggregate cannot interleave
//! with a concurrent caller.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::Europe::Amsterdam;
use reqwest::{Client, Method, Response, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bezoek_core::{
    error::BezoekError,
    http::{decode_json, expect_success},
    manifest::ProviderManifest,
    model::{Credentials, Favorite, Permit, Reservation, ZoneValidityBlock},
    normalize::{
        filter_chargeable, local_naive_to_utc, normalize_license_plate, parse_timestamp,
        truncate_subseconds, validate_reservation_window,
    },
    provider::{ParkingProvider, ProviderConfig, ProviderCore, require_credential},
    registry::ProviderRegistration,
};

/// Identifier this adapter registers under.
pub const PROVIDER_ID: &str = "dvsportal";

const DEFAULT_API_URI: &str = "DVSWebAPI/api";
const LOGIN_ENDPOINT: &str = "/login";
const GETBASE_ENDPOINT: &str = "/login/getbase";
const RESERVATION_CREATE_ENDPOINT: &str = "/reservation/create";
const RESERVATION_UPDATE_ENDPOINT: &str = "/reservation/update";
const RESERVATION_END_ENDPOINT: &str = "/reservation/end";
const FAVORITE_UPSERT_ENDPOINT: &str = "/permitmedialicenseplate/upsert";
const FAVORITE_REMOVE_ENDPOINT: &str = "/permitmedialicenseplate/remove";
const USER_AGENT: &str = "bezoek-dvsportal";

const LOGIN_METHOD: &str = "Pas";

/// Backend timestamps without an offset, in provider-local civil time.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Registration consumed by the provider registry.
#[must_use]
pub fn registration() -> ProviderRegistration {
    ProviderRegistration {
        id: PROVIDER_ID,
        manifest_json: include_str!("../manifest.json"),
        build: |client, manifest, config| {
            Ok(Box::new(DvsPortalProvider::new(client, manifest, config)?))
        },
    }
}

/// Permit media type id; the backend uses numbers and strings
/// interchangeably and expects whichever form it handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum MediaTypeId {
    Number(i64),
    Text(String),
}

fn media_type_from_value(value: &Value) -> Option<MediaTypeId> {
    match value {
        Value::Number(number) => number.as_i64().map(MediaTypeId::Number),
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| MediaTypeId::Text(trimmed.to_owned()))
        }
        _ => None,
    }
}

fn media_type_label(value: &MediaTypeId) -> String {
    match value {
        MediaTypeId::Number(number) => number.to_string(),
        MediaTypeId::Text(text) => text.clone(),
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    #[serde(rename = "loginMethod")]
    login_method: &'a str,
    password: &'a str,
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
}

#[derive(Serialize)]
struct ReservationCreateRequest<'a> {
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
    #[serde(rename = "permitMediaCode")]
    permit_media_code: &'a str,
    #[serde(rename = "DateFrom")]
    date_from: String,
    #[serde(rename = "DateUntil")]
    date_until: String,
    #[serde(rename = "LicensePlate")]
    license_plate: PlatePayload<'a>,
}

#[derive(Serialize)]
struct ReservationUpdateRequest<'a> {
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
    #[serde(rename = "permitMediaCode")]
    permit_media_code: &'a str,
    #[serde(rename = "ReservationID")]
    reservation_id: &'a str,
    #[serde(rename = "Minutes")]
    minutes: i64,
}

#[derive(Serialize)]
struct ReservationEndRequest<'a> {
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
    #[serde(rename = "permitMediaCode")]
    permit_media_code: &'a str,
    #[serde(rename = "ReservationID")]
    reservation_id: &'a str,
}

#[derive(Serialize)]
struct FavoriteUpsertRequest<'a> {
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
    #[serde(rename = "permitMediaCode")]
    permit_media_code: &'a str,
    #[serde(rename = "licensePlate")]
    license_plate: PlatePayload<'a>,
    #[serde(rename = "updateLicensePlate")]
    update_license_plate: Option<&'a str>,
}

#[derive(Serialize)]
struct FavoriteRemoveRequest<'a> {
    #[serde(rename = "permitMediaTypeID")]
    permit_media_type_id: &'a MediaTypeId,
    #[serde(rename = "permitMediaCode")]
    permit_media_code: &'a str,
    #[serde(rename = "licensePlate")]
    license_plate: &'a str,
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct PlatePayload<'a> {
    #[serde(rename = "Value")]
    value: &'a str,
    #[serde(rename = "Name")]
    name: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct LoginResponse {
    login_status: Option<Value>,
    token: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct BaseEnvelope {
    permit: Option<PermitAggregate>,
    permits: Option<Vec<PermitAggregate>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct PermitAggregate {
    zone_code: Option<Value>,
    block_times: Option<Vec<BlockTime>>,
    permit_medias: Option<Vec<PermitMedia>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct BlockTime {
    is_free: Option<bool>,
    valid_from: Option<String>,
    valid_until: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct PermitMedia {
    #[serde(rename = "TypeID")]
    type_id: Option<Value>,
    code: Option<Value>,
    balance: Option<Value>,
    active_reservations: Option<Vec<WireReservation>>,
    license_plates: Option<Vec<WirePlate>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct WireReservation {
    #[serde(rename = "ReservationID")]
    reservation_id: Option<Value>,
    valid_from: Option<String>,
    valid_until: Option<String>,
    license_plate: Option<WirePlate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct WirePlate {
    value: Option<String>,
    display_value: Option<String>,
    name: Option<String>,
}

#[derive(Default)]
struct SessionState {
    auth_header: Option<String>,
    credentials: Option<Credentials>,
    media_type_id: Option<MediaTypeId>,
    media_code: Option<String>,
}

/// DVSPortal visitor parking adapter.
pub struct DvsPortalProvider {
    core: ProviderCore,
    state: Mutex<SessionState>,
}

impl DvsPortalProvider {
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

    async fn attempt<P: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&P>,
        auth_header: Option<&str>,
    ) -> Result<Response, BezoekError> {
        let response = self
            .core
            .send(method, path, |request| {
                let mut request = request
                    .header(header::ACCEPT, "application/json")
                    .header(header::USER_AGENT, USER_AGENT);
                if let Some(value) = auth_header {
                    request = request.header(header::AUTHORIZATION, value);
                }
                match body {
                    Some(payload) => request.json(payload),
                    None => request,
                }
            })
            .await?;
        expect_success(response)
    }

    /// Discover the permit media type through the unauthenticated login
    /// handshake.
    async fn fetch_media_type_id(&self) -> Result<MediaTypeId, BezoekError> {
        let response = self.attempt(Method::GET, LOGIN_ENDPOINT, None::<&Value>, None).await?;
        let data: Value = decode_json(response).await?;
        extract_media_type_id(&data)
    }

    async fn login_locked(
        &self,
        state: &mut SessionState,
        credentials: &Credentials,
    ) -> Result<(), BezoekError> {
        debug!(provider = PROVIDER_ID, "login started");
        let identifier = require_credential(credentials, "identifier")?.to_owned();
        let password = require_credential(credentials, "password")?.to_owned();
        let provided = non_empty_credential(credentials, "permit_media_type_id")
            .or_else(|| non_empty_credential(credentials, "permitMediaTypeID"))
            .map(MediaTypeId::Text);
        let media_type = match provided.or_else(|| state.media_type_id.clone()) {
            Some(value) => value,
            None => self.fetch_media_type_id().await?,
        };
        let payload = LoginRequest {
            identifier: &identifier,
            login_method: LOGIN_METHOD,
            password: &password,
            permit_media_type_id: &media_type,
        };
        let response = self.attempt(Method::POST, LOGIN_ENDPOINT, Some(&payload), None).await?;
        let login: LoginResponse = decode_json(response).await?;
        if login_rejected(login.login_status.as_ref()) {
            return Err(BezoekError::Auth(String::from("Authentication failed.")));
        }
        let Some(token) = login.token.as_ref().and_then(value_to_id) else {
            return Err(BezoekError::Auth(String::from("Authentication failed.")));
        };

        let mut saved = Credentials::new();
        saved.insert(String::from("identifier"), identifier);
        saved.insert(String::from("password"), password);
        saved.insert(
            String::from("permit_media_type_id"),
            media_type_label(&media_type),
        );

        state.auth_header = Some(format!("Token {}", STANDARD.encode(token)));
        state.media_type_id = Some(media_type);
        state.credentials = Some(saved);
        debug!(provider = PROVIDER_ID, "login completed");
        Ok(())
    }

    async fn ensure_authenticated(&self, state: &mut SessionState) -> Result<(), BezoekError> {
        if state.auth_header.is_some() {
            return Ok(());
        }
        let Some(credentials) = state.credentials.clone() else {
            return Err(BezoekError::Auth(String::from("Authentication required.")));
        };
        self.login_locked(state, &credentials).await
    }

    /// Send an authenticated request, logging in again once when the token
    /// has been rejected mid-operation.
    async fn request_json_auth<P: Serialize + Sync>(
        &self,
        state: &mut SessionState,
        method: Method,
        path: &str,
        body: Option<&P>,
    ) -> Result<Value, BezoekError> {
        self.ensure_authenticated(state).await?;
        let auth_header = state.auth_header.clone();
        let outcome = self.attempt(method.clone(), path, body, auth_header.as_deref()).await;
        let response = match outcome {
            Err(BezoekError::Auth(_)) => {
                warn!(provider = PROVIDER_ID, "token rejected, logging in again");
                state.auth_header = None;
                let Some(credentials) = state.credentials.clone() else {
                    return Err(BezoekError::Auth(String::from("Authentication required.")));
                };
                self.login_locked(state, &credentials).await?;
                let auth_header = state.auth_header.clone();
                self.attempt(method, path, body, auth_header.as_deref()).await?
            }
            other => other?,
        };
        decode_json(response).await
    }

    async fn fetch_base(&self, state: &mut SessionState) -> Result<PermitAggregate, BezoekError> {
        let data = self
            .request_json_auth(state, Method::POST, GETBASE_ENDPOINT, None::<&Value>)
            .await?;
        decode_aggregate(state, data)
    }

    /// Make sure the permit media type and code are known, fetching the
    /// aggregate once when they are not.
    async fn ensure_defaults(
        &self,
        state: &mut SessionState,
    ) -> Result<(MediaTypeId, String), BezoekError> {
        self.ensure_authenticated(state).await?;
        if state.media_type_id.is_none() || state.media_code.is_none() {
            self.fetch_base(state).await?;
        }
        match (state.media_type_id.clone(), state.media_code.clone()) {
            (Some(type_id), Some(code)) => Ok((type_id, code)),
            _ => Err(BezoekError::Provider(String::from(
                "Permit media defaults are missing.",
            ))),
        }
    }
}

#[async_trait]
impl ParkingProvider for DvsPortalProvider {
    fn manifest(&self) -> &ProviderManifest {
        self.core.manifest()
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), BezoekError> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state, credentials).await
    }

    async fn get_permit(&self) -> Result<Permit, BezoekError> {
        let mut state = self.state.lock().await;
        let permit = self.fetch_base(&mut state).await?;
        map_permit(&permit)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, BezoekError> {
        let mut state = self.state.lock().await;
        let permit = self.fetch_base(&mut state).await?;
        map_reservations(select_permit_media(&permit)?)
    }

    async fn start_reservation(
        &self,
        license_plate: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<Reservation, BezoekError> {
        debug!(provider = PROVIDER_ID, "start_reservation started");
        validate_reservation_window(Some(start_time), Some(end_time), true)?;
        let start = truncate_subseconds(start_time);
        let end = truncate_subseconds(end_time);
        let plate = normalize_license_plate(license_plate)?;

        let mut state = self.state.lock().await;
        let (media_type, media_code) = self.ensure_defaults(&mut state).await?;
        let payload = ReservationCreateRequest {
            permit_media_type_id: &media_type,
            permit_media_code: &media_code,
            date_from: format_local(start),
            date_until: format_local(end),
            license_plate: PlatePayload { value: &plate, name },
        };
        let data = self
            .request_json_auth(&mut state, Method::POST, RESERVATION_CREATE_ENDPOINT, Some(&payload))
            .await?;
        let permit = decode_aggregate(&mut state, data)?;
        let reservations = map_reservations(select_permit_media(&permit)?)?;
        let reservation =
            select_created(reservations, &plate, start, end).ok_or_else(reservation_not_returned)?;
        debug!(provider = PROVIDER_ID, "start_reservation completed");
        Ok(reservation)
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
        let end = truncate_subseconds(end_time);

        let mut state = self.state.lock().await;
        let (media_type, media_code) = self.ensure_defaults(&mut state).await?;
        let permit = self.fetch_base(&mut state).await?;
        let reservations = map_reservations(select_permit_media(&permit)?)?;
        let Some(existing) = find_by_id(&reservations, reservation_id) else {
            return Err(BezoekError::Validation(String::from(
                "reservation_id was not found.",
            )));
        };
        // The backend moves the end by a signed whole-minute delta.
        let delta_seconds = (end - existing.end_time).num_seconds();
        if delta_seconds % 60 != 0 {
            return Err(BezoekError::Validation(String::from(
                "end_time must differ by whole minutes.",
            )));
        }
        let payload = ReservationUpdateRequest {
            permit_media_type_id: &media_type,
            permit_media_code: &media_code,
            reservation_id: &existing.id,
            minutes: delta_seconds / 60,
        };
        let data = self
            .request_json_auth(&mut state, Method::POST, RESERVATION_UPDATE_ENDPOINT, Some(&payload))
            .await?;
        let permit = decode_aggregate(&mut state, data)?;
        let reservations = map_reservations(select_permit_media(&permit)?)?;
        find_by_id(&reservations, &existing.id).ok_or_else(reservation_not_returned)
    }

    async fn end_reservation(
        &self,
        reservation_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Reservation, BezoekError> {
        let end = truncate_subseconds(end_time);
        let mut state = self.state.lock().await;
        let (media_type, media_code) = self.ensure_defaults(&mut state).await?;
        let permit = self.fetch_base(&mut state).await?;
        let reservations = map_reservations(select_permit_media(&permit)?)?;
        let Some(existing) = find_by_id(&reservations, reservation_id) else {
            return Err(BezoekError::Validation(String::from(
                "reservation_id was not found.",
            )));
        };
        let payload = ReservationEndRequest {
            permit_media_type_id: &media_type,
            permit_media_code: &media_code,
            reservation_id: &existing.id,
        };
        let data = self
            .request_json_auth(&mut state, Method::POST, RESERVATION_END_ENDPOINT, Some(&payload))
            .await?;
        decode_aggregate(&mut state, data)?;
        Ok(Reservation {
            end_time: end,
            ..existing
        })
    }

    async fn list_favorites(&self) -> Result<Vec<Favorite>, BezoekError> {
        let mut state = self.state.lock().await;
        let permit = self.fetch_base(&mut state).await?;
        map_favorites(select_permit_media(&permit)?)
    }

    async fn add_favorite(
        &self,
        license_plate: &str,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        let plate = normalize_license_plate(license_plate)?;
        let mut state = self.state.lock().await;
        let (media_type, media_code) = self.ensure_defaults(&mut state).await?;
        let payload = FavoriteUpsertRequest {
            permit_media_type_id: &media_type,
            permit_media_code: &media_code,
            license_plate: PlatePayload { value: &plate, name },
            update_license_plate: None,
        };
        let data = self
            .request_json_auth(&mut state, Method::POST, FAVORITE_UPSERT_ENDPOINT, Some(&payload))
            .await?;
        let permit = decode_aggregate(&mut state, data)?;
        let favorites = map_favorites(select_permit_media(&permit)?)?;
        select_favorite(favorites, &plate).ok_or_else(favorite_not_returned)
    }

    async fn update_favorite_native(
        &self,
        _favorite_id: &str,
        _license_plate: Option<&str>,
        _name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        Err(BezoekError::Provider(String::from(
            "Favorite updates are not supported.",
        )))
    }

    async fn remove_favorite(&self, favorite_id: &str) -> Result<(), BezoekError> {
        // Favorite ids are normalized plates on this backend.
        let plate = normalize_license_plate(favorite_id)?;
        let mut state = self.state.lock().await;
        let (media_type, media_code) = self.ensure_defaults(&mut state).await?;
        let permit = self.fetch_base(&mut state).await?;
        let stored_name = map_favorites(select_permit_media(&permit)?)?
            .into_iter()
            .find(|favorite| favorite.license_plate == plate)
            .map(|favorite| favorite.name);
        let payload = FavoriteRemoveRequest {
            permit_media_type_id: &media_type,
            permit_media_code: &media_code,
            license_plate: &plate,
            name: stored_name.as_deref(),
        };
        self.request_json_auth(&mut state, Method::POST, FAVORITE_REMOVE_ENDPOINT, Some(&payload))
            .await?;
        Ok(())
    }
}

fn non_empty_credential(credentials: &Credentials, key: &str) -> Option<String> {
    credentials
        .get(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn flexible_int(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number.as_i64().unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

fn login_rejected(status: Option<&Value>) -> bool {
    match status {
        Some(Value::Number(number)) => number.as_i64() == Some(2),
        Some(Value::String(text)) => {
            !text.is_empty()
                && text.chars().all(|symbol| symbol.is_ascii_digit())
                && text.parse::<i64>().is_ok_and(|status| status == 2)
        }
        _ => false,
    }
}

fn extract_media_type_id(data: &Value) -> Result<MediaTypeId, BezoekError> {
    let types = data
        .get("PermitMediaTypes")
        .and_then(Value::as_array)
        .filter(|types| !types.is_empty())
        .ok_or_else(|| {
            BezoekError::Provider(String::from("Provider did not return permit media types."))
        })?;
    types
        .first()
        .and_then(|entry| entry.get("ID"))
        .and_then(media_type_from_value)
        .ok_or_else(|| {
            BezoekError::Provider(String::from(
                "Provider did not return a permit media type ID.",
            ))
        })
}

fn missing_permit() -> BezoekError {
    BezoekError::Provider(String::from("Provider response did not include permit data."))
}

fn reservation_not_returned() -> BezoekError {
    BezoekError::Provider(String::from("Reservation was not returned by the provider."))
}

fn favorite_not_returned() -> BezoekError {
    BezoekError::Provider(String::from("Favorite was not returned by the provider."))
}

fn invalid_data(entity: &str) -> BezoekError {
    BezoekError::Provider(format!("Provider returned invalid {entity} data."))
}

/// Pull the permit aggregate out of a response and refresh the cached
/// media defaults from it.
fn decode_aggregate(
    state: &mut SessionState,
    data: Value,
) -> Result<PermitAggregate, BezoekError> {
    let envelope: BaseEnvelope = serde_json::from_value(data).map_err(|_| missing_permit())?;
    let permit = envelope
        .permit
        .or_else(|| envelope.permits.and_then(|permits| permits.into_iter().next()))
        .ok_or_else(missing_permit)?;
    cache_defaults(state, &permit);
    Ok(permit)
}

fn cache_defaults(state: &mut SessionState, permit: &PermitAggregate) {
    let Some(media) = permit.permit_medias.as_deref().and_then(<[PermitMedia]>::first) else {
        return;
    };
    if let Some(type_id) = media.type_id.as_ref().and_then(media_type_from_value) {
        state.media_type_id = Some(type_id);
    }
    if let Some(code) = media.code.as_ref().and_then(Value::as_str) {
        let trimmed = code.trim();
        if !trimmed.is_empty() {
            state.media_code = Some(trimmed.to_owned());
        }
    }
}

fn select_permit_media(permit: &PermitAggregate) -> Result<&PermitMedia, BezoekError> {
    permit
        .permit_medias
        .as_deref()
        .and_then(<[PermitMedia]>::first)
        .ok_or_else(|| {
            BezoekError::Provider(String::from(
                "Provider response did not include permit media.",
            ))
        })
}

fn map_permit(permit: &PermitAggregate) -> Result<Permit, BezoekError> {
    let media = select_permit_media(permit)?;
    let id = media
        .code
        .as_ref()
        .and_then(value_to_id)
        .or_else(|| permit.zone_code.as_ref().and_then(value_to_id))
        .unwrap_or_else(|| String::from("permit"));
    let remaining_balance = media.balance.as_ref().map_or(0, flexible_int);
    let zone_validity = map_zone_validity(permit.block_times.as_deref().unwrap_or_default())?;
    Ok(Permit {
        id,
        remaining_balance,
        zone_validity,
    })
}

fn map_zone_validity(blocks: &[BlockTime]) -> Result<Vec<ZoneValidityBlock>, BezoekError> {
    let mut entries = Vec::new();
    for block in blocks {
        let (Some(start_raw), Some(end_raw)) = (
            non_blank(block.valid_from.as_deref()),
            non_blank(block.valid_until.as_deref()),
        ) else {
            continue;
        };
        let start = parse_provider_timestamp(start_raw).map_err(|_| invalid_data("block time"))?;
        let end = parse_provider_timestamp(end_raw).map_err(|_| invalid_data("block time"))?;
        let chargeable = block.is_free != Some(true);
        entries.push((
            ZoneValidityBlock {
                start_time: start,
                end_time: end,
            },
            chargeable,
        ));
    }
    Ok(filter_chargeable(entries))
}

fn map_reservations(media: &PermitMedia) -> Result<Vec<Reservation>, BezoekError> {
    let mut reservations = Vec::new();
    for item in media.active_reservations.as_deref().unwrap_or_default() {
        let Some(id) = item.reservation_id.as_ref().and_then(value_to_id) else {
            continue;
        };
        let (Some(start_raw), Some(end_raw)) = (
            non_blank(item.valid_from.as_deref()),
            non_blank(item.valid_until.as_deref()),
        ) else {
            continue;
        };
        let Some(plate_info) = &item.license_plate else {
            continue;
        };
        let Some(plate_raw) = non_blank(plate_info.value.as_deref())
            .or_else(|| non_blank(plate_info.display_value.as_deref()))
        else {
            continue;
        };
        let license_plate =
            normalize_license_plate(plate_raw).map_err(|_| invalid_data("reservation"))?;
        let start = parse_provider_timestamp(start_raw).map_err(|_| invalid_data("reservation"))?;
        let end = parse_provider_timestamp(end_raw).map_err(|_| invalid_data("reservation"))?;
        let name = non_blank(plate_info.display_value.as_deref())
            .unwrap_or(plate_raw)
            .to_owned();
        reservations.push(Reservation {
            id,
            name,
            license_plate,
            start_time: start,
            end_time: end,
        });
    }
    Ok(reservations)
}

fn map_favorites(media: &PermitMedia) -> Result<Vec<Favorite>, BezoekError> {
    let mut favorites = Vec::new();
    for item in media.license_plates.as_deref().unwrap_or_default() {
        let Some(plate_raw) = non_blank(item.value.as_deref()) else {
            continue;
        };
        let license_plate =
            normalize_license_plate(plate_raw).map_err(|_| invalid_data("favorite"))?;
        let name = non_blank(item.name.as_deref())
            .map_or_else(|| license_plate.clone(), str::to_owned);
        favorites.push(Favorite {
            id: license_plate.clone(),
            name,
            license_plate,
        });
    }
    Ok(favorites)
}

/// Normalize a backend timestamp: offset ISO 8601 or naive provider-local
/// civil time.
fn parse_provider_timestamp(raw: &str) -> Result<DateTime<Utc>, BezoekError> {
    if let Ok(parsed) = parse_timestamp(raw) {
        return Ok(parsed);
    }
    let trimmed = raw.trim();
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(truncate_subseconds(local_naive_to_utc(naive, Amsterdam)));
        }
    }
    Err(BezoekError::Validation(String::from(
        "Provider timestamp is not a valid ISO 8601 value.",
    )))
}

fn format_local(value: DateTime<Utc>) -> String {
    value
        .with_timezone(&Amsterdam)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn find_by_id(reservations: &[Reservation], id: &str) -> Option<Reservation> {
    reservations
        .iter()
        .find(|reservation| reservation.id == id)
        .cloned()
}

/// The created reservation: exact match on plate and window, else the
/// first one the aggregate reports.
fn select_created(
    reservations: Vec<Reservation>,
    plate: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<Reservation> {
    if let Some(found) = reservations.iter().find(|reservation| {
        reservation.license_plate == plate
            && reservation.start_time == start
            && reservation.end_time == end
    }) {
        return Some(found.clone());
    }
    reservations.into_iter().next()
}

fn select_favorite(favorites: Vec<Favorite>, plate: &str) -> Option<Favorite> {
    if let Some(found) = favorites.iter().find(|favorite| favorite.license_plate == plate) {
        return Some(found.clone());
    }
    favorites.into_iter().next()
}
