//! Provider adapter for Amsterdam visitor parking (EGIS Parking Services).
//!
//! Authentication is a JWT bearer token whose claims carry the client
//! product id and role list. Discovery fallbacks fill in whatever context
//! the token does not provide: the client product list, the paid parking
//! zone list for the product, and per-machine paid zone time frames.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::Europe::Amsterdam;
use reqwest::{Client, Method, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bezoek_core::{
    error::BezoekError,
    http::{decode_json, expect_success, status_error},
    manifest::ProviderManifest,
    model::{Credentials, Favorite, Permit, Reservation, ReservationField, ZoneValidityBlock},
    normalize::{
        filter_chargeable, local_naive_to_utc, normalize_license_plate, parse_timestamp,
        truncate_subseconds, validate_reservation_window,
    },
    provider::{ParkingProvider, ProviderConfig, ProviderCore, require_credential},
    registry::ProviderRegistration,
};

/// Identifier this adapter registers under.
pub const PROVIDER_ID: &str = "amsterdam";

const DEFAULT_API_URI: &str = "api";
const LOGIN_ENDPOINT: &str = "/ssp/login_check";
const CLIENT_PRODUCT_LIST_ENDPOINT: &str = "/v1/client_product";
const ZONE_BY_MACHINE_ENDPOINT: &str = "/v1/ssp/paid_parking_zone/get_by_machine_number";
const SESSION_LIST_ENDPOINT: &str = "/v1/ssp/parking_session/list";
const SESSION_START_ENDPOINT: &str = "/v1/ssp/parking_session/start";
const FAVORITE_LIST_ENDPOINT: &str = "/v1/ssp/favorite_vrn/list";
const FAVORITE_ADD_ENDPOINT: &str = "/v1/ssp/favorite_vrn/add";
const USER_AGENT: &str = "bezoek-amsterdam";

const VISITOR_ROLE: &str = "ROLE_VISITOR_SSP";
const IDEAL_BRAND: &str = "IDEAL";

const SESSION_ENVELOPE_KEYS: &[&str] = &["data", "parking_sessions", "results"];
const FAVORITE_ENVELOPE_KEYS: &[&str] = &["favorite_vrns", "data", "results"];
const BALANCE_KEYS: &[&str] = &["time_balance", "money_balance", "balance"];

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
            Ok(Box::new(AmsterdamProvider::new(client, manifest, config)?))
        },
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Client product reference; the backend wants numeric ids as JSON numbers.
#[derive(Serialize)]
#[serde(untagged)]
enum ProductRef<'a> {
    Number(i64),
    Text(&'a str),
}

fn product_ref(value: &str) -> ProductRef<'_> {
    value.parse().map_or(ProductRef::Text(value), ProductRef::Number)
}

#[derive(Serialize)]
struct SessionListRequest<'a> {
    page: u32,
    row_per_page: u32,
    filters: SessionFilters<'a>,
}

#[derive(Serialize)]
struct SessionFilters<'a> {
    client_product_id: ProductRef<'a>,
}

#[derive(Serialize)]
struct SessionStartRequest<'a> {
    vrn: &'a str,
    client_product_id: ProductRef<'a>,
    started_at: String,
    ended_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brand: Option<&'a str>,
}

#[derive(Serialize)]
struct SessionEditRequest {
    new_ended_at: String,
}

#[derive(Serialize)]
struct ZoneByMachineRequest {
    machine_number: i64,
    date: String,
}

#[derive(Serialize)]
struct FavoriteAddRequest<'a> {
    vrn: &'a str,
    description: &'a str,
}

/// Body of a 400 response; the backend reports through `message` or `error`.
#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Default)]
struct SessionState {
    auth_header: Option<String>,
    credentials: Option<Credentials>,
    client_product_id: Option<String>,
    roles: Vec<String>,
    machine_number: Option<i64>,
    zone_id: Option<String>,
    logged_in: bool,
}

/// Amsterdam visitor parking adapter.
pub struct AmsterdamProvider {
    core: ProviderCore,
    state: Mutex<SessionState>,
}

impl AmsterdamProvider {
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
        warn!(provider = PROVIDER_ID, "token rejected, logging in again");
        self.login(&credentials).await
    }

    /// One attempt against the backend. 400 bodies are inspected for an
    /// embedded message before the generic status mapping applies.
    async fn attempt<P: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&P>,
        authenticated: bool,
    ) -> Result<Response, BezoekError> {
        let auth_header = if authenticated {
            let state = self.state.lock().await;
            let Some(value) = state.auth_header.clone() else {
                return Err(BezoekError::Auth(String::from("Authentication required.")));
            };
            Some(value)
        } else {
            None
        };
        let response = self
            .core
            .send(method, path, |request| {
                let mut request = request
                    .header(header::ACCEPT, "application/json")
                    .header(header::USER_AGENT, USER_AGENT);
                if let Some(value) = &auth_header {
                    request = request.header(header::AUTHORIZATION, value.as_str());
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

    /// Send an authenticated request, logging in again once when the token
    /// has been rejected mid-operation.
    async fn request_json<P: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&P>,
    ) -> Result<Value, BezoekError> {
        self.ensure_authenticated().await?;
        let outcome = self.attempt(method.clone(), path, body, true).await;
        let response = match outcome {
            Err(BezoekError::Auth(_)) => {
                self.reauthenticate().await?;
                self.attempt(method, path, body, true).await?
            }
            other => other?,
        };
        decode_json(response).await
    }

    /// Like [`Self::request_json`] for endpoints whose body is irrelevant.
    async fn request_text(&self, method: Method, path: &str) -> Result<(), BezoekError> {
        self.ensure_authenticated().await?;
        let outcome = self.attempt(method.clone(), path, None::<&Value>, true).await;
        match outcome {
            Err(BezoekError::Auth(_)) => {
                self.reauthenticate().await?;
                self.attempt(method, path, None::<&Value>, true).await?;
            }
            other => {
                other?;
            }
        }
        Ok(())
    }

    /// The client product id, discovered through the product list when the
    /// login claims did not carry one.
    async fn resolve_client_product_id(&self) -> Result<String, BezoekError> {
        if let Some(id) = self.state.lock().await.client_product_id.clone() {
            return Ok(id);
        }
        let data = self
            .request_json(Method::GET, CLIENT_PRODUCT_LIST_ENDPOINT, None::<&Value>)
            .await?;
        let Some(id) = extract_product_list_id(&data) else {
            return Err(BezoekError::Validation(String::from(
                "client_product_id is required.",
            )));
        };
        self.state.lock().await.client_product_id = Some(id.clone());
        Ok(id)
    }

    /// Resolve a zone id through the paid parking zone list when neither a
    /// machine number nor a zone id is known. Lookup failures are tolerated;
    /// starting still fails later when no context could be resolved.
    async fn ensure_parking_context(&self, client_product_id: &str) -> Result<(), BezoekError> {
        {
            let state = self.state.lock().await;
            if state.machine_number.is_some() || state.zone_id.is_some() {
                return Ok(());
            }
        }
        let path = format!("/v1/ssp/paid_parking_zone/list/client_product/{client_product_id}");
        let data = match self.request_json(Method::GET, &path, None::<&Value>).await {
            Ok(data) => data,
            Err(error) => {
                debug!(provider = PROVIDER_ID, error = %error, "paid parking zone lookup failed");
                return Ok(());
            }
        };
        if let Some(zone_id) = extract_single_zone_id(&data) {
            self.state.lock().await.zone_id = Some(zone_id);
        }
        Ok(())
    }

    async fn fetch_paid_zone_validity_for_date(
        &self,
        machine_number: i64,
        date: NaiveDate,
    ) -> Result<Vec<(ZoneValidityBlock, bool)>, BezoekError> {
        let payload = ZoneByMachineRequest {
            machine_number,
            date: date.format("%Y-%m-%d").to_string(),
        };
        let data = self
            .request_json(Method::POST, ZONE_BY_MACHINE_ENDPOINT, Some(&payload))
            .await?;
        Ok(map_time_frames(&data, date))
    }

    async fn find_reservation(
        &self,
        matches: impl Fn(&Reservation) -> bool,
    ) -> Result<Option<Reservation>, BezoekError> {
        let reservations = self.list_reservations().await?;
        Ok(reservations.into_iter().find(|candidate| matches(candidate)))
    }

    async fn edit_reservation(
        &self,
        reservation_id: &str,
        end: DateTime<Utc>,
    ) -> Result<Reservation, BezoekError> {
        let payload = SessionEditRequest {
            new_ended_at: end.to_rfc3339_opts(SecondsFormat::Secs, false),
        };
        let path = format!("/v1/ssp/parking_session/{reservation_id}/edit");
        let data = self.request_json(Method::PATCH, &path, Some(&payload)).await?;
        match map_reservation_response(&data)? {
            Some(found) => Ok(found),
            None => self
                .find_reservation(|candidate| candidate.id == reservation_id)
                .await?
                .ok_or_else(reservation_not_returned),
        }
    }
}

#[async_trait]
impl ParkingProvider for AmsterdamProvider {
    fn manifest(&self) -> &ProviderManifest {
        self.core.manifest()
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), BezoekError> {
        debug!(provider = PROVIDER_ID, "login started");
        let username = require_credential(credentials, "username")?.to_owned();
        let password = require_credential(credentials, "password")?.to_owned();
        let provided_product = non_empty_credential(credentials, "client_product_id");
        let machine_number = match non_empty_credential(credentials, "machine_number") {
            Some(value) => Some(parse_machine_number(&value)?),
            None => None,
        };
        let zone_id = non_empty_credential(credentials, "zone_id");
        let payload = LoginRequest {
            username: &username,
            password: &password,
        };
        let response = self.attempt(Method::POST, LOGIN_ENDPOINT, Some(&payload), false).await?;
        let data: Value = decode_json(response).await?;
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BezoekError::Auth(String::from("Authentication failed.")))?;
        let raw_token = token.strip_prefix("Bearer ").map_or(token, str::trim);
        let claims = decode_token_claims(raw_token);
        let roles = extract_roles(&claims);
        let client_product_id = provided_product.or_else(|| extract_claim_product_id(&claims));

        let mut saved = Credentials::new();
        saved.insert(String::from("username"), username);
        saved.insert(String::from("password"), password);
        if let Some(id) = &client_product_id {
            saved.insert(String::from("client_product_id"), id.clone());
        }
        if let Some(number) = machine_number {
            saved.insert(String::from("machine_number"), number.to_string());
        }
        if let Some(zone) = &zone_id {
            saved.insert(String::from("zone_id"), zone.clone());
        }

        let mut state = self.state.lock().await;
        state.auth_header = Some(format!("Bearer {raw_token}"));
        state.client_product_id = client_product_id;
        state.roles = roles;
        state.machine_number = machine_number;
        state.zone_id = zone_id;
        state.credentials = Some(saved);
        state.logged_in = true;
        debug!(provider = PROVIDER_ID, "login completed");
        Ok(())
    }

    async fn get_permit(&self) -> Result<Permit, BezoekError> {
        debug!(provider = PROVIDER_ID, "get_permit started");
        let product_id = self.resolve_client_product_id().await?;
        let path = format!("/v1/client_product/{product_id}");
        let data = self.request_json(Method::GET, &path, None::<&Value>).await?;
        let mut permit = map_permit(&data, &product_id)?;
        if permit.zone_validity.is_empty() {
            let machine_number = self.state.lock().await.machine_number;
            if let Some(machine_number) = machine_number {
                let today = Utc::now().with_timezone(&Amsterdam).date_naive();
                match self.fetch_paid_zone_validity_for_date(machine_number, today).await {
                    Ok(blocks) => permit.zone_validity = filter_chargeable(blocks),
                    Err(error) => debug!(
                        provider = PROVIDER_ID,
                        error = %error,
                        "paid zone validity lookup failed"
                    ),
                }
            }
        }
        debug!(provider = PROVIDER_ID, "get_permit completed");
        Ok(permit)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, BezoekError> {
        let product_id = self.resolve_client_product_id().await?;
        let payload = SessionListRequest {
            page: 1,
            row_per_page: 250,
            filters: SessionFilters {
                client_product_id: product_ref(&product_id),
            },
        };
        let data = self
            .request_json(Method::POST, SESSION_LIST_ENDPOINT, Some(&payload))
            .await?;
        map_reservation_list(&data)
    }

    async fn start_reservation(
        &self,
        license_plate: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        _name: Option<&str>,
    ) -> Result<Reservation, BezoekError> {
        debug!(provider = PROVIDER_ID, "start_reservation started");
        validate_reservation_window(Some(start_time), Some(end_time), true)?;
        let start = truncate_subseconds(start_time);
        let end = truncate_subseconds(end_time);
        let plate = normalize_license_plate(license_plate)?;
        let product_id = self.resolve_client_product_id().await?;
        self.ensure_parking_context(&product_id).await?;
        let (machine_number, zone_id, visitor) = {
            let state = self.state.lock().await;
            (
                state.machine_number,
                state.zone_id.clone(),
                state.roles.iter().any(|role| role == VISITOR_ROLE),
            )
        };
        if machine_number.is_none() && zone_id.is_none() {
            return Err(BezoekError::Provider(String::from(
                "A machine number or zone id is required to start a reservation.",
            )));
        }
        let payload = SessionStartRequest {
            vrn: &plate,
            client_product_id: product_ref(&product_id),
            started_at: format_rfc1123(start),
            ended_at: format_rfc1123(end),
            machine_number,
            zone_id: zone_id.as_deref(),
            brand: visitor.then_some(IDEAL_BRAND),
        };
        let data = self
            .request_json(Method::POST, SESSION_START_ENDPOINT, Some(&payload))
            .await?;
        let reservation = match map_reservation_response(&data)? {
            Some(found) => found,
            None => self
                .find_reservation(|candidate| {
                    candidate.license_plate == plate
                        && candidate.start_time == start
                        && candidate.end_time == end
                })
                .await?
                .ok_or_else(reservation_not_returned)?,
        };
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
        if !self
            .core
            .manifest()
            .reservation_update_fields
            .contains(&ReservationField::EndTime)
        {
            return Err(BezoekError::Provider(String::from(
                "Reservation updates are not supported.",
            )));
        }
        if start_time.is_some() || name.is_some() {
            return Err(BezoekError::Validation(String::from(
                "Only end_time can be updated.",
            )));
        }
        let Some(end_time) = end_time else {
            return Err(BezoekError::Validation(String::from("end_time is required.")));
        };
        let id = require_id(reservation_id, "reservation_id")?;
        self.edit_reservation(&id, truncate_subseconds(end_time)).await
    }

    async fn end_reservation(
        &self,
        reservation_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Reservation, BezoekError> {
        let id = require_id(reservation_id, "reservation_id")?;
        self.edit_reservation(&id, truncate_subseconds(end_time)).await
    }

    async fn list_favorites(&self) -> Result<Vec<Favorite>, BezoekError> {
        let data = self
            .request_json(Method::GET, FAVORITE_LIST_ENDPOINT, None::<&Value>)
            .await?;
        map_favorite_list(&data)
    }

    async fn add_favorite(
        &self,
        license_plate: &str,
        name: Option<&str>,
    ) -> Result<Favorite, BezoekError> {
        let plate = normalize_license_plate(license_plate)?;
        let payload = FavoriteAddRequest {
            vrn: &plate,
            description: name.unwrap_or(""),
        };
        let data = self
            .request_json(Method::POST, FAVORITE_ADD_ENDPOINT, Some(&payload))
            .await?;
        match map_favorite_response(&data)? {
            Some(found) => Ok(found),
            None => {
                let favorites = self.list_favorites().await?;
                favorites
                    .into_iter()
                    .find(|candidate| candidate.license_plate == plate)
                    .ok_or_else(favorite_not_returned)
            }
        }
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
        let id = require_id(favorite_id, "favorite_id")?;
        self.request_text(Method::DELETE, &format!("/v1/ssp/favorite_vrn/{id}/delete"))
            .await
    }
}

fn non_empty_credential(credentials: &Credentials, key: &str) -> Option<String> {
    credentials
        .get(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_machine_number(value: &str) -> Result<i64, BezoekError> {
    value.trim().parse().map_err(|_| {
        BezoekError::Validation(String::from("machine_number must be an integer."))
    })
}

fn require_id(value: &str, field: &str) -> Result<String, BezoekError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BezoekError::Validation(format!("{field} is required.")));
    }
    Ok(trimmed.to_owned())
}

fn reservation_not_returned() -> BezoekError {
    BezoekError::Provider(String::from("Reservation was not returned by the provider."))
}

fn favorite_not_returned() -> BezoekError {
    BezoekError::Provider(String::from("Favorite was not returned by the provider."))
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

fn id_from(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| item.get(*key).and_then(value_to_id))
}

/// First non-empty string value among `keys`, trimmed.
fn text_from<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
}

fn flexible_int(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number.as_i64().unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn decode_token_claims(token: &str) -> Value {
    let Some(payload) = token.split('.').nth(1) else {
        return Value::Null;
    };
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
        return Value::Null;
    };
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn extract_roles(claims: &Value) -> Vec<String> {
    claims
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Client product id from the token claims, across the shapes the backend
/// has been seen using.
fn extract_claim_product_id(claims: &Value) -> Option<String> {
    if let Some(id) = claims.get("client_product_id").and_then(value_to_id) {
        return Some(id);
    }
    if let Some(id) = claims.get("clientProductId").and_then(value_to_id) {
        return Some(id);
    }
    if let Some(id) = claims
        .get("client_product_ids")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(value_to_id)
    {
        return Some(id);
    }
    claims
        .get("client_products")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("id"))
        .and_then(value_to_id)
}

fn extract_product_list_id(data: &Value) -> Option<String> {
    if let Some(items) = data.get("data").and_then(Value::as_array) {
        for item in items {
            let matches_type = item
                .get("type")
                .and_then(Value::as_str)
                .is_none_or(|kind| kind == "client_product");
            if matches_type && let Some(id) = item.get("id").and_then(value_to_id) {
                return Some(id);
            }
        }
    }
    data.get("permit")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("permit_id"))
        .and_then(value_to_id)
}

fn extract_single_zone_id(data: &Value) -> Option<String> {
    let items = data
        .as_array()
        .or_else(|| data.get("data").and_then(Value::as_array))?;
    if items.len() != 1 {
        return None;
    }
    let item = items.first()?;
    item.get("zone_id")
        .and_then(value_to_id)
        .or_else(|| item.get("id").and_then(value_to_id))
}

fn map_permit(data: &Value, client_product_id: &str) -> Result<Permit, BezoekError> {
    if !data.is_object() {
        return Err(BezoekError::Provider(String::from(
            "Provider response included invalid permit data.",
        )));
    }
    let id = id_from(data, &["client_product_id", "id"])
        .unwrap_or_else(|| client_product_id.to_owned());
    let remaining_balance = extract_balance(data);
    let zone_validity = map_zone_validity(data)?;
    Ok(Permit {
        id,
        remaining_balance,
        zone_validity,
    })
}

fn extract_balance(document: &Value) -> i64 {
    if let Some(account) = document
        .get("ssp")
        .and_then(|ssp| ssp.get("main_account"))
        .filter(|account| account.is_object())
    {
        for key in BALANCE_KEYS {
            if let Some(value) = account.get(*key) {
                return flexible_int(value);
            }
        }
    }
    for key in BALANCE_KEYS {
        if let Some(value) = document.get(*key) {
            return flexible_int(value);
        }
    }
    0
}

fn map_zone_validity(document: &Value) -> Result<Vec<ZoneValidityBlock>, BezoekError> {
    let mut entries: Vec<(ZoneValidityBlock, bool)> = Vec::new();
    if let Some(items) = document.get("zone_validity").and_then(Value::as_array) {
        for item in items {
            let start_raw = text_from(item, &["start_time", "started_at"]);
            let end_raw = text_from(item, &["end_time", "ended_at"]);
            let (Some(start_raw), Some(end_raw)) = (start_raw, end_raw) else {
                continue;
            };
            let start = parse_provider_timestamp(start_raw)
                .map_err(|_| invalid_data("zone validity"))?;
            let end = parse_provider_timestamp(end_raw).map_err(|_| invalid_data("zone validity"))?;
            let chargeable = item.get("is_free").and_then(Value::as_bool) != Some(true);
            entries.push((
                ZoneValidityBlock {
                    start_time: start,
                    end_time: end,
                },
                chargeable,
            ));
        }
    }
    if entries.is_empty()
        && let Some(validity) = document.get("validity").filter(|value| value.is_object())
    {
        let start_raw = text_from(validity, &["started_at", "start_time"]);
        let end_raw = text_from(validity, &["ended_at", "end_time"]);
        if let (Some(start_raw), Some(end_raw)) = (start_raw, end_raw) {
            let start = parse_provider_timestamp(start_raw).map_err(|_| invalid_data("validity"))?;
            let end = parse_provider_timestamp(end_raw).map_err(|_| invalid_data("validity"))?;
            entries.push((
                ZoneValidityBlock {
                    start_time: start,
                    end_time: end,
                },
                true,
            ));
        }
    }
    Ok(filter_chargeable(entries))
}

fn invalid_data(entity: &str) -> BezoekError {
    BezoekError::Provider(format!("Provider returned invalid {entity} data."))
}

fn envelope_items<'a>(
    data: &'a Value,
    keys: &[&str],
    error_message: &str,
) -> Result<Option<&'a Vec<Value>>, BezoekError> {
    if let Some(document) = data.as_object() {
        let Some(value) = keys
            .iter()
            .filter_map(|key| document.get(*key))
            .find(|value| !value.is_null())
        else {
            return Ok(None);
        };
        return value
            .as_array()
            .map(Some)
            .ok_or_else(|| BezoekError::Provider(error_message.to_owned()));
    }
    data.as_array()
        .map(Some)
        .ok_or_else(|| BezoekError::Provider(error_message.to_owned()))
}

fn map_reservation_list(data: &Value) -> Result<Vec<Reservation>, BezoekError> {
    let Some(items) = envelope_items(
        data,
        SESSION_ENVELOPE_KEYS,
        "Provider response included invalid reservations.",
    )?
    else {
        return Ok(Vec::new());
    };
    let mut reservations = Vec::new();
    for item in items {
        if !item.is_object() || !has_active_status(item) {
            continue;
        }
        reservations.push(map_session_item(item)?);
    }
    Ok(reservations)
}

/// Sessions the backend reports as neither active nor upcoming are history
/// and stay hidden.
fn has_active_status(item: &Value) -> bool {
    match item.get("status") {
        None => true,
        Some(Value::String(text)) => {
            let status = text.trim().to_uppercase();
            status.is_empty() || status == "ACTIVE" || status == "FUTURE"
        }
        Some(_) => false,
    }
}

fn map_reservation_response(data: &Value) -> Result<Option<Reservation>, BezoekError> {
    if let Some(session) = data.get("parking_session")
        && session.is_object()
    {
        return map_session_item(session).map(Some);
    }
    if data.is_object() && (data.get("parking_session_id").is_some() || data.get("id").is_some()) {
        return map_session_item(data).map(Some);
    }
    Ok(None)
}

fn map_session_item(item: &Value) -> Result<Reservation, BezoekError> {
    let id = id_from(item, &["parking_session_id", "id"]).ok_or_else(|| {
        BezoekError::Provider(String::from("Provider response missing reservation id."))
    })?;
    let plate_raw = text_from(item, &["vrn", "license_plate"]).unwrap_or_default();
    let license_plate =
        normalize_license_plate(plate_raw).map_err(|_| invalid_data("reservation"))?;
    let name = text_from(item, &["permit_name", "zone_description", "name"])
        .map_or_else(|| license_plate.clone(), str::to_owned);
    let start_raw = text_from(item, &["started_at", "start_time"]);
    let end_raw = text_from(item, &["ended_at", "end_time"]);
    let (Some(start_raw), Some(end_raw)) = (start_raw, end_raw) else {
        return Err(BezoekError::Provider(String::from(
            "Provider response missing reservation timestamps.",
        )));
    };
    let start_time = parse_provider_timestamp(start_raw)?;
    let end_time = parse_provider_timestamp(end_raw)?;
    Ok(Reservation {
        id,
        name,
        license_plate,
        start_time,
        end_time,
    })
}

fn map_favorite_list(data: &Value) -> Result<Vec<Favorite>, BezoekError> {
    let Some(items) = envelope_items(
        data,
        FAVORITE_ENVELOPE_KEYS,
        "Provider response included invalid favorites.",
    )?
    else {
        return Ok(Vec::new());
    };
    let mut favorites = Vec::new();
    for item in items {
        if !item.is_object() {
            continue;
        }
        favorites.push(map_favorite_item(item)?);
    }
    Ok(favorites)
}

fn map_favorite_response(data: &Value) -> Result<Option<Favorite>, BezoekError> {
    if let Some(favorite) = data.get("favorite_vrn")
        && favorite.is_object()
    {
        return map_favorite_item(favorite).map(Some);
    }
    if data.is_object() && (data.get("favorite_vrn_id").is_some() || data.get("id").is_some()) {
        return map_favorite_item(data).map(Some);
    }
    Ok(None)
}

fn map_favorite_item(item: &Value) -> Result<Favorite, BezoekError> {
    let id = id_from(item, &["favorite_vrn_id", "id"]).ok_or_else(|| {
        BezoekError::Provider(String::from("Provider response missing favorite id."))
    })?;
    let plate_raw = text_from(item, &["vrn", "license_plate"]).unwrap_or_default();
    let license_plate = normalize_license_plate(plate_raw).map_err(|_| invalid_data("favorite"))?;
    let name = text_from(item, &["description", "name"])
        .map_or_else(|| license_plate.clone(), str::to_owned);
    Ok(Favorite {
        id,
        name,
        license_plate,
    })
}

/// Normalize a backend timestamp: offset ISO 8601, RFC 1123, or naive
/// provider-local civil time.
fn parse_provider_timestamp(raw: &str) -> Result<DateTime<Utc>, BezoekError> {
    if let Ok(parsed) = parse_timestamp(raw) {
        return Ok(parsed);
    }
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(truncate_subseconds(parsed.with_timezone(&Utc)));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(truncate_subseconds(local_naive_to_utc(naive, Amsterdam)));
        }
    }
    Err(BezoekError::Provider(String::from(
        "Provider response included invalid timestamp.",
    )))
}

fn format_rfc1123(value: DateTime<Utc>) -> String {
    truncate_subseconds(value)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Map `time_frame_data` (seven weekday lists of local `HHMM` windows) to
/// chargeable blocks on the given date. An end of `2400` rolls over to the
/// next day.
fn map_time_frames(data: &Value, date: NaiveDate) -> Vec<(ZoneValidityBlock, bool)> {
    let Some(frames) = data.get("time_frame_data").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Ok(weekday) = usize::try_from(date.weekday().num_days_from_monday()) else {
        return Vec::new();
    };
    let Some(day_frames) = frames.get(weekday).and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    for frame in day_frames {
        let start = frame
            .get("startTime")
            .and_then(Value::as_str)
            .and_then(|raw| local_time_on(date, raw));
        let end = frame
            .get("endTime")
            .and_then(Value::as_str)
            .and_then(|raw| local_time_on(date, raw));
        let (Some(start_time), Some(end_time)) = (start, end) else {
            continue;
        };
        blocks.push((
            ZoneValidityBlock {
                start_time,
                end_time,
            },
            true,
        ));
    }
    blocks
}

fn local_time_on(date: NaiveDate, raw: &str) -> Option<DateTime<Utc>> {
    let digits = raw.trim();
    if digits.chars().count() != 4 || !digits.chars().all(|symbol| symbol.is_ascii_digit()) {
        return None;
    }
    let value: u32 = digits.parse().ok()?;
    let mut hour = value / 100;
    let minute = value % 100;
    let mut day = date;
    if hour >= 24 {
        day = day.succ_opt()?;
        hour -= 24;
    }
    let naive = day.and_hms_opt(hour, minute, 0)?;
    Some(local_naive_to_utc(naive, Amsterdam))
}

async fn embedded_error_message(response: Response) -> Option<String> {
    let document: ErrorDocument = response.json().await.ok()?;
    let message = [document.message, document.error]
        .into_iter()
        .flatten()
        .map(|text| text.trim().to_owned())
        .find(|text| !text.is_empty())?;
    Some(format!("Provider error: {message}"))
}
