//! End-to-end tests for the Amsterdam adapter against a mock backend.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use httpmock::Method::PATCH;
use httpmock::prelude::*;
use reqwest::Client;
use serde_json::{Value, json};

use bezoek_core::error::BezoekError;
use bezoek_core::manifest::parse_manifest;
use bezoek_core::model::ReservationField;
use bezoek_core::provider::{ParkingProvider, ProviderConfig};
use bezoek_provider_amsterdam::registration;

fn build(base_url: &str) -> Box<dyn ParkingProvider> {
    let registration = registration();
    let manifest = parse_manifest(registration.manifest_json, registration.id).unwrap();
    let config = ProviderConfig {
        base_url: Some(base_url.to_owned()),
        ..ProviderConfig::default()
    };
    (registration.build)(Client::new(), manifest, config).unwrap()
}

fn credentials(pairs: &[(&str, &str)]) -> bezoek_core::model::Credentials {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}

fn claims_token(claims: &Value) -> String {
    format!("header.{}.signature", URL_SAFE_NO_PAD.encode(claims.to_string()))
}

async fn logged_in_with(
    server: &MockServer,
    claims: &Value,
    extra: &[(&str, &str)],
) -> Box<dyn ParkingProvider> {
    let token = claims_token(claims);
    server.mock(|when, then| {
        when.method(POST).path("/api/ssp/login_check");
        then.status(200).json_body(json!({"token": token}));
    });
    let provider = build(&server.base_url());
    let mut pairs = vec![("username", "resident"), ("password", "secret")];
    pairs.extend_from_slice(extra);
    provider.login(&credentials(&pairs)).await.unwrap();
    provider
}

async fn logged_in(server: &MockServer) -> Box<dyn ParkingProvider> {
    logged_in_with(server, &json!({"client_product_id": 123}), &[]).await
}

fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .unwrap()
}

#[test]
fn registration_manifest_is_valid() {
    let registration = registration();
    let manifest = parse_manifest(registration.manifest_json, registration.id).unwrap();
    assert_eq!(manifest.id, "amsterdam");
    assert_eq!(manifest.name, "Amsterdam");
    assert!(manifest.favorite_update_fields.is_empty());
    assert_eq!(manifest.reservation_update_fields, vec![ReservationField::EndTime]);
}

#[tokio::test]
async fn login_posts_the_credentials_and_stores_the_bearer_token() {
    let server = MockServer::start();
    let token = claims_token(&json!({"client_product_id": 123}));
    let login = server.mock(|when, then| {
        when.method(POST)
            .path("/api/ssp/login_check")
            .header("accept", "application/json")
            .header("user-agent", "bezoek-amsterdam")
            .json_body(json!({"username": "resident", "password": "secret"}));
        then.status(200).json_body(json!({"token": token}));
    });
    let product = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v1/client_product/123")
            .header("authorization", format!("Bearer {token}"));
        then.status(200).json_body(json!({"client_product_id": 123}));
    });
    let provider = build(&server.base_url());
    provider
        .login(&credentials(&[("username", "resident"), ("password", "secret")]))
        .await
        .unwrap();
    let permit = provider.get_permit().await.unwrap();
    assert_eq!(permit.id, "123");
    assert_eq!(permit.remaining_balance, 0);
    login.assert();
    product.assert();
}

#[tokio::test]
async fn login_accepts_a_token_that_already_carries_the_bearer_prefix() {
    let server = MockServer::start();
    let token = claims_token(&json!({"client_product_id": 123}));
    server.mock(|when, then| {
        when.method(POST).path("/api/ssp/login_check");
        then.status(200)
            .json_body(json!({"token": format!("Bearer {token}")}));
    });
    let product = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v1/client_product/123")
            .header("authorization", format!("Bearer {token}"));
        then.status(200).json_body(json!({"client_product_id": 123}));
    });
    let provider = build(&server.base_url());
    provider
        .login(&credentials(&[("username", "resident"), ("password", "secret")]))
        .await
        .unwrap();
    provider.get_permit().await.unwrap();
    product.assert();
}

#[tokio::test]
async fn login_without_a_token_is_an_auth_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/ssp/login_check");
        then.status(200).json_body(json!({"status": "ok"}));
    });
    let provider = build(&server.base_url());
    let err = provider
        .login(&credentials(&[("username", "resident"), ("password", "secret")]))
        .await
        .unwrap_err();
    assert!(matches!(err, BezoekError::Auth(_)));
    assert_eq!(err.to_string(), "Authentication failed.");
}

#[tokio::test]
async fn login_requires_username_and_password() {
    let server = MockServer::start();
    let provider = build(&server.base_url());
    let err = provider
        .login(&credentials(&[("password", "secret")]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "username is required.");
    let err = provider
        .login(&credentials(&[("username", "resident")]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "password is required.");
}

#[tokio::test]
async fn invalid_machine_numbers_are_rejected_before_any_request() {
    let server = MockServer::start();
    let login = server.mock(|when, then| {
        when.method(POST).path("/api/ssp/login_check");
        then.status(200);
    });
    let provider = build(&server.base_url());
    let err = provider
        .login(&credentials(&[
            ("username", "resident"),
            ("password", "secret"),
            ("machine_number", "not-a-number"),
        ]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "machine_number must be an integer.");
    login.assert_hits(0);
}

#[tokio::test]
async fn missing_product_ids_are_discovered_through_the_product_list() {
    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET).path("/api/v1/client_product");
        then.status(200)
            .json_body(json!({"data": [{"type": "client_product", "id": 55}]}));
    });
    let product = server.mock(|when, then| {
        when.method(GET).path("/api/v1/client_product/55");
        then.status(200).json_body(json!({"id": 55, "balance": 600}));
    });
    let provider = logged_in_with(&server, &json!({}), &[]).await;
    let permit = provider.get_permit().await.unwrap();
    assert_eq!(permit.id, "55");
    assert_eq!(permit.remaining_balance, 600);
    list.assert();
    product.assert();
}

#[tokio::test]
async fn get_permit_maps_balance_and_chargeable_zone_validity() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/v1/client_product/123");
        then.status(200).json_body(json!({
            "client_product_id": 123,
            "ssp": {"main_account": {"time_balance": 7200}},
            "zone_validity": [
                {
                    "is_free": true,
                    "start_time": "2026-01-19T09:00:00+01:00",
                    "end_time": "2026-01-19T12:00:00+01:00"
                },
                {
                    "is_free": false,
                    "start_time": "2026-01-19T12:00:00+01:00",
                    "end_time": "2026-01-19T19:00:00+01:00"
                }
            ]
        }));
    });
    let provider = logged_in(&server).await;
    let permit = provider.get_permit().await.unwrap();
    assert_eq!(permit.id, "123");
    assert_eq!(permit.remaining_balance, 7200);
    assert_eq!(permit.zone_validity.len(), 1);
    let block = permit.zone_validity.first().unwrap();
    assert_eq!(block.start_time, utc(2026, 1, 19, 11, 0));
    assert_eq!(block.end_time, utc(2026, 1, 19, 18, 0));
}

#[tokio::test]
async fn empty_zone_validity_is_enriched_from_the_machine_number() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/v1/client_product/123");
        then.status(200).json_body(json!({"client_product_id": 123}));
    });
    let week: Vec<Value> = vec![json!([{"startTime": "0900", "endTime": "1900"}]); 7];
    let machine = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/paid_parking_zone/get_by_machine_number");
        then.status(200).json_body(json!({"time_frame_data": week}));
    });
    let provider = logged_in_with(
        &server,
        &json!({"client_product_id": 123}),
        &[("machine_number", "18773")],
    )
    .await;
    let permit = provider.get_permit().await.unwrap();
    assert_eq!(permit.zone_validity.len(), 1);
    machine.assert();
}

#[tokio::test]
async fn start_reservation_posts_machine_context_and_brand() {
    let server = MockServer::start();
    let start = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/parking_session/start")
            .json_body(json!({
                "vrn": "AB12CD",
                "client_product_id": 123,
                "started_at": "Sat, 24 Jan 2026 01:00:00 GMT",
                "ended_at": "Sat, 24 Jan 2026 02:00:00 GMT",
                "machine_number": 18773,
                "brand": "IDEAL"
            }));
        then.status(200).json_body(json!({
            "parking_session": {
                "parking_session_id": 9,
                "permit_name": "Visitor",
                "vrn": "AB12CD",
                "started_at": "2026-01-24T01:00:00+00:00",
                "ended_at": "2026-01-24T02:00:00+00:00"
            }
        }));
    });
    let provider = logged_in_with(
        &server,
        &json!({"roles": ["ROLE_VISITOR_SSP"], "client_product_id": 123}),
        &[("machine_number", "18773")],
    )
    .await;
    let reservation = provider
        .start_reservation("ab-12 cd", utc(2026, 1, 24, 1, 0), utc(2026, 1, 24, 2, 0), None)
        .await
        .unwrap();
    assert_eq!(reservation.id, "9");
    assert_eq!(reservation.name, "Visitor");
    assert_eq!(reservation.license_plate, "AB12CD");
    start.assert();
}

#[tokio::test]
async fn start_reservation_resolves_a_single_zone_when_context_is_missing() {
    let server = MockServer::start();
    let zones = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v1/ssp/paid_parking_zone/list/client_product/123");
        then.status(200).json_body(json!({"data": [{"id": "Z-1"}]}));
    });
    let start = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/parking_session/start")
            .json_body(json!({
                "vrn": "AB12CD",
                "client_product_id": 123,
                "started_at": "Sat, 24 Jan 2026 01:00:00 GMT",
                "ended_at": "Sat, 24 Jan 2026 02:00:00 GMT",
                "zone_id": "Z-1"
            }));
        then.status(200).json_body(json!({
            "parking_session_id": 11,
            "vrn": "AB12CD",
            "started_at": "2026-01-24T01:00:00+00:00",
            "ended_at": "2026-01-24T02:00:00+00:00"
        }));
    });
    let provider = logged_in(&server).await;
    let reservation = provider
        .start_reservation("AB12CD", utc(2026, 1, 24, 1, 0), utc(2026, 1, 24, 2, 0), None)
        .await
        .unwrap();
    assert_eq!(reservation.id, "11");
    zones.assert();
    start.assert();
}

#[tokio::test]
async fn start_reservation_validates_before_any_request() {
    let server = MockServer::start();
    let start = server.mock(|when, then| {
        when.method(POST).path("/api/v1/ssp/parking_session/start");
        then.status(200);
    });
    let provider = logged_in(&server).await;
    let at = utc(2026, 1, 24, 1, 0);
    let err = provider
        .start_reservation("AB12CD", at, at, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "end_time must be after start_time.");
    let err = provider
        .start_reservation("!!!", at, utc(2026, 1, 24, 2, 0), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "License plate is empty after normalization.");
    start.assert_hits(0);
}

#[tokio::test]
async fn started_reservations_missing_from_the_response_are_looked_up() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/v1/ssp/parking_session/start");
        then.status(200).json_body(json!({"success": true}));
    });
    let list = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/parking_session/list")
            .json_body(json!({
                "page": 1,
                "row_per_page": 250,
                "filters": {"client_product_id": 123}
            }));
        then.status(200).json_body(json!({
            "data": [{
                "parking_session_id": 21,
                "vrn": "AB12CD",
                "started_at": "2026-01-24T01:00:00+00:00",
                "ended_at": "2026-01-24T02:00:00+00:00"
            }]
        }));
    });
    let provider = logged_in_with(
        &server,
        &json!({"client_product_id": 123}),
        &[("zone_id", "Z-1")],
    )
    .await;
    let reservation = provider
        .start_reservation("AB12CD", utc(2026, 1, 24, 1, 0), utc(2026, 1, 24, 2, 0), None)
        .await
        .unwrap();
    assert_eq!(reservation.id, "21");
    list.assert();
}

#[tokio::test]
async fn update_reservation_patches_the_end_time() {
    let server = MockServer::start();
    let edit = server.mock(|when, then| {
        when.method(PATCH)
            .path("/api/v1/ssp/parking_session/42/edit")
            .json_body(json!({"new_ended_at": "2026-01-24T03:00:00+00:00"}));
        then.status(200).json_body(json!({
            "parking_session": {
                "parking_session_id": 42,
                "vrn": "AB12CD",
                "started_at": "2026-01-24T01:00:00+00:00",
                "ended_at": "2026-01-24T03:00:00+00:00"
            }
        }));
    });
    let provider = logged_in(&server).await;
    let reservation = provider
        .update_reservation("42", None, Some(utc(2026, 1, 24, 3, 0)), None)
        .await
        .unwrap();
    assert_eq!(reservation.id, "42");
    assert_eq!(reservation.end_time, utc(2026, 1, 24, 3, 0));
    edit.assert();
}

#[tokio::test]
async fn update_reservation_rejects_fields_the_backend_cannot_change() {
    let server = MockServer::start();
    let edit = server.mock(|when, then| {
        when.method(PATCH).path("/api/v1/ssp/parking_session/42/edit");
        then.status(200);
    });
    let provider = logged_in(&server).await;
    let err = provider
        .update_reservation("42", Some(utc(2026, 1, 24, 1, 0)), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Only end_time can be updated.");
    let err = provider.update_reservation("42", None, None, None).await.unwrap_err();
    assert_eq!(err.to_string(), "end_time is required.");
    edit.assert_hits(0);
}

#[tokio::test]
async fn end_reservation_falls_back_to_the_session_list() {
    let server = MockServer::start();
    let edit = server.mock(|when, then| {
        when.method(PATCH)
            .path("/api/v1/ssp/parking_session/42/edit")
            .json_body(json!({"new_ended_at": "2026-01-24T01:30:00+00:00"}));
        then.status(200).json_body(json!({"success": true}));
    });
    server.mock(|when, then| {
        when.method(POST).path("/api/v1/ssp/parking_session/list");
        then.status(200).json_body(json!({
            "data": [{
                "parking_session_id": 42,
                "vrn": "AB12CD",
                "started_at": "2026-01-24T01:00:00+00:00",
                "ended_at": "2026-01-24T01:30:00+00:00"
            }]
        }));
    });
    let provider = logged_in(&server).await;
    let reservation = provider
        .end_reservation("42", utc(2026, 1, 24, 1, 30))
        .await
        .unwrap();
    assert_eq!(reservation.id, "42");
    assert_eq!(reservation.end_time, utc(2026, 1, 24, 1, 30));
    edit.assert();
}

#[tokio::test]
async fn favorites_are_unwrapped_from_the_envelope() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/v1/ssp/favorite_vrn/list");
        then.status(200).json_body(json!({
            "favorite_vrns": [
                {"favorite_vrn_id": 5, "vrn": "xy-99-zz", "description": "Family"}
            ]
        }));
    });
    let provider = logged_in(&server).await;
    let favorites = provider.list_favorites().await.unwrap();
    assert_eq!(favorites.len(), 1);
    let favorite = favorites.first().unwrap();
    assert_eq!(favorite.id, "5");
    assert_eq!(favorite.name, "Family");
    assert_eq!(favorite.license_plate, "XY99ZZ");
}

#[tokio::test]
async fn add_favorite_posts_and_falls_back_to_the_list() {
    let server = MockServer::start();
    let add = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/favorite_vrn/add")
            .json_body(json!({"vrn": "AB12CD", "description": "Visitors"}));
        then.status(200).json_body(json!({"status": "ok"}));
    });
    let list = server.mock(|when, then| {
        when.method(GET).path("/api/v1/ssp/favorite_vrn/list");
        then.status(200).json_body(json!({
            "favorite_vrns": [
                {"favorite_vrn_id": 8, "vrn": "AB12CD", "description": "Visitors"}
            ]
        }));
    });
    let provider = logged_in(&server).await;
    let favorite = provider.add_favorite("ab-12-cd", Some("Visitors")).await.unwrap();
    assert_eq!(favorite.id, "8");
    add.assert();
    list.assert();
}

#[tokio::test]
async fn add_favorite_uses_the_returned_document_when_present() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/favorite_vrn/add")
            .json_body(json!({"vrn": "CD34EF", "description": ""}));
        then.status(200).json_body(json!({
            "favorite_vrn": {"favorite_vrn_id": 6, "vrn": "CD34EF"}
        }));
    });
    let list = server.mock(|when, then| {
        when.method(GET).path("/api/v1/ssp/favorite_vrn/list");
        then.status(200);
    });
    let provider = logged_in(&server).await;
    let favorite = provider.add_favorite("CD34EF", None).await.unwrap();
    assert_eq!(favorite.id, "6");
    assert_eq!(favorite.name, "CD34EF");
    list.assert_hits(0);
}

#[tokio::test]
async fn update_favorite_replaces_through_remove_and_add() {
    let server = MockServer::start();
    let remove = server.mock(|when, then| {
        when.method(DELETE).path("/api/v1/ssp/favorite_vrn/5/delete");
        then.status(200).body("ok");
    });
    let add = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/ssp/favorite_vrn/add")
            .json_body(json!({"vrn": "CD34EF", "description": "New"}));
        then.status(200).json_body(json!({
            "favorite_vrn": {"favorite_vrn_id": 6, "vrn": "CD34EF", "description": "New"}
        }));
    });
    let provider = logged_in(&server).await;
    let favorite = provider
        .update_favorite("5", Some("cd-34-ef"), Some("New"))
        .await
        .unwrap();
    assert_eq!(favorite.id, "6");
    assert_eq!(favorite.name, "New");
    remove.assert();
    add.assert();
}

#[tokio::test]
async fn remove_favorite_requires_an_id() {
    let server = MockServer::start();
    let provider = logged_in(&server).await;
    let err = provider.remove_favorite("  ").await.unwrap_err();
    assert_eq!(err.to_string(), "favorite_id is required.");
}

#[tokio::test]
async fn embedded_400_messages_are_translated() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/v1/ssp/parking_session/list");
        then.status(400).json_body(json!({"error": "No access to this product"}));
    });
    let provider = logged_in(&server).await;
    let err = provider.list_reservations().await.unwrap_err();
    assert!(matches!(err, BezoekError::Provider(_)));
    assert_eq!(err.to_string(), "Provider error: No access to this product");
}

#[tokio::test]
async fn plain_bad_requests_keep_the_status_message() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/v1/ssp/parking_session/list");
        then.status(400).json_body(json!({"status": "oops"}));
    });
    let provider = logged_in(&server).await;
    let err = provider.list_reservations().await.unwrap_err();
    assert_eq!(err.to_string(), "Provider request failed with status 400.");
}

#[tokio::test]
async fn invalid_json_bodies_are_provider_errors() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/v1/client_product/123");
        then.status(200).body("<html>maintenance</html>");
    });
    let provider = logged_in(&server).await;
    let err = provider.get_permit().await.unwrap_err();
    assert_eq!(err.to_string(), "Response did not contain valid JSON.");
}

#[tokio::test]
async fn calls_without_credentials_require_a_login() {
    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET).path("/api/v1/ssp/favorite_vrn/list");
        then.status(200);
    });
    let provider = build(&server.base_url());
    let err = provider.list_favorites().await.unwrap_err();
    assert_eq!(err.to_string(), "Authentication required.");
    list.assert_hits(0);
}

#[tokio::test]
async fn connection_failures_surface_as_network_errors() {
    let provider = build("http://127.0.0.1:9");
    let err = provider
        .login(&credentials(&[("username", "resident"), ("password", "secret")]))
        .await
        .unwrap_err();
    assert!(matches!(err, BezoekError::Network(_)));
    assert_eq!(err.code(), "network_error");
}
