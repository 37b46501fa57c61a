//! Capability manifests: parsing, validation, schema, and the TTL cache.
//!
//! Every provider crate embeds a `manifest.json` declaring its id, display
//! name, and which favorite/reservation fields its backend can update
//! natively. Documents are validated field by field so a broken manifest
//! fails with a message naming the offending key.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BezoekError;
use crate::model::{FavoriteField, ProviderInfo, ReservationField};

/// Default lifetime of a cached manifest snapshot.
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(300);

const REQUIRED_KEYS: &[&str] = &["id", "name", "capabilities"];

/// Validated capability manifest of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderManifest {
    /// Stable provider identifier, matching the id it was registered under.
    pub id: String,
    /// Human-readable provider name.
    pub name: String,
    /// Favorite fields the backend can update without remove-and-recreate.
    pub favorite_update_fields: Vec<FavoriteField>,
    /// Reservation fields the backend can update in place.
    pub reservation_update_fields: Vec<ReservationField>,
}

impl ProviderManifest {
    /// Reduce the manifest to the listing entry returned by the client.
    #[must_use]
    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            favorite_update_fields: self.favorite_update_fields.clone(),
            reservation_update_fields: self.reservation_update_fields.clone(),
        }
    }
}

/// Wire layout of a `manifest.json` document.
#[derive(JsonSchema)]
#[expect(dead_code, reason = "documents the wire layout for schema generation")]
struct ManifestDocument {
    /// Stable provider identifier.
    id: String,
    /// Human-readable provider name.
    name: String,
    /// Declared update capabilities.
    capabilities: ManifestCapabilities,
}

#[derive(JsonSchema)]
#[expect(dead_code, reason = "documents the wire layout for schema generation")]
struct ManifestCapabilities {
    favorite_update_fields: Vec<FavoriteField>,
    reservation_update_fields: Vec<ReservationField>,
}

/// JSON Schema for the manifest document, for external tooling.
#[must_use]
pub fn manifest_schema() -> schemars::Schema {
    schema_for!(ManifestDocument)
}

/// Parse and validate a manifest document against the id it was registered
/// under.
///
/// # Errors
///
/// Returns [`BezoekError::Provider`] naming the first offending key when the
/// document is malformed or declares an unsupported capability.
pub fn parse_manifest(source: &str, registered_id: &str) -> Result<ProviderManifest, BezoekError> {
    let document: Value = serde_json::from_str(source)
        .map_err(|_| BezoekError::Provider(String::from("Provider manifest is not valid JSON.")))?;
    let Some(fields) = document.as_object() else {
        return Err(BezoekError::Provider(String::from(
            "Provider manifest must be a JSON object.",
        )));
    };
    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !fields.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(BezoekError::Provider(format!(
            "Provider manifest missing keys: {}.",
            missing.join(", ")
        )));
    }
    let id = match fields.get("id").and_then(Value::as_str) {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(BezoekError::Provider(String::from(
                "Provider manifest id must be a non-empty string.",
            )));
        }
    };
    if id != registered_id {
        return Err(BezoekError::Provider(String::from(
            "Provider manifest id must match its registration id.",
        )));
    }
    let name = match fields.get("name").and_then(Value::as_str) {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(BezoekError::Provider(String::from(
                "Provider manifest name must be a non-empty string.",
            )));
        }
    };
    let Some(capabilities) = fields.get("capabilities").and_then(Value::as_object) else {
        return Err(BezoekError::Provider(String::from(
            "Provider manifest capabilities must be an object.",
        )));
    };
    let favorite_update_fields = parse_update_fields(
        require_capability(capabilities, "favorite_update_fields")?,
        "favorite_update_fields",
        favorite_field,
    )?;
    let reservation_update_fields = parse_update_fields(
        require_capability(capabilities, "reservation_update_fields")?,
        "reservation_update_fields",
        reservation_field,
    )?;
    Ok(ProviderManifest {
        id: id.to_owned(),
        name: name.to_owned(),
        favorite_update_fields,
        reservation_update_fields,
    })
}

fn require_capability<'a>(
    capabilities: &'a serde_json::Map<String, Value>,
    field_name: &str,
) -> Result<&'a Value, BezoekError> {
    capabilities.get(field_name).ok_or_else(|| {
        BezoekError::Provider(format!(
            "Provider manifest capabilities must include {field_name}.",
        ))
    })
}

fn parse_update_fields<T>(
    value: &Value,
    field_name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, BezoekError> {
    let Some(items) = value.as_array() else {
        return Err(BezoekError::Provider(format!(
            "Provider manifest {field_name} must be a list.",
        )));
    };
    let mut parsed = Vec::with_capacity(items.len());
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        let Some(text) = item.as_str() else {
            return Err(BezoekError::Provider(format!(
                "Provider manifest {field_name} must be a list of strings.",
            )));
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(BezoekError::Provider(format!(
                "Provider manifest {field_name} cannot contain empty values.",
            )));
        }
        let Some(field) = parse(text) else {
            return Err(BezoekError::Provider(format!(
                "Provider manifest {field_name} contains unsupported value '{text}'.",
            )));
        };
        if seen.iter().any(|earlier| earlier == text) {
            return Err(BezoekError::Provider(format!(
                "Provider manifest {field_name} cannot contain duplicates.",
            )));
        }
        seen.push(text.to_owned());
        parsed.push(field);
    }
    Ok(parsed)
}

fn favorite_field(text: &str) -> Option<FavoriteField> {
    match text {
        "license_plate" => Some(FavoriteField::LicensePlate),
        "name" => Some(FavoriteField::Name),
        _ => None,
    }
}

fn reservation_field(text: &str) -> Option<ReservationField> {
    match text {
        "start_time" => Some(ReservationField::StartTime),
        "end_time" => Some(ReservationField::EndTime),
        "name" => Some(ReservationField::Name),
        _ => None,
    }
}

/// Monotonic time source for cache expiry, replaceable in tests.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Snapshot {
    manifests: std::sync::Arc<[ProviderManifest]>,
    expires_at: Instant,
}

/// TTL cache holding the manifest snapshot of every registered provider.
///
/// A `ttl` of `None` disables caching entirely: every load re-reads the
/// manifests and nothing is stored. A failed reload always clears the cache
/// so a stale snapshot cannot outlive a broken source.
pub struct ManifestCache {
    ttl: Option<Duration>,
    clock: Box<dyn Clock>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl ManifestCache {
    /// Build a cache backed by the system clock.
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_clock(ttl, Box::new(SystemClock))
    }

    /// Build a cache with an explicit clock.
    #[must_use]
    pub fn with_clock(ttl: Option<Duration>, clock: Box<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            snapshot: RwLock::new(None),
        }
    }

    /// Return the cached snapshot when fresh, otherwise rebuild it through
    /// `reload`.
    ///
    /// # Errors
    ///
    /// Propagates the `reload` failure after invalidating the cache.
    pub fn load<F>(
        &self,
        refresh: bool,
        reload: F,
    ) -> Result<std::sync::Arc<[ProviderManifest]>, BezoekError>
    where
        F: FnOnce() -> Result<Vec<ProviderManifest>, BezoekError>,
    {
        if !refresh && self.ttl.is_some() {
            let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(snapshot) = guard.as_ref()
                && self.clock.now() < snapshot.expires_at
            {
                tracing::debug!("manifest cache hit");
                return Ok(std::sync::Arc::clone(&snapshot.manifests));
            }
        }
        match reload() {
            Ok(manifests) => {
                let manifests: std::sync::Arc<[ProviderManifest]> = manifests.into();
                let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                *guard = self.ttl.map(|ttl| Snapshot {
                    manifests: std::sync::Arc::clone(&manifests),
                    expires_at: self.clock.now() + ttl,
                });
                tracing::debug!(count = manifests.len(), "loaded provider manifests");
                Ok(manifests)
            }
            Err(error) => {
                self.clear();
                Err(error)
            }
        }
    }

    /// Drop any cached snapshot.
    pub fn clear(&self) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Mutex;

    use super::*;

    fn manifest_json(id: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "name": "Test Provider",
                "capabilities": {{
                    "favorite_update_fields": ["license_plate", "name"],
                    "reservation_update_fields": ["end_time"]
                }}
            }}"#
        )
    }

    fn sample(id: &str) -> ProviderManifest {
        parse_manifest(&manifest_json(id), id).unwrap()
    }

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn handle(self: &std::sync::Arc<Self>) -> Box<dyn Clock> {
            Box::new(HandleClock(std::sync::Arc::clone(self)))
        }

        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    struct HandleClock(std::sync::Arc<ManualClock>);

    impl Clock for HandleClock {
        fn now(&self) -> Instant {
            *self.0.now.lock().unwrap()
        }
    }

    #[test]
    fn parses_valid_manifest() {
        let manifest = sample("thehague");
        assert_eq!(manifest.id, "thehague");
        assert_eq!(manifest.name, "Test Provider");
        assert_eq!(
            manifest.favorite_update_fields,
            vec![FavoriteField::LicensePlate, FavoriteField::Name]
        );
        assert_eq!(manifest.reservation_update_fields, vec![ReservationField::EndTime]);
    }

    #[test]
    fn rejects_invalid_json_and_non_objects() {
        let err = parse_manifest("not json", "x").unwrap_err();
        assert_eq!(err.to_string(), "Provider manifest is not valid JSON.");
        let err = parse_manifest("[1, 2]", "x").unwrap_err();
        assert_eq!(err.to_string(), "Provider manifest must be a JSON object.");
    }

    #[test]
    fn reports_missing_keys_in_declaration_order() {
        let err = parse_manifest(r#"{"id": "x"}"#, "x").unwrap_err();
        assert_eq!(err.to_string(), "Provider manifest missing keys: name, capabilities.");
    }

    #[test]
    fn rejects_id_mismatch() {
        let err = parse_manifest(&manifest_json("other"), "thehague").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provider manifest id must match its registration id."
        );
    }

    #[test]
    fn rejects_bad_capability_lists() {
        let build = |fields: &str| {
            format!(
                r#"{{"id": "x", "name": "X", "capabilities": {{
                    "favorite_update_fields": {fields},
                    "reservation_update_fields": []
                }}}}"#
            )
        };
        let cases = [
            ("\"name\"", "Provider manifest favorite_update_fields must be a list."),
            ("[1]", "Provider manifest favorite_update_fields must be a list of strings."),
            ("[\" \"]", "Provider manifest favorite_update_fields cannot contain empty values."),
            (
                "[\"start_time\"]",
                "Provider manifest favorite_update_fields contains unsupported value 'start_time'.",
            ),
            (
                "[\"name\", \"name\"]",
                "Provider manifest favorite_update_fields cannot contain duplicates.",
            ),
        ];
        for (fields, expected) in cases {
            let err = parse_manifest(&build(fields), "x").unwrap_err();
            assert_eq!(err.to_string(), expected, "fields: {fields}");
        }
    }

    #[test]
    fn rejects_missing_capability_keys() {
        let source = r#"{"id": "x", "name": "X", "capabilities": {}}"#;
        let err = parse_manifest(source, "x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provider manifest capabilities must include favorite_update_fields."
        );
    }

    #[test]
    fn schema_names_capability_fields() {
        let rendered = serde_json::to_string(&manifest_schema()).unwrap();
        assert!(rendered.contains("favorite_update_fields"));
        assert!(rendered.contains("license_plate"));
    }

    #[test]
    fn serves_fresh_snapshot_without_reloading() {
        let clock = std::sync::Arc::new(ManualClock::new());
        let cache = ManifestCache::with_clock(Some(Duration::from_secs(300)), clock.handle());
        let calls = Cell::new(0_usize);
        let reload = || {
            calls.set(calls.get() + 1);
            Ok(vec![sample("a")])
        };
        cache.load(false, reload).unwrap();
        let served = cache
            .load(false, || {
                calls.set(calls.get() + 1);
                Ok(vec![sample("a")])
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(served.len(), 1);
    }

    #[test]
    fn reloads_after_expiry_and_on_refresh() {
        let clock = std::sync::Arc::new(ManualClock::new());
        let cache = ManifestCache::with_clock(Some(Duration::from_secs(300)), clock.handle());
        let calls = Cell::new(0_usize);
        let load = |refresh| {
            cache
                .load(refresh, || {
                    calls.set(calls.get() + 1);
                    Ok(vec![sample("a")])
                })
                .unwrap()
        };
        load(false);
        clock.advance(Duration::from_secs(300));
        load(false);
        assert_eq!(calls.get(), 2, "expiry boundary is stale");
        load(true);
        assert_eq!(calls.get(), 3, "refresh bypasses a fresh snapshot");
    }

    #[test]
    fn disabled_ttl_never_stores() {
        let cache = ManifestCache::new(None);
        let calls = Cell::new(0_usize);
        for _ in 0..2 {
            cache
                .load(false, || {
                    calls.set(calls.get() + 1);
                    Ok(vec![sample("a")])
                })
                .unwrap();
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn failed_reload_clears_cache() {
        let clock = std::sync::Arc::new(ManualClock::new());
        let cache = ManifestCache::with_clock(Some(Duration::from_secs(300)), clock.handle());
        let calls = Cell::new(0_usize);
        cache
            .load(false, || {
                calls.set(calls.get() + 1);
                Ok(vec![sample("a")])
            })
            .unwrap();
        let err = cache
            .load(true, || Err(BezoekError::Provider(String::from("boom"))))
            .unwrap_err();
        assert!(matches!(err, BezoekError::Provider(_)));
        cache
            .load(false, || {
                calls.set(calls.get() + 1);
                Ok(vec![sample("a")])
            })
            .unwrap();
        assert_eq!(calls.get(), 2, "failure must invalidate the snapshot");
    }
}
