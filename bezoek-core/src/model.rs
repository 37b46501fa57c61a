//! Domain data structures for permits, reservations, and favorites.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Flat string map of provider credentials (`username`, `password`, ...).
///
/// Required keys vary by provider; unknown keys are passed through.
pub type Credentials = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
/// Favorite fields a provider can update natively.
pub enum FavoriteField {
    /// The stored license plate value.
    LicensePlate,
    /// The display label.
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
/// Reservation fields a provider can update natively.
pub enum ReservationField {
    /// The reservation start.
    StartTime,
    /// The reservation end.
    EndTime,
    /// The display label.
    Name,
}

impl FavoriteField {
    /// Wire name of the field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FavoriteField::LicensePlate => "license_plate",
            FavoriteField::Name => "name",
        }
    }
}

impl ReservationField {
    /// Wire name of the field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationField::StartTime => "start_time",
            ReservationField::EndTime => "end_time",
            ReservationField::Name => "name",
        }
    }
}

impl fmt::Display for FavoriteField {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl fmt::Display for ReservationField {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Chargeable time block during which parking is paid.
///
/// Free windows never appear here; providers filter them out during mapping.
pub struct ZoneValidityBlock {
    /// Start of the block (canonical UTC).
    pub start_time: DateTime<Utc>,
    /// End of the block (canonical UTC), strictly after `start_time`.
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Active permit state for the account.
pub struct Permit {
    /// Provider-side identifier, coerced to a string.
    pub id: String,
    /// Remaining balance in the provider's unit (minutes or currency).
    pub remaining_balance: i64,
    /// Chargeable windows, in provider order.
    pub zone_validity: Vec<ZoneValidityBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Timed parking reservation for one license plate.
pub struct Reservation {
    /// Provider-side identifier, coerced to a string.
    pub id: String,
    /// Display label; defaults to the plate when the backend has none.
    pub name: String,
    /// License plate in canonical form (uppercase, alphanumeric only).
    pub license_plate: String,
    /// Reservation start (canonical UTC).
    pub start_time: DateTime<Utc>,
    /// Reservation end (canonical UTC), strictly after `start_time`.
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Stored favorite license plate.
pub struct Favorite {
    /// Provider-side identifier, coerced to a string.
    pub id: String,
    /// Display label; defaults to the plate when the backend has none.
    pub name: String,
    /// License plate in canonical form.
    pub license_plate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Caller-facing summary of a registered provider.
pub struct ProviderInfo {
    /// Provider identifier.
    pub id: String,
    /// Favorite fields the provider updates natively.
    pub favorite_update_fields: Vec<FavoriteField>,
    /// Reservation fields the provider updates natively.
    pub reservation_update_fields: Vec<ReservationField>,
}
