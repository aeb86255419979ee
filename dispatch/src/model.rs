//! Domain records: users, taxis, ratings, rides, and the ride status machine.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(UserId);
id_type!(TaxiId);
id_type!(RideId);

/// A registered account, rider or driver. Credentials live with the auth
/// collaborator; the store only needs the identity facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub is_driver: bool,
}

/// A driver's vehicle. Exactly one per driver; position is mutated only by
/// that driver's location updates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Taxi {
    pub id: TaxiId,
    pub driver: UserId,
    pub license_plate: String,
    pub location_lat: f64,
    pub location_lng: f64,
    pub available: bool,
}

/// One rating row per (taxi, user) pair; a repeat rating overwrites the
/// previous score rather than creating a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxiRating {
    pub taxi: TaxiId,
    pub user: UserId,
    pub score: u8,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Waiting,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    InRide,
    Shared,
}

impl RideStatus {
    /// Completed and cancelled rides accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Statuses during which a bound taxi is considered on the road for this
    /// ride; its location updates are relayed to the ride group.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::InProgress | RideStatus::InRide
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RideStatus::Waiting => "waiting",
            RideStatus::Accepted => "accepted",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
            RideStatus::InRide => "in_ride",
            RideStatus::Shared => "shared",
        };
        f.write_str(s)
    }
}

/// A ride request and its lifecycle state.
///
/// `shared_passenger` is set only by an accepted join negotiation, at which
/// point `pending_requests` has been cleared. A non-null `taxi` was bound
/// either at creation (nearest match) or by an explicit driver acceptance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ride {
    pub id: RideId,
    pub passenger: UserId,
    pub taxi: Option<TaxiId>,
    pub start_lat: f64,
    pub start_lng: f64,
    pub end_lat: f64,
    pub end_lng: f64,
    pub status: RideStatus,
    pub price: f64,
    pub created_at_ms: u64,
    pub shared_passenger: Option<UserId>,
    pub pending_requests: BTreeSet<UserId>,
}

/// Milliseconds since the Unix epoch, for `created_at` stamps and event
/// timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RideStatus::InProgress).expect("serialize"),
            "\"in_progress\""
        );
        let parsed: RideStatus = serde_json::from_str("\"shared\"").expect("parse");
        assert_eq!(parsed, RideStatus::Shared);
    }

    #[test]
    fn terminal_and_active_sets() {
        assert!(RideStatus::Completed.is_terminal());
        assert!(RideStatus::Cancelled.is_terminal());
        assert!(!RideStatus::Waiting.is_terminal());

        for status in [RideStatus::Accepted, RideStatus::InProgress, RideStatus::InRide] {
            assert!(status.is_active());
        }
        assert!(!RideStatus::Shared.is_active());
        assert!(!RideStatus::Waiting.is_active());
    }
}
