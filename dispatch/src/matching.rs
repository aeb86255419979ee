//! Nearest-taxi matching and radius queries.
//!
//! Pure functions over store snapshots; candidate slices arrive ordered by
//! id, and the strict minimum comparison makes ties deterministic (lowest id
//! wins). Note the unit split: nearest-match and shared-ride filtering work
//! in metres, taxi proximity in kilometres (see [`crate::geo`]).

use crate::geo;
use crate::model::{Ride, RideStatus, Taxi};

/// Default radius for taxi proximity queries, in kilometres.
pub const DEFAULT_TAXI_RADIUS_KM: f64 = 1.0;
/// Default radius for shared-ride queries, in metres.
pub const DEFAULT_SHARED_RIDE_RADIUS_M: f64 = 500.0;

/// Picks the closest available taxi to an origin. No maximum-radius cutoff:
/// ride creation binds whatever is nearest, however far. `None` when the
/// candidate list is empty.
pub fn nearest_available_taxi(taxis: &[Taxi], lat: f64, lng: f64) -> Option<Taxi> {
    let mut nearest: Option<(f64, &Taxi)> = None;
    for taxi in taxis.iter().filter(|t| t.available) {
        let distance = geo::distance_m(lat, lng, taxi.location_lat, taxi.location_lng);
        if nearest.map_or(true, |(best, _)| distance < best) {
            nearest = Some((distance, taxi));
        }
    }
    nearest.map(|(_, taxi)| taxi.clone())
}

/// Available taxis within `radius_km` of a point, ordered by id.
pub fn taxis_within_km(taxis: &[Taxi], lat: f64, lng: f64, radius_km: f64) -> Vec<Taxi> {
    taxis
        .iter()
        .filter(|t| t.available)
        .filter(|t| geo::distance_km(lat, lng, t.location_lat, t.location_lng) <= radius_km)
        .cloned()
        .collect()
}

/// Shared-status rides whose origin lies within `radius_m` of a point,
/// ordered by id.
pub fn shared_rides_within_m(rides: &[Ride], lat: f64, lng: f64, radius_m: f64) -> Vec<Ride> {
    rides
        .iter()
        .filter(|r| r.status == RideStatus::Shared)
        .filter(|r| geo::distance_m(lat, lng, r.start_lat, r.start_lng) <= radius_m)
        .cloned()
        .collect()
}
