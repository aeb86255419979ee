//! Authoritative taxi, ride, and rating state.
//!
//! All mutations go through this store; nothing else caches or mutates
//! copies of its records. A single async mutex guards the tables, which
//! linearizes mutations to any one record. Status changes use
//! compare-and-set semantics so concurrent transitions cannot both win.
//!
//! `BTreeMap` tables give deterministic iteration order, which makes
//! matching results and tests reproducible.

use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::matching;
use crate::model::{now_millis, Ride, RideId, RideStatus, Taxi, TaxiId, TaxiRating, User, UserId};

type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    taxis: BTreeMap<TaxiId, Taxi>,
    rides: BTreeMap<RideId, Ride>,
    ratings: BTreeMap<(TaxiId, UserId), TaxiRating>,
    next_user: u64,
    next_taxi: u64,
    next_ride: u64,
}

/// In-memory store standing in for the durable persistence collaborator.
/// Single-record writes are atomic by construction (one lock, short
/// critical sections, no awaits while held).
#[derive(Default)]
pub struct DispatchStore {
    tables: Mutex<Tables>,
}

impl DispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- users ----

    pub async fn add_user(&self, username: &str, is_driver: bool) -> User {
        let mut tables = self.tables.lock().await;
        tables.next_user += 1;
        let user = User {
            id: UserId(tables.next_user),
            username: username.to_string(),
            is_driver,
        };
        tables.users.insert(user.id, user.clone());
        user
    }

    pub async fn user(&self, id: UserId) -> Result<User> {
        let tables = self.tables.lock().await;
        tables
            .users
            .get(&id)
            .cloned()
            .ok_or(DispatchError::NotFound("user"))
    }

    // ---- taxis ----

    /// Registers a driver's vehicle. Each driver owns at most one taxi.
    pub async fn create_taxi(
        &self,
        driver: UserId,
        license_plate: &str,
        lat: f64,
        lng: f64,
    ) -> Result<Taxi> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&driver) {
            return Err(DispatchError::NotFound("user"));
        }
        if tables.taxis.values().any(|t| t.driver == driver) {
            return Err(DispatchError::InvalidState(
                "driver already has a registered taxi",
            ));
        }
        tables.next_taxi += 1;
        let taxi = Taxi {
            id: TaxiId(tables.next_taxi),
            driver,
            license_plate: license_plate.to_string(),
            location_lat: lat,
            location_lng: lng,
            available: true,
        };
        tables.taxis.insert(taxi.id, taxi.clone());
        Ok(taxi)
    }

    pub async fn taxi(&self, id: TaxiId) -> Result<Taxi> {
        let tables = self.tables.lock().await;
        tables
            .taxis
            .get(&id)
            .cloned()
            .ok_or(DispatchError::NotFound("taxi"))
    }

    /// Resolves the optional driver → taxi relation explicitly.
    pub async fn taxi_for_driver(&self, driver: UserId) -> Option<Taxi> {
        let tables = self.tables.lock().await;
        tables.taxis.values().find(|t| t.driver == driver).cloned()
    }

    /// Last-writer-wins position update; only the owning driver may move a
    /// taxi.
    pub async fn update_taxi_position(
        &self,
        id: TaxiId,
        caller: UserId,
        lat: f64,
        lng: f64,
    ) -> Result<Taxi> {
        let mut tables = self.tables.lock().await;
        let taxi = tables
            .taxis
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("taxi"))?;
        if taxi.driver != caller {
            return Err(DispatchError::Forbidden(
                "only the owning driver may update a taxi's position",
            ));
        }
        taxi.location_lat = lat;
        taxi.location_lng = lng;
        Ok(taxi.clone())
    }

    /// Snapshot of available taxis, ordered by id.
    pub async fn available_taxis(&self) -> Vec<Taxi> {
        let tables = self.tables.lock().await;
        tables
            .taxis
            .values()
            .filter(|t| t.available)
            .cloned()
            .collect()
    }

    // ---- ratings ----

    /// Insert-or-update keyed by (taxi, user).
    pub async fn upsert_rating(&self, taxi: TaxiId, user: UserId, score: i64) -> Result<TaxiRating> {
        if !(1..=5).contains(&score) {
            return Err(DispatchError::InvalidArgument(
                "score must be between 1 and 5",
            ));
        }
        let mut tables = self.tables.lock().await;
        if !tables.taxis.contains_key(&taxi) {
            return Err(DispatchError::NotFound("taxi"));
        }
        let rating = tables
            .ratings
            .entry((taxi, user))
            .and_modify(|r| r.score = score as u8)
            .or_insert_with(|| TaxiRating {
                taxi,
                user,
                score: score as u8,
                created_at_ms: now_millis(),
            })
            .clone();
        Ok(rating)
    }

    /// Average score and rating count for a taxi, or `None` when unrated.
    /// The average is rounded to two decimals.
    pub async fn average_rating(&self, taxi: TaxiId) -> Result<Option<(f64, usize)>> {
        let tables = self.tables.lock().await;
        if !tables.taxis.contains_key(&taxi) {
            return Err(DispatchError::NotFound("taxi"));
        }
        let scores: Vec<u8> = tables
            .ratings
            .values()
            .filter(|r| r.taxi == taxi)
            .map(|r| r.score)
            .collect();
        if scores.is_empty() {
            return Ok(None);
        }
        let sum: u32 = scores.iter().map(|&s| u32::from(s)).sum();
        let avg = f64::from(sum) / scores.len() as f64;
        Ok(Some(((avg * 100.0).round() / 100.0, scores.len())))
    }

    // ---- rides ----

    pub async fn create_ride(
        &self,
        passenger: UserId,
        start: (f64, f64),
        end: (f64, f64),
        status: RideStatus,
        taxi: Option<TaxiId>,
    ) -> Ride {
        let mut tables = self.tables.lock().await;
        tables.next_ride += 1;
        let ride = Ride {
            id: RideId(tables.next_ride),
            passenger,
            taxi,
            start_lat: start.0,
            start_lng: start.1,
            end_lat: end.0,
            end_lng: end.1,
            status,
            price: 0.0,
            created_at_ms: now_millis(),
            shared_passenger: None,
            pending_requests: Default::default(),
        };
        tables.rides.insert(ride.id, ride.clone());
        ride
    }

    /// Creates a ride and binds the nearest available taxi in the same
    /// critical section, so two concurrent creations cannot both claim the
    /// last available taxi. With `park_taxi`, the bound taxi is flipped
    /// unavailable before the lock is released.
    pub async fn create_ride_matched(
        &self,
        passenger: UserId,
        start: (f64, f64),
        end: (f64, f64),
        status: RideStatus,
        park_taxi: bool,
    ) -> Ride {
        let mut tables = self.tables.lock().await;
        let candidates: Vec<Taxi> = tables.taxis.values().filter(|t| t.available).cloned().collect();
        let nearest = matching::nearest_available_taxi(&candidates, start.0, start.1);
        tables.next_ride += 1;
        let ride = Ride {
            id: RideId(tables.next_ride),
            passenger,
            taxi: nearest.as_ref().map(|t| t.id),
            start_lat: start.0,
            start_lng: start.1,
            end_lat: end.0,
            end_lng: end.1,
            status,
            price: 0.0,
            created_at_ms: now_millis(),
            shared_passenger: None,
            pending_requests: Default::default(),
        };
        tables.rides.insert(ride.id, ride.clone());
        if park_taxi {
            if let Some(bound) = &nearest {
                if let Some(taxi) = tables.taxis.get_mut(&bound.id) {
                    taxi.available = false;
                }
            }
        }
        ride
    }

    pub async fn ride(&self, id: RideId) -> Result<Ride> {
        let tables = self.tables.lock().await;
        tables
            .rides
            .get(&id)
            .cloned()
            .ok_or(DispatchError::NotFound("ride"))
    }

    /// Compare-and-set status transition. Fails with `InvalidState` when the
    /// current status is not in `allowed_from`, so two racing transitions
    /// cannot both observe the old status and both win.
    pub async fn transition_ride(
        &self,
        id: RideId,
        allowed_from: &[RideStatus],
        to: RideStatus,
    ) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        if !allowed_from.contains(&ride.status) {
            return Err(DispatchError::InvalidState(
                "ride status does not allow this transition",
            ));
        }
        ride.status = to;
        Ok(ride.clone())
    }

    /// Compare-and-set transition that also binds a taxi and, with
    /// `park_taxi`, flips it unavailable, all in one critical section. A
    /// concurrent cancellation therefore observes either the fully accepted
    /// ride or the ride before the accept, never a half-applied accept.
    pub async fn transition_and_assign(
        &self,
        id: RideId,
        allowed_from: &[RideStatus],
        to: RideStatus,
        taxi: TaxiId,
        park_taxi: bool,
    ) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        if !tables.taxis.contains_key(&taxi) {
            return Err(DispatchError::NotFound("taxi"));
        }
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        if !allowed_from.contains(&ride.status) {
            return Err(DispatchError::InvalidState(
                "ride status does not allow this transition",
            ));
        }
        ride.status = to;
        ride.taxi = Some(taxi);
        let ride = ride.clone();
        if park_taxi {
            if let Some(parked) = tables.taxis.get_mut(&taxi) {
                parked.available = false;
            }
        }
        Ok(ride)
    }

    /// Compare-and-set transition into a terminal state that, with
    /// `free_taxi`, restores the bound taxi's availability under the same
    /// lock, so a racing accept cannot slip between the transition and the
    /// release.
    pub async fn transition_and_release(
        &self,
        id: RideId,
        allowed_from: &[RideStatus],
        to: RideStatus,
        free_taxi: bool,
    ) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        if !allowed_from.contains(&ride.status) {
            return Err(DispatchError::InvalidState(
                "ride status does not allow this transition",
            ));
        }
        ride.status = to;
        let ride = ride.clone();
        if free_taxi {
            if let Some(taxi_id) = ride.taxi {
                if let Some(taxi) = tables.taxis.get_mut(&taxi_id) {
                    taxi.available = true;
                }
            }
        }
        Ok(ride)
    }

    /// Adds a join request. Idempotent: requesting twice has no additional
    /// effect. Fails once a shared passenger has already been accepted.
    pub async fn add_pending_request(&self, id: RideId, user: UserId) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        if ride.shared_passenger.is_some() {
            return Err(DispatchError::InvalidState(
                "ride already has a shared passenger",
            ));
        }
        ride.pending_requests.insert(user);
        Ok(ride.clone())
    }

    /// Removes only the named requester; absent requesters are a no-op.
    pub async fn remove_pending_request(&self, id: RideId, user: UserId) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        ride.pending_requests.remove(&user);
        Ok(ride.clone())
    }

    /// Accepts a join request: binds the shared passenger, clears every
    /// pending request, and resets the status to waiting, all in one
    /// critical section.
    pub async fn accept_join(&self, id: RideId, requester: UserId) -> Result<Ride> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&requester) {
            return Err(DispatchError::NotFound("user"));
        }
        let ride = tables
            .rides
            .get_mut(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        ride.shared_passenger = Some(requester);
        ride.pending_requests.clear();
        ride.status = RideStatus::Waiting;
        Ok(ride.clone())
    }

    /// Current pending requesters as full user records, ordered by id.
    pub async fn pending_requesters(&self, id: RideId) -> Result<Vec<User>> {
        let tables = self.tables.lock().await;
        let ride = tables
            .rides
            .get(&id)
            .ok_or(DispatchError::NotFound("ride"))?;
        Ok(ride
            .pending_requests
            .iter()
            .filter_map(|user_id| tables.users.get(user_id).cloned())
            .collect())
    }

    /// Snapshot of rides currently in `status`, ordered by id.
    pub async fn rides_with_status(&self, status: RideStatus) -> Vec<Ride> {
        let tables = self.tables.lock().await;
        tables
            .rides
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// The lowest-id ride this taxi is actively serving, if any.
    pub async fn active_ride_for_taxi(&self, taxi: TaxiId) -> Option<Ride> {
        let tables = self.tables.lock().await;
        tables
            .rides
            .values()
            .find(|r| r.taxi == Some(taxi) && r.status.is_active())
            .cloned()
    }
}
