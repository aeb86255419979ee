//! Ride lifecycle controller.
//!
//! Enforces the status machine on top of the store's compare-and-set
//! transitions and hands successful mutations to the broadcast gateway.
//! Publish failures never fail the triggering mutation.
//!
//! Status machine: waiting → accepted → in_progress/in_ride → completed,
//! with cancellation reachable from any non-terminal state. Shared-seeking
//! rides start in `shared` instead of `waiting` and otherwise follow the
//! same transitions once accepted.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::auth::Identity;
use crate::error::DispatchError;
use crate::gateway::{Gateway, GroupKey};
use crate::matching;
use crate::message::GroupEvent;
use crate::model::{now_millis, Ride, RideId, RideStatus, Taxi, TaxiId, TaxiRating, User, UserId};
use crate::store::DispatchStore;

type Result<T> = std::result::Result<T, DispatchError>;

const NON_TERMINAL: &[RideStatus] = &[
    RideStatus::Waiting,
    RideStatus::Accepted,
    RideStatus::InProgress,
    RideStatus::InRide,
    RideStatus::Shared,
];

/// Tunable dispatch behavior.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// When true, binding a taxi to a ride flips it unavailable and
    /// completion or cancellation makes it available again. Off by default:
    /// the historical behavior never toggled availability.
    pub mark_taxi_busy_on_assign: bool,
    /// Default radius for taxi proximity queries, kilometres.
    pub taxi_radius_km: f64,
    /// Default radius for shared-ride queries, metres.
    pub shared_ride_radius_m: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mark_taxi_busy_on_assign: false,
            taxi_radius_km: matching::DEFAULT_TAXI_RADIUS_KM,
            shared_ride_radius_m: matching::DEFAULT_SHARED_RIDE_RADIUS_M,
        }
    }
}

/// Coordinates store mutations, matching, and event fan-out. All operations
/// take the authenticated caller and enforce authorization before mutating.
pub struct Dispatcher {
    store: Arc<DispatchStore>,
    gateway: Arc<Gateway>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<DispatchStore>, gateway: Arc<Gateway>, config: DispatchConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Persists a new ride and immediately binds the nearest available taxi.
    /// Finding no taxi is not an error; the ride stays unassigned. Shared-
    /// seeking rides start in `shared` status. Matching and binding happen
    /// in one store call, so concurrent creations cannot both claim the
    /// same taxi.
    pub async fn create_ride(
        &self,
        caller: &Identity,
        start: (f64, f64),
        end: (f64, f64),
        shared: bool,
    ) -> Result<Ride> {
        let status = if shared {
            RideStatus::Shared
        } else {
            RideStatus::Waiting
        };
        let ride = self
            .store
            .create_ride_matched(
                caller.id,
                start,
                end,
                status,
                self.config.mark_taxi_busy_on_assign,
            )
            .await;
        info!(
            ride = %ride.id,
            passenger = %caller.id,
            taxi = ?ride.taxi,
            %status,
            "ride created"
        );
        Ok(ride)
    }

    pub async fn ride(&self, ride_id: RideId) -> Result<Ride> {
        self.store.ride(ride_id).await
    }

    /// A driver claims a ride. Only callers owning a taxi may accept, and
    /// the compare-and-set transition guarantees a single winner when two
    /// drivers race for the same ride. The transition, the taxi binding,
    /// and the availability flip are one store call, so a concurrent
    /// cancellation sees the accept fully applied or not at all. The
    /// passenger is notified on their personal group.
    pub async fn accept_by_taxi(&self, caller: &Identity, ride_id: RideId) -> Result<Ride> {
        let taxi = self
            .store
            .taxi_for_driver(caller.id)
            .await
            .ok_or(DispatchError::Forbidden(
                "only drivers with a registered taxi can accept rides",
            ))?;
        let ride = self
            .store
            .transition_and_assign(
                ride_id,
                &[RideStatus::Waiting, RideStatus::Shared],
                RideStatus::Accepted,
                taxi.id,
                self.config.mark_taxi_busy_on_assign,
            )
            .await?;
        info!(ride = %ride.id, driver = %caller.id, taxi = %taxi.id, "ride accepted");

        self.gateway
            .publish(
                GroupKey::User(ride.passenger),
                GroupEvent::RideStatus {
                    ride_id: ride.id,
                    status: ride.status,
                    taxi_id: ride.taxi,
                    message: "taxi accepted".to_string(),
                },
            )
            .await;
        Ok(ride)
    }

    /// Accepted → in_progress; pickup happened.
    pub async fn start_ride(&self, caller: &Identity, ride_id: RideId) -> Result<Ride> {
        self.authorize_participant(caller, ride_id).await?;
        let ride = self
            .store
            .transition_ride(ride_id, &[RideStatus::Accepted], RideStatus::InProgress)
            .await?;
        info!(ride = %ride.id, "ride started");
        self.publish_status(&ride, "ride started").await;
        Ok(ride)
    }

    /// In-progress → completed; frees the taxi under the busy policy.
    pub async fn complete_ride(&self, caller: &Identity, ride_id: RideId) -> Result<Ride> {
        self.authorize_participant(caller, ride_id).await?;
        let ride = self
            .store
            .transition_and_release(
                ride_id,
                &[RideStatus::InProgress, RideStatus::InRide],
                RideStatus::Completed,
                self.config.mark_taxi_busy_on_assign,
            )
            .await?;
        info!(ride = %ride.id, "ride completed");
        self.publish_status(&ride, "ride completed").await;
        Ok(ride)
    }

    /// Cancellation is reachable from any non-terminal state.
    pub async fn cancel_ride(&self, caller: &Identity, ride_id: RideId) -> Result<Ride> {
        self.authorize_participant(caller, ride_id).await?;
        let ride = self
            .store
            .transition_and_release(
                ride_id,
                NON_TERMINAL,
                RideStatus::Cancelled,
                self.config.mark_taxi_busy_on_assign,
            )
            .await?;
        info!(ride = %ride.id, "ride cancelled");
        self.publish_status(&ride, "ride cancelled").await;
        Ok(ride)
    }

    /// A rider asks to join a shared ride. Drivers may not join; a ride
    /// that already accepted a shared passenger refuses further requests.
    /// Requesting twice is idempotent. The ride owner is notified.
    pub async fn request_join(&self, caller: &Identity, ride_id: RideId) -> Result<Ride> {
        if caller.is_driver {
            return Err(DispatchError::Forbidden("drivers cannot join rides"));
        }
        let ride = self.store.add_pending_request(ride_id, caller.id).await?;
        info!(ride = %ride.id, requester = %caller.id, "join requested");

        self.gateway
            .publish(
                GroupKey::User(ride.passenger),
                GroupEvent::JoinRequested {
                    ride_id: ride.id,
                    requester_id: caller.id,
                    username: caller.username.clone(),
                },
            )
            .await;
        Ok(ride)
    }

    /// Current join requests, visible to the ride's passenger only.
    pub async fn pending_requests(&self, caller: &Identity, ride_id: RideId) -> Result<Vec<User>> {
        let ride = self.store.ride(ride_id).await?;
        if ride.passenger != caller.id {
            return Err(DispatchError::Forbidden(
                "only the ride's passenger may list join requests",
            ));
        }
        self.store.pending_requesters(ride_id).await
    }

    /// The passenger answers a join request. `accept` binds the shared
    /// passenger and clears every pending request; `refuse` removes only the
    /// named requester. Anything else is an invalid argument.
    pub async fn respond_join(
        &self,
        caller: &Identity,
        ride_id: RideId,
        requester: UserId,
        decision: &str,
    ) -> Result<Ride> {
        let ride = self.store.ride(ride_id).await?;
        if ride.passenger != caller.id {
            return Err(DispatchError::Forbidden(
                "only the ride's passenger may respond to join requests",
            ));
        }
        let ride = match decision {
            "accept" => {
                self.store.user(requester).await?;
                self.store.accept_join(ride_id, requester).await?
            }
            "refuse" => {
                self.store.user(requester).await?;
                self.store.remove_pending_request(ride_id, requester).await?
            }
            _ => {
                return Err(DispatchError::InvalidArgument(
                    "decision must be 'accept' or 'refuse'",
                ))
            }
        };
        info!(ride = %ride.id, requester = %requester, decision, "join request answered");

        self.gateway
            .publish(
                GroupKey::User(requester),
                GroupEvent::JoinDecision {
                    ride_id: ride.id,
                    decision: decision.to_string(),
                    passenger_id: caller.id,
                },
            )
            .await;
        Ok(ride)
    }

    /// Upserts the caller's rating for a taxi.
    pub async fn rate(&self, caller: &Identity, taxi_id: TaxiId, score: i64) -> Result<TaxiRating> {
        self.store.upsert_rating(taxi_id, caller.id, score).await
    }

    pub async fn average_rating(&self, taxi_id: TaxiId) -> Result<Option<(f64, usize)>> {
        self.store.average_rating(taxi_id).await
    }

    /// Persists a driver's position and fans it out: always to the driver's
    /// location group, and to the ride group as well while the taxi serves
    /// an active ride.
    pub async fn update_taxi_location(
        &self,
        caller: &Identity,
        taxi_id: TaxiId,
        lat: f64,
        lng: f64,
    ) -> Result<Taxi> {
        let taxi = self
            .store
            .update_taxi_position(taxi_id, caller.id, lat, lng)
            .await?;

        self.gateway
            .publish(
                GroupKey::Driver(taxi.driver),
                GroupEvent::DriverLocation {
                    driver_id: taxi.driver,
                    lat,
                    lng,
                    ts: Some(now_millis()),
                },
            )
            .await;

        if let Some(ride) = self.store.active_ride_for_taxi(taxi_id).await {
            self.gateway
                .publish(
                    GroupKey::Ride(ride.id),
                    GroupEvent::RideEvent {
                        action: "location".to_string(),
                        data: json!({ "lat": lat, "lng": lng, "taxi_id": taxi.id }),
                    },
                )
                .await;
        }
        Ok(taxi)
    }

    /// Available taxis within a kilometre radius of a point.
    pub async fn nearby_taxis(&self, lat: f64, lng: f64, radius_km: Option<f64>) -> Vec<Taxi> {
        let radius = radius_km.unwrap_or(self.config.taxi_radius_km);
        let taxis = self.store.available_taxis().await;
        matching::taxis_within_km(&taxis, lat, lng, radius)
    }

    /// Joinable shared rides within a metre radius of a point.
    pub async fn nearby_shared_rides(&self, lat: f64, lng: f64, radius_m: Option<f64>) -> Vec<Ride> {
        let radius = radius_m.unwrap_or(self.config.shared_ride_radius_m);
        let rides = self.store.rides_with_status(RideStatus::Shared).await;
        matching::shared_rides_within_m(&rides, lat, lng, radius)
    }

    /// Passenger, shared passenger, or the assigned driver.
    async fn authorize_participant(&self, caller: &Identity, ride_id: RideId) -> Result<()> {
        let ride = self.store.ride(ride_id).await?;
        if ride.passenger == caller.id || ride.shared_passenger == Some(caller.id) {
            return Ok(());
        }
        if let Some(taxi_id) = ride.taxi {
            let taxi = self.store.taxi(taxi_id).await?;
            if taxi.driver == caller.id {
                return Ok(());
            }
        }
        Err(DispatchError::Forbidden(
            "only ride participants may perform this action",
        ))
    }

    async fn publish_status(&self, ride: &Ride, message: &str) {
        self.gateway
            .publish(
                GroupKey::Ride(ride.id),
                GroupEvent::RideStatus {
                    ride_id: ride.id,
                    status: ride.status,
                    taxi_id: ride.taxi,
                    message: message.to_string(),
                },
            )
            .await;
    }
}
