//! Connection session manager.
//!
//! Accepts TCP connections, performs the `Hello` handshake, binds each
//! accepted connection to exactly one gateway group (or the api
//! request/response plane), and multiplexes inbound frames against group
//! deliveries. Group membership is held as a broadcast receiver owned by
//! the session task, so every exit path releases it without explicit
//! cleanup calls, whether the peer closed, a write failed, or the task
//! was aborted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::broadcast,
};
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, Identity, InMemoryAuth, SeedUser};
use crate::gateway::{Gateway, GroupKey};
use crate::message::{
    read_line, read_message, write_message, ApiOp, ApiRequest, ClientFrame, GroupEvent, Hello,
    ServerToClient, CLOSE_UNAUTHENTICATED,
};
use crate::model::{RideId, Taxi, UserId};
use crate::rides::{DispatchConfig, Dispatcher};
use crate::store::DispatchStore;

/// Everything a session needs: the auth collaborator, the authoritative
/// store, the gateway, and the lifecycle controller wired over them.
pub struct AppState {
    pub auth: InMemoryAuth,
    pub store: Arc<DispatchStore>,
    pub gateway: Arc<Gateway>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: DispatchConfig) -> Arc<Self> {
        let store = Arc::new(DispatchStore::new());
        let gateway = Arc::new(Gateway::new());
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&gateway), config);
        Arc::new(Self {
            auth: InMemoryAuth::new(),
            store,
            gateway,
            dispatcher,
        })
    }

    /// Registers a rider account and its bearer token.
    pub async fn register_rider(&self, token: &str, username: &str) -> Identity {
        self.register(token, username, false, false).await
    }

    /// Registers a driver account, its token, and the driver's taxi.
    pub async fn register_driver(
        &self,
        token: &str,
        username: &str,
        license_plate: &str,
        lat: f64,
        lng: f64,
    ) -> std::result::Result<(Identity, Taxi), crate::DispatchError> {
        let identity = self.register(token, username, true, false).await;
        let taxi = self
            .store
            .create_taxi(identity.id, license_plate, lat, lng)
            .await?;
        Ok((identity, taxi))
    }

    async fn register(
        &self,
        token: &str,
        username: &str,
        is_driver: bool,
        is_staff: bool,
    ) -> Identity {
        let user = self.store.add_user(username, is_driver).await;
        let identity = Identity {
            id: user.id,
            username: user.username,
            is_driver,
            is_staff,
        };
        self.auth.insert(token, identity.clone());
        identity
    }

    /// Loads startup accounts from a parsed seed file.
    pub async fn apply_seed(&self, entries: &[SeedUser]) -> Result<()> {
        for entry in entries {
            let identity = self
                .register(&entry.token, &entry.username, entry.is_driver, entry.is_staff)
                .await;
            if let Some(taxi) = &entry.taxi {
                self.store
                    .create_taxi(identity.id, &taxi.license_plate, taxi.lat, taxi.lng)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Accept loop for the dispatch server; one task per connection.
pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(listener: TcpListener, state: Arc<AppState>) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("dispatch server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_session(stream, peer, &state),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<AppState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

/// Which endpoint the connection bound to; decides how inbound frames are
/// interpreted.
enum Endpoint {
    Notifications,
    Ride { ride_id: RideId },
    Driver { driver_id: UserId },
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let hello = match read_message::<_, Hello>(&mut reader).await? {
        Some(hello) => hello,
        None => return Ok(()),
    };

    match hello {
        Hello::Notifications { token } => {
            let Some(identity) = state.auth.authenticate(&token) else {
                return refuse_unauthenticated(&mut writer).await;
            };
            let key = GroupKey::User(identity.id);
            info!(?peer, group = %key, user = %identity.username, "notifications session joined");
            run_group_session(&state, &mut reader, &mut writer, key, Endpoint::Notifications)
                .await?;
        }
        Hello::Ride { ride_id, .. } => {
            // The id must name an existing ride; otherwise close immediately.
            if state.store.ride(ride_id).await.is_err() {
                debug!(?peer, ride = %ride_id, "ride session refused: unknown ride");
                return Ok(());
            }
            let key = GroupKey::Ride(ride_id);
            info!(?peer, group = %key, "ride session joined");
            run_group_session(
                &state,
                &mut reader,
                &mut writer,
                key,
                Endpoint::Ride { ride_id },
            )
            .await?;
        }
        Hello::Driver { driver_id, .. } => {
            if state.store.taxi_for_driver(driver_id).await.is_none() {
                debug!(?peer, driver = %driver_id, "driver session refused: no such driver");
                return Ok(());
            }
            let key = GroupKey::Driver(driver_id);
            info!(?peer, group = %key, "driver session joined");
            run_group_session(
                &state,
                &mut reader,
                &mut writer,
                key,
                Endpoint::Driver { driver_id },
            )
            .await?;
        }
        Hello::Api { token } => {
            let Some(identity) = state.auth.authenticate(&token) else {
                return refuse_unauthenticated(&mut writer).await;
            };
            info!(?peer, user = %identity.username, "api session joined");
            run_api_session(&state, &mut reader, &mut writer, &identity).await?;
        }
    }

    info!(?peer, "session disconnected");
    Ok(())
}

async fn refuse_unauthenticated(writer: &mut OwnedWriteHalf) -> Result<()> {
    write_message(
        writer,
        &ServerToClient::Error {
            code: Some(CLOSE_UNAUTHENTICATED),
            message: "authentication required".to_string(),
        },
    )
    .await?;
    Ok(())
}

/// Subscription session loop: forwards group events to the socket while
/// interpreting inbound frames per endpoint. Dropping `events` when this
/// returns is what leaves the group.
async fn run_group_session(
    state: &AppState,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    key: GroupKey,
    endpoint: Endpoint,
) -> Result<()> {
    let mut events = state.gateway.subscribe(key).await;
    write_message(
        writer,
        &ServerToClient::Welcome {
            group: key.to_string(),
        },
    )
    .await?;

    // next_line is cancel safe, so losing the race against an event delivery
    // cannot drop a partially read inbound frame.
    let mut lines = (&mut *reader).lines();
    loop {
        select! {
            inbound = lines.next_line() => {
                match inbound? {
                    Some(line) => handle_inbound_frame(state, &endpoint, &line).await,
                    None => break,
                }
            }
            event = events.recv() => {
                if !forward_event(writer, event).await? {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Inbound frames are best-effort: malformed payloads are dropped silently.
async fn handle_inbound_frame(state: &AppState, endpoint: &Endpoint, line: &str) {
    let frame: ClientFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "dropping malformed inbound frame");
            return;
        }
    };

    match endpoint {
        // The server never acts on inbound notification frames.
        Endpoint::Notifications => {}
        // Any participant's frame is fanned out verbatim to the ride group.
        Endpoint::Ride { ride_id } => {
            state
                .gateway
                .publish(
                    GroupKey::Ride(*ride_id),
                    GroupEvent::RideEvent {
                        action: frame.action,
                        data: frame.data,
                    },
                )
                .await;
        }
        // Only location frames are honored; everything else is ignored.
        Endpoint::Driver { driver_id } => {
            if frame.action != "location" {
                return;
            }
            let (Some(lat), Some(lng)) = (
                frame.data.get("lat").and_then(Value::as_f64),
                frame.data.get("lng").and_then(Value::as_f64),
            ) else {
                debug!("dropping location frame without coordinates");
                return;
            };
            state
                .gateway
                .publish(
                    GroupKey::Driver(*driver_id),
                    GroupEvent::DriverLocation {
                        driver_id: *driver_id,
                        lat,
                        lng,
                        ts: frame.ts,
                    },
                )
                .await;
        }
    }
}

/// Returns false when the session should end (peer gone or group closed).
async fn forward_event(
    writer: &mut OwnedWriteHalf,
    event: Result<GroupEvent, broadcast::error::RecvError>,
) -> Result<bool> {
    match event {
        Ok(event) => {
            if let Err(err) = write_message(writer, &ServerToClient::Event(event)).await {
                debug!(error = ?err, "failed to deliver event to session");
                return Ok(false);
            }
            Ok(true)
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            let notice = ServerToClient::Error {
                code: None,
                message: format!("behind by {skipped} events; consider reconnecting"),
            };
            if let Err(err) = write_message(writer, &notice).await {
                debug!(error = ?err, "failed to notify session about lag");
                return Ok(false);
            }
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}

/// Request/response session: each line is one api request; malformed lines
/// get an error response rather than being dropped.
async fn run_api_session(
    state: &AppState,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &Identity,
) -> Result<()> {
    write_message(
        writer,
        &ServerToClient::Welcome {
            group: "api".to_string(),
        },
    )
    .await?;

    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(request) => handle_api_request(state, identity, request).await,
            Err(err) => {
                debug!(error = %err, "malformed api request");
                ServerToClient::ApiError {
                    id: 0,
                    kind: "invalid_argument".to_string(),
                    message: "malformed request".to_string(),
                }
            }
        };
        write_message(writer, &response).await?;
    }

    Ok(())
}

async fn handle_api_request(
    state: &AppState,
    identity: &Identity,
    request: ApiRequest,
) -> ServerToClient {
    let dispatcher = &state.dispatcher;
    let result = match request.op {
        ApiOp::CreateRide {
            start_lat,
            start_lng,
            end_lat,
            end_lng,
            shared,
        } => dispatcher
            .create_ride(identity, (start_lat, start_lng), (end_lat, end_lng), shared)
            .await
            .map(to_value),
        ApiOp::AcceptRide { ride_id } => dispatcher
            .accept_by_taxi(identity, ride_id)
            .await
            .map(to_value),
        ApiOp::StartRide { ride_id } => {
            dispatcher.start_ride(identity, ride_id).await.map(to_value)
        }
        ApiOp::CompleteRide { ride_id } => dispatcher
            .complete_ride(identity, ride_id)
            .await
            .map(to_value),
        ApiOp::CancelRide { ride_id } => dispatcher
            .cancel_ride(identity, ride_id)
            .await
            .map(to_value),
        ApiOp::RequestJoin { ride_id } => dispatcher
            .request_join(identity, ride_id)
            .await
            .map(|_| json!({ "status": "request_sent" })),
        ApiOp::PendingRequests { ride_id } => dispatcher
            .pending_requests(identity, ride_id)
            .await
            .map(|users| {
                Value::Array(
                    users
                        .iter()
                        .map(|user| json!({ "id": user.id, "username": user.username }))
                        .collect(),
                )
            }),
        ApiOp::RespondJoin {
            ride_id,
            requester_id,
            decision,
        } => dispatcher
            .respond_join(identity, ride_id, requester_id, &decision)
            .await
            .map(|_| json!({ "status": decision })),
        ApiOp::RateTaxi { taxi_id, score } => {
            dispatcher.rate(identity, taxi_id, score).await.map(to_value)
        }
        ApiOp::AverageRating { taxi_id } => {
            dispatcher.average_rating(taxi_id).await.map(|rating| {
                let (average, count) = match rating {
                    Some((average, count)) => (json!(average), count),
                    None => (Value::Null, 0),
                };
                json!({ "average": average, "count": count })
            })
        }
        ApiOp::UpdateLocation { taxi_id, lat, lng } => dispatcher
            .update_taxi_location(identity, taxi_id, lat, lng)
            .await
            .map(|_| json!({ "status": "ok" })),
        ApiOp::NearbyTaxis {
            lat,
            lng,
            radius_km,
        } => Ok(to_value(dispatcher.nearby_taxis(lat, lng, radius_km).await)),
        ApiOp::NearbyRides { lat, lng, radius_m } => Ok(to_value(
            dispatcher.nearby_shared_rides(lat, lng, radius_m).await,
        )),
    };

    match result {
        Ok(value) => ServerToClient::Response {
            id: request.id,
            result: value,
        },
        Err(err) => ServerToClient::ApiError {
            id: request.id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
