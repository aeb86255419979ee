//! JSON line protocol shared by the server, clients, and tests.
//!
//! Every frame is a single JSON object terminated by a newline, which keeps
//! the protocol usable from netcat-style tools. `read_message` and
//! `write_message` handle framing for any serde type; the session layer
//! reads raw lines on the ride and driver channels so that malformed frames
//! can be dropped without tearing the connection down.

use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::{RideId, RideStatus, TaxiId, UserId};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Close code written before refusing an unauthenticated connection on an
/// endpoint that requires an identity.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// First frame on every connection: names the channel the session binds to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Hello {
    /// Personal notification stream; requires an authenticated identity.
    Notifications { token: String },
    /// All participants of one ride.
    Ride {
        ride_id: RideId,
        #[serde(default)]
        token: Option<String>,
    },
    /// Location stream for one driver; may have multiple observers.
    Driver {
        driver_id: UserId,
        #[serde(default)]
        token: Option<String>,
    },
    /// Authenticated request/response channel for dispatch operations.
    Api { token: String },
}

/// Inbound frame on the ride and driver channels: `{action, data}` with an
/// optional client timestamp. Ride frames are fanned out verbatim; driver
/// frames are only honored for `action == "location"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ts: Option<u64>,
}

/// One request on the api channel. `id` is echoed back so callers can match
/// responses to in-flight requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: ApiOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiOp {
    CreateRide {
        start_lat: f64,
        start_lng: f64,
        end_lat: f64,
        end_lng: f64,
        #[serde(default)]
        shared: bool,
    },
    AcceptRide {
        ride_id: RideId,
    },
    StartRide {
        ride_id: RideId,
    },
    CompleteRide {
        ride_id: RideId,
    },
    CancelRide {
        ride_id: RideId,
    },
    RequestJoin {
        ride_id: RideId,
    },
    PendingRequests {
        ride_id: RideId,
    },
    RespondJoin {
        ride_id: RideId,
        requester_id: UserId,
        decision: String,
    },
    RateTaxi {
        taxi_id: TaxiId,
        score: i64,
    },
    AverageRating {
        taxi_id: TaxiId,
    },
    UpdateLocation {
        taxi_id: TaxiId,
        lat: f64,
        lng: f64,
    },
    NearbyTaxis {
        lat: f64,
        lng: f64,
        #[serde(default)]
        radius_km: Option<f64>,
    },
    NearbyRides {
        lat: f64,
        lng: f64,
        #[serde(default)]
        radius_m: Option<f64>,
    },
}

/// Events carried through gateway groups and delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GroupEvent {
    /// Lifecycle transition notification for a ride.
    RideStatus {
        ride_id: RideId,
        status: RideStatus,
        taxi_id: Option<TaxiId>,
        message: String,
    },
    /// A driver's position changed.
    DriverLocation {
        driver_id: UserId,
        lat: f64,
        lng: f64,
        ts: Option<u64>,
    },
    /// Verbatim fan-out of a client frame to a ride group.
    RideEvent { action: String, data: Value },
    /// Someone asked to join a shared ride; goes to the passenger's group.
    JoinRequested {
        ride_id: RideId,
        requester_id: UserId,
        username: String,
    },
    /// The passenger answered a join request; goes to the requester's group.
    JoinDecision {
        ride_id: RideId,
        decision: String,
        passenger_id: UserId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    /// Handshake succeeded; the session joined exactly this group.
    Welcome { group: String },
    /// A group event delivered to a subscriber.
    Event(GroupEvent),
    /// Successful api response; `result` shape depends on the operation.
    Response { id: u64, result: Value },
    /// Failed api request with the taxonomy kind.
    ApiError {
        id: u64,
        kind: String,
        message: String,
    },
    /// Connection-level refusal, written just before closing.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        message: String,
    },
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let line = match read_line(reader).await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if line.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(&line).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Reads one line without parsing it, skipping trailing line endings.
/// Returns `None` at end of stream. Used where malformed frames must be
/// tolerated instead of surfaced.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Encode to JSON once, append a newline delimiter, and flush so peers get timely updates.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
