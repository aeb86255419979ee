//! Ride-hailing dispatch core: taxi matching, ride lifecycle, and realtime
//! fan-out over local TCP connections.
//!
//! See `README.md` for the JSON line protocol. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the dispatch server.
//! - [`geo`] computes haversine distances (the two historical call sites use
//!   different Earth-radius units; both are kept).
//! - [`model`] defines taxis, rides, ratings, and the ride status machine.
//! - [`store`] owns all authoritative taxi/ride/rating state and serializes
//!   mutations, including compare-and-set status transitions.
//! - [`matching`] selects the nearest available taxi and answers radius
//!   queries over store snapshots.
//! - [`rides`] is the lifecycle controller: creation, acceptance, the
//!   shared-ride join negotiation, ratings, and location updates.
//! - [`gateway`] keeps named subscription groups and fans events out to the
//!   current members of each group.
//! - [`session`] accepts TCP connections, binds each to its group, and
//!   cleans up membership on disconnect.
//! - [`message`] provides the JSON line protocol plus helpers for async
//!   reads and writes.
//! - [`auth`] holds the identity contract and an in-memory token table.
//!
//! Integration and unit tests use this crate directly to exercise the store,
//! the matching engine, the gateway, and the wire protocol.

pub mod auth;
pub mod cli;
pub mod gateway;
pub mod geo;
pub mod matching;
pub mod message;
pub mod model;
pub mod rides;
pub mod session;
pub mod store;

mod error;

pub use error::DispatchError;
