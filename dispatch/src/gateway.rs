//! Broadcast gateway: named subscription groups with per-group fan-out.
//!
//! Reimplements the channel-layer group registry as an explicit in-process
//! map from group key to a Tokio `broadcast` sender. Publishing is
//! fire-and-forget and at-most-once: membership changes take effect for
//! subsequent publishes only, nothing is buffered for members that have not
//! joined, and a publish to an empty group is a no-op rather than an error.
//! Delivery order is FIFO within one group; there is no cross-group
//! ordering guarantee.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::message::GroupEvent;
use crate::model::{RideId, UserId};

/// Broadcast channel depth per group. Lagging subscribers lose the oldest
/// events, consistent with best-effort delivery.
const GROUP_CAPACITY: usize = 128;

/// The three group kinds: a user's personal notifications, all participants
/// of one ride, and the observers of one driver's location stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    User(UserId),
    Ride(RideId),
    Driver(UserId),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::User(id) => write!(f, "user:{id}"),
            GroupKey::Ride(id) => write!(f, "ride:{id}"),
            GroupKey::Driver(id) => write!(f, "driver:{id}"),
        }
    }
}

/// Owner of all group membership tables. Sessions subscribe on connect and
/// leave by dropping their receiver; senders with no remaining receivers are
/// pruned lazily on the next publish.
#[derive(Default)]
pub struct Gateway {
    groups: Mutex<HashMap<GroupKey, broadcast::Sender<GroupEvent>>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a group, creating it lazily. Dropping the returned receiver is
    /// leaving the group.
    pub async fn subscribe(&self, key: GroupKey) -> broadcast::Receiver<GroupEvent> {
        let mut groups = self.groups.lock().await;
        groups
            .entry(key)
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Delivers an event to every current member of the group. Returns the
    /// number of members reached; zero members is a no-op, never an error.
    pub async fn publish(&self, key: GroupKey, event: GroupEvent) -> usize {
        let mut groups = self.groups.lock().await;
        let Some(sender) = groups.get(&key) else {
            debug!(group = %key, "publish to absent group dropped");
            return 0;
        };
        match sender.send(event) {
            Ok(delivered) => {
                debug!(group = %key, delivered, "published group event");
                delivered
            }
            Err(_) => {
                // Every receiver has gone away; forget the group.
                groups.remove(&key);
                debug!(group = %key, "pruned empty group");
                0
            }
        }
    }

    /// Current membership size of a group.
    pub async fn member_count(&self, key: GroupKey) -> usize {
        let groups = self.groups.lock().await;
        groups
            .get(&key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_event(driver: u64) -> GroupEvent {
        GroupEvent::DriverLocation {
            driver_id: UserId(driver),
            lat: 36.8,
            lng: 10.18,
            ts: None,
        }
    }

    #[test]
    fn group_names_follow_the_kind_id_scheme() {
        assert_eq!(GroupKey::User(UserId(3)).to_string(), "user:3");
        assert_eq!(GroupKey::Ride(RideId(7)).to_string(), "ride:7");
        assert_eq!(GroupKey::Driver(UserId(1)).to_string(), "driver:1");
    }

    #[tokio::test]
    async fn publish_reaches_every_member_exactly_once() {
        let gateway = Gateway::new();
        let key = GroupKey::Driver(UserId(1));
        let mut first = gateway.subscribe(key).await;
        let mut second = gateway.subscribe(key).await;

        let delivered = gateway.publish(key, location_event(1)).await;
        assert_eq!(delivered, 2);

        assert_eq!(first.recv().await.expect("first member"), location_event(1));
        assert_eq!(second.recv().await.expect("second member"), location_event(1));
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_to_empty_group_is_a_noop() {
        let gateway = Gateway::new();
        let delivered = gateway
            .publish(GroupKey::Ride(RideId(9)), location_event(1))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn dropped_members_stop_receiving_and_the_group_is_pruned() {
        let gateway = Gateway::new();
        let key = GroupKey::Ride(RideId(4));
        let receiver = gateway.subscribe(key).await;
        assert_eq!(gateway.member_count(key).await, 1);

        drop(receiver);
        let delivered = gateway.publish(key, location_event(1)).await;
        assert_eq!(delivered, 0);
        assert_eq!(gateway.member_count(key).await, 0);
    }

    #[tokio::test]
    async fn delivery_is_fifo_within_a_group() {
        let gateway = Gateway::new();
        let key = GroupKey::User(UserId(5));
        let mut member = gateway.subscribe(key).await;

        for ts in 1..=3u64 {
            let event = GroupEvent::DriverLocation {
                driver_id: UserId(1),
                lat: 0.0,
                lng: 0.0,
                ts: Some(ts),
            };
            gateway.publish(key, event).await;
        }

        for expected in 1..=3u64 {
            match member.recv().await.expect("event") {
                GroupEvent::DriverLocation { ts, .. } => assert_eq!(ts, Some(expected)),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn groups_are_isolated_from_each_other() {
        let gateway = Gateway::new();
        let mut ride_member = gateway.subscribe(GroupKey::Ride(RideId(1))).await;
        let mut user_member = gateway.subscribe(GroupKey::User(UserId(1))).await;

        gateway.publish(GroupKey::Ride(RideId(1)), location_event(9)).await;

        assert!(ride_member.try_recv().is_ok());
        assert!(user_member.try_recv().is_err());
    }
}
