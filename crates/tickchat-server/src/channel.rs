use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tickchat_proto::{ChannelId, ErrorCode, SystemEvent};
use tickchat_transport::Waker;
use tracing::warn;

use crate::connection::{ConnId, Connection};
use crate::error::Result;
use crate::queue::lock;

/// How a staged connection is announced once it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// First entry from the lobby.
    Join,
    /// Arrival from another channel.
    Rejoin,
}

impl JoinKind {
    pub fn event(self) -> SystemEvent {
        match self {
            Self::Join => SystemEvent::Join,
            Self::Rejoin => SystemEvent::Rejoin,
        }
    }
}

/// An entry of the join pool.
#[derive(Debug)]
pub(crate) enum Arrival {
    /// A slot held for a connection still owned by another channel.
    Reserved { timestamp: u64 },
    /// A connection ready to be registered.
    Ready {
        conn: Connection,
        kind: JoinKind,
        timestamp: u64,
    },
}

/// An entry of the leave pool.
#[derive(Debug)]
pub(crate) enum Departure {
    /// Hand the connection to `to`, which holds a reservation for it.
    Transfer { to: Arc<Channel>, timestamp: u64 },
}

/// A connection staged for registration.
#[derive(Debug)]
pub(crate) struct Landing {
    pub conn: Connection,
    pub kind: JoinKind,
    pub timestamp: u64,
}

/// Error notice to deliver to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    pub to: ConnId,
    pub code: ErrorCode,
}

#[derive(Debug, Default)]
struct Pools {
    joins: HashMap<ConnId, Arrival>,
    leaves: HashMap<ConnId, Departure>,
    members: usize,
    closed: bool,
}

impl Pools {
    fn occupancy(&self) -> usize {
        self.members + self.joins.len()
    }
}

/// Shared half of a channel.
///
/// Membership itself lives in the channel's worker. Everyone else talks to the
/// channel through its join and leave pools, which only the worker applies.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    capacity: usize,
    pools: Mutex<Pools>,
    empty_since: AtomicU64,
    outbox: Mutex<Vec<Notice>>,
    stop: AtomicBool,
    waker: Arc<Waker>,
}

impl Channel {
    /// A new, empty channel. `empty_since` starts at `now`.
    pub fn new(id: ChannelId, capacity: usize, now: u64) -> Result<Self> {
        Ok(Self {
            id,
            capacity,
            pools: Mutex::new(Pools::default()),
            empty_since: AtomicU64::new(now.max(1)),
            outbox: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            waker: Arc::new(Waker::new()?),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while members plus pending joins are below capacity.
    pub fn ping_pool(&self) -> bool {
        lock(&self.pools).occupancy() < self.capacity
    }

    /// Members as of the worker's last resolution pass.
    pub fn member_count(&self) -> usize {
        lock(&self.pools).members
    }

    /// Staged and reserved joins not yet applied.
    pub fn pending_joins(&self) -> usize {
        lock(&self.pools).joins.len()
    }

    /// Epoch ms since which the channel has been continuously empty, or 0.
    pub fn empty_since(&self) -> u64 {
        self.empty_since.load(Ordering::Acquire)
    }

    /// Stage `conn` for registration by the worker.
    ///
    /// Capacity is checked again under the pool lock; on refusal the connection
    /// is handed back untouched.
    pub fn stage_join(
        &self,
        conn: Connection,
        kind: JoinKind,
        timestamp: u64,
    ) -> std::result::Result<(), Connection> {
        {
            let mut pools = lock(&self.pools);
            if pools.closed || self.is_stopped() || pools.occupancy() >= self.capacity {
                return Err(conn);
            }
            self.empty_since.store(0, Ordering::Release);
            pools.joins.insert(
                conn.id(),
                Arrival::Ready {
                    conn,
                    kind,
                    timestamp,
                },
            );
        }
        self.wake();
        Ok(())
    }

    /// Hold a slot for a connection that will arrive from another channel.
    pub(crate) fn reserve(&self, id: ConnId, timestamp: u64) -> bool {
        let mut pools = lock(&self.pools);
        if pools.closed
            || self.is_stopped()
            || pools.joins.contains_key(&id)
            || pools.occupancy() >= self.capacity
        {
            return false;
        }
        self.empty_since.store(0, Ordering::Release);
        pools.joins.insert(id, Arrival::Reserved { timestamp });
        true
    }

    /// Fill a reservation with the connection itself.
    pub(crate) fn arrive(&self, conn: Connection) -> std::result::Result<(), Connection> {
        {
            let mut pools = lock(&self.pools);
            let timestamp = match pools.joins.get(&conn.id()) {
                Some(Arrival::Reserved { timestamp }) => *timestamp,
                _ => return Err(conn),
            };
            pools.joins.insert(
                conn.id(),
                Arrival::Ready {
                    conn,
                    kind: JoinKind::Rejoin,
                    timestamp,
                },
            );
        }
        self.wake();
        Ok(())
    }

    /// Release a reservation whose connection will never arrive.
    pub(crate) fn cancel_reservation(&self, id: ConnId, now: u64) {
        let mut pools = lock(&self.pools);
        if matches!(pools.joins.get(&id), Some(Arrival::Reserved { .. })) {
            pools.joins.remove(&id);
            Self::settle_locked(&self.empty_since, &pools, now);
        }
    }

    /// Ask the worker to hand `id` over to `to`.
    pub(crate) fn request_leave(&self, id: ConnId, to: Arc<Channel>, timestamp: u64) {
        lock(&self.pools)
            .leaves
            .insert(id, Departure::Transfer { to, timestamp });
        self.wake();
    }

    /// Queue an error notice for one member.
    pub fn post_notice(&self, notice: Notice) {
        lock(&self.outbox).push(notice);
        self.wake();
    }

    pub(crate) fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *lock(&self.outbox))
    }

    /// Drain pending leaves and every ready join.
    ///
    /// Ready joins are counted as members before the lock is released, so a
    /// capacity check always sees them somewhere. Reservations stay behind.
    pub(crate) fn take_pools(&self) -> (Vec<(ConnId, Departure)>, Vec<Landing>) {
        let mut pools = lock(&self.pools);
        let leaves: Vec<(ConnId, Departure)> = pools.leaves.drain().collect();

        let ready: Vec<ConnId> = pools
            .joins
            .iter()
            .filter(|(_, arrival)| matches!(arrival, Arrival::Ready { .. }))
            .map(|(id, _)| *id)
            .collect();
        let mut landings = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(Arrival::Ready {
                conn,
                kind,
                timestamp,
            }) = pools.joins.remove(&id)
            {
                landings.push(Landing {
                    conn,
                    kind,
                    timestamp,
                });
            }
        }
        pools.members += landings.len();
        (leaves, landings)
    }

    /// Publish the worker's member count and update `empty_since`.
    pub(crate) fn settle(&self, members: usize, now: u64) {
        let mut pools = lock(&self.pools);
        pools.members = members;
        Self::settle_locked(&self.empty_since, &pools, now);
    }

    fn settle_locked(empty_since: &AtomicU64, pools: &Pools, now: u64) {
        if pools.members == 0 && pools.joins.is_empty() {
            if empty_since.load(Ordering::Acquire) == 0 {
                empty_since.store(now.max(1), Ordering::Release);
            }
        } else {
            empty_since.store(0, Ordering::Release);
        }
    }

    /// Refuse all further joins if the channel has been idle for `idle_ms`.
    ///
    /// Returns whether the channel is now closed.
    pub(crate) fn close_if_idle(&self, now: u64, idle_ms: u64) -> bool {
        let mut pools = lock(&self.pools);
        if pools.closed {
            return true;
        }
        let since = self.empty_since.load(Ordering::Acquire);
        let idle = since != 0
            && now.saturating_sub(since) >= idle_ms
            && pools.members == 0
            && pools.joins.is_empty()
            && pools.leaves.is_empty();
        if idle {
            pools.closed = true;
        }
        idle
    }

    /// Ask the worker to exit after its current cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(channel = self.id, error = %err, "failed to wake channel worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connected_pair;

    #[test]
    fn ping_pool_until_capacity_is_reached() {
        let channel = Channel::new(1, 3, 100).unwrap();
        let mut clients = Vec::new();
        for expected_open in [true, true, true] {
            assert_eq!(channel.ping_pool(), expected_open);
            let (conn, client) = connected_pair();
            clients.push(client);
            channel.stage_join(conn, JoinKind::Join, 1).unwrap();
        }
        assert!(!channel.ping_pool());

        let (extra, _client) = connected_pair();
        let extra_id = extra.id();
        let returned = channel.stage_join(extra, JoinKind::Join, 1).unwrap_err();
        assert_eq!(returned.id(), extra_id);
        assert_eq!(channel.pending_joins(), 3);
    }

    #[test]
    fn staging_resets_empty_since() {
        let channel = Channel::new(1, 4, 100).unwrap();
        assert_eq!(channel.empty_since(), 100);

        let (conn, _client) = connected_pair();
        channel.stage_join(conn, JoinKind::Join, 1).unwrap();
        assert_eq!(channel.empty_since(), 0);
    }

    #[test]
    fn take_pools_moves_ready_joins_into_members() {
        let channel = Channel::new(1, 4, 100).unwrap();
        let (conn, _client) = connected_pair();
        channel.stage_join(conn, JoinKind::Join, 7).unwrap();
        assert!(channel.reserve(999_999, 8));

        let (leaves, landings) = channel.take_pools();
        assert!(leaves.is_empty());
        assert_eq!(landings.len(), 1);
        assert_eq!(landings[0].timestamp, 7);
        assert_eq!(channel.member_count(), 1);
        assert_eq!(channel.pending_joins(), 1);
    }

    #[test]
    fn reservation_counts_toward_capacity_and_can_be_filled() {
        let channel = Channel::new(2, 1, 100).unwrap();
        let (conn, _client) = connected_pair();
        let id = conn.id();

        assert!(channel.reserve(id, 42));
        assert!(!channel.ping_pool());
        assert!(!channel.reserve(id, 43));

        channel.arrive(conn).unwrap();
        let (_, landings) = channel.take_pools();
        assert_eq!(landings[0].kind, JoinKind::Rejoin);
        assert_eq!(landings[0].timestamp, 42);
    }

    #[test]
    fn arrive_without_reservation_is_refused() {
        let channel = Channel::new(2, 4, 100).unwrap();
        let (conn, _client) = connected_pair();
        assert!(channel.arrive(conn).is_err());
    }

    #[test]
    fn cancelled_reservation_frees_the_slot_and_marks_empty() {
        let channel = Channel::new(2, 1, 100).unwrap();
        assert!(channel.reserve(5, 1));
        assert_eq!(channel.empty_since(), 0);

        channel.cancel_reservation(5, 200);
        assert!(channel.ping_pool());
        assert_eq!(channel.empty_since(), 200);
    }

    #[test]
    fn settle_tracks_emptiness() {
        let channel = Channel::new(3, 4, 100).unwrap();
        channel.settle(2, 150);
        assert_eq!(channel.empty_since(), 0);
        channel.settle(0, 300);
        assert_eq!(channel.empty_since(), 300);
        channel.settle(0, 400);
        assert_eq!(channel.empty_since(), 300);
    }

    #[test]
    fn close_if_idle_respects_window_and_is_sticky() {
        let channel = Channel::new(3, 4, 1_000).unwrap();
        assert!(!channel.close_if_idle(1_500, 1_000));
        assert!(channel.close_if_idle(2_000, 1_000));
        assert!(channel.close_if_idle(2_000, 1_000));

        let (conn, _client) = connected_pair();
        assert!(channel.stage_join(conn, JoinKind::Join, 1).is_err());
        assert!(!channel.reserve(77, 1));
    }

    #[test]
    fn notices_are_taken_once() {
        let channel = Channel::new(3, 4, 1).unwrap();
        channel.post_notice(Notice {
            to: 10,
            code: ErrorCode::ChannelFull,
        });
        assert_eq!(channel.take_notices().len(), 1);
        assert!(channel.take_notices().is_empty());
    }
}
