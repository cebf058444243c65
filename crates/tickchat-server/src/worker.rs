use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tickchat_frame::FrameConfig;
use tickchat_proto::{ErrorCode, SystemEvent};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::{BroadcastWindow, ChatEvent, EventQueue};
use crate::channel::{Channel, Departure, Landing};
use crate::clock::now_ms;
use crate::connection::{ConnId, Connection, Group};
use crate::error::Result;
use crate::pump::{ConnectionPump, Request, RequestHandler};
use crate::report::{Report, ReportSink};
use crate::scheduler::{Phase, Scheduler, Task};

type WorkerTask = Task<ChannelWorker>;

/// Request handling for members of one channel.
struct ChannelHandler<'a> {
    channel: &'a Channel,
    events: &'a EventQueue,
    reports: &'a ReportSink,
    moving: &'a mut HashSet<ConnId>,
}

impl RequestHandler for ChannelHandler<'_> {
    fn on_request(&mut self, pump: &mut ConnectionPump, from: ConnId, request: Request) {
        let Some(conn) = pump.get(from) else {
            return;
        };
        let channel = self.channel.id();

        match request {
            Request::Message { text, timestamp } => {
                self.events.push(ChatEvent::user(
                    from,
                    conn.display_name(),
                    text,
                    timestamp,
                    channel,
                ));
            }
            Request::Switch {
                channel: to,
                timestamp,
            } => {
                if to == channel {
                    debug!(channel, conn = from, "switch to current channel ignored");
                    return;
                }
                if !self.moving.insert(from) {
                    debug!(channel, conn = from, "switch already pending");
                    return;
                }
                self.reports.submit(Report {
                    from: channel,
                    to,
                    conn: from,
                    name: conn.display_name().to_string(),
                    timestamp: timestamp.unwrap_or_else(now_ms),
                });
            }
            Request::Join { .. } => {
                warn!(channel, conn = from, "lobby join from a channel member");
            }
        }
    }

    fn on_close(&mut self, conn: Connection) {
        self.moving.remove(&conn.id());
        self.events.push(ChatEvent::system(
            conn.id(),
            conn.display_name(),
            SystemEvent::Leave,
            now_ms(),
            self.channel.id(),
        ));
    }
}

/// The private half of a channel, driven by its own thread.
///
/// One cycle: clear the last window (`Pre`), poll members (`Io`), then apply
/// pools, deliver notices, broadcast the window, drop dead members and publish
/// the member count (`Logic`).
pub struct ChannelWorker {
    channel: Arc<Channel>,
    pump: ConnectionPump,
    events: EventQueue,
    window: BroadcastWindow,
    reports: ReportSink,
    moving: HashSet<ConnId>,
    poll_timeout: Duration,
}

impl ChannelWorker {
    pub fn new(
        channel: Arc<Channel>,
        reports: ReportSink,
        poll_timeout: Duration,
        frame: FrameConfig,
    ) -> Result<Self> {
        let pump = ConnectionPump::new(format!("channel-{}", channel.id()), channel.capacity(), frame)?
            .with_waker(channel.waker())?;
        Ok(Self {
            channel,
            pump,
            events: EventQueue::new(),
            window: BroadcastWindow::new(),
            reports,
            moving: HashSet::new(),
            poll_timeout,
        })
    }

    /// The task set of one channel cycle.
    pub fn scheduler() -> Scheduler<ChannelWorker> {
        let mut scheduler = Scheduler::new();
        scheduler.push_back(
            Phase::Pre,
            WorkerTask::once("announce", |worker, _| {
                info!(
                    channel = worker.channel.id(),
                    capacity = worker.channel.capacity(),
                    "channel worker started"
                );
            }),
        );
        scheduler.push_back(
            Phase::Pre,
            WorkerTask::persistent("clear-window", |worker, _| worker.window.clear()),
        );
        scheduler.push_back(Phase::Io, WorkerTask::persistent("poll", |worker, _| worker.poll()));
        scheduler.push_back(
            Phase::Logic,
            WorkerTask::persistent("resolve-pool", |worker, _| worker.resolve_pool()),
        );
        scheduler.push_back(
            Phase::Logic,
            WorkerTask::persistent("flush-notices", |worker, _| worker.flush_notices()),
        );
        scheduler.push_back(
            Phase::Logic,
            WorkerTask::persistent("resolve-broadcast", |worker, _| worker.resolve_broadcast()),
        );
        scheduler.push_back(
            Phase::Logic,
            WorkerTask::persistent("resolve-deletion", |worker, _| worker.resolve_deletion()),
        );
        scheduler.push_back(
            Phase::Logic,
            WorkerTask::persistent("settle", |worker, _| worker.settle()),
        );
        scheduler
    }

    /// Run cycles until the channel is stopped.
    pub fn run(mut self) {
        let mut scheduler = Self::scheduler();
        while !self.channel.is_stopped() {
            scheduler.run(&mut self);
        }
        info!(
            channel = self.channel.id(),
            members = self.pump.len(),
            cycles = scheduler.cycles(),
            "channel worker stopped"
        );
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Producer handle for this channel's broadcast stream.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn member_ids(&self) -> Vec<ConnId> {
        self.pump.ids()
    }

    fn split(&mut self) -> (&mut ConnectionPump, ChannelHandler<'_>) {
        (
            &mut self.pump,
            ChannelHandler {
                channel: &self.channel,
                events: &self.events,
                reports: &self.reports,
                moving: &mut self.moving,
            },
        )
    }

    fn poll(&mut self) {
        let timeout = Some(self.poll_timeout);
        let channel = Arc::clone(&self.channel);
        let (pump, mut handler) = self.split();
        if let Err(err) = pump.pump(timeout, &mut handler) {
            error!(channel = channel.id(), error = %err, "poll failed, stopping channel");
            channel.stop();
        }
    }

    fn resolve_pool(&mut self) {
        let (leaves, landings) = self.channel.take_pools();
        let channel = self.channel.id();

        for (id, departure) in leaves {
            let Departure::Transfer { to, timestamp } = departure;
            self.moving.remove(&id);
            if self.pump.is_marked(id) {
                to.cancel_reservation(id, now_ms());
                continue;
            }
            let Some(mut conn) = self.pump.detach(id) else {
                to.cancel_reservation(id, now_ms());
                continue;
            };

            self.events.push(ChatEvent::system(
                id,
                conn.display_name(),
                SystemEvent::Leave,
                timestamp,
                channel,
            ));
            conn.set_group(Group::Channel(to.id()));
            match to.arrive(conn) {
                Ok(()) => debug!(conn = id, from = channel, to = to.id(), "connection handed over"),
                Err(conn) => warn!(
                    conn = conn.id(),
                    to = to.id(),
                    "destination lost its reservation, closing connection"
                ),
            }
        }

        for Landing {
            mut conn,
            kind,
            timestamp,
        } in landings
        {
            conn.set_group(Group::Channel(channel));
            let id = conn.id();
            let name = conn.display_name().to_string();
            match self.pump.attach(conn) {
                Ok(()) => {
                    debug!(channel, conn = id, name = %name, ?kind, "member registered");
                    self.events
                        .push(ChatEvent::system(id, &name, kind.event(), timestamp, channel));
                }
                Err(rejected) => {
                    let (err, mut conn) = rejected.into_parts();
                    warn!(channel, conn = id, error = %err, "could not register member");
                    conn.refuse(ErrorCode::ChannelFull);
                }
            }
        }
    }

    fn flush_notices(&mut self) {
        for notice in self.channel.take_notices() {
            self.moving.remove(&notice.to);
            self.pump.send_to(notice.to, &notice.code.payload());
        }
    }

    fn resolve_broadcast(&mut self) {
        self.window.absorb(&self.events);
        match self.window.batch() {
            Ok(Some(payload)) => {
                let failed = self.pump.broadcast(&payload);
                trace!(
                    channel = self.channel.id(),
                    events = self.window.len(),
                    recipients = self.pump.len(),
                    failed,
                    "window broadcast"
                );
            }
            Ok(None) => {}
            Err(err) => error!(channel = self.channel.id(), error = %err, "failed to encode batch"),
        }
    }

    fn resolve_deletion(&mut self) {
        let (pump, mut handler) = self.split();
        pump.resolve_deletion(&mut handler);
    }

    fn settle(&mut self) {
        self.channel.settle(self.pump.len(), now_ms());
    }
}

impl std::fmt::Debug for ChannelWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWorker")
            .field("channel", &self.channel.id())
            .field("pump", &self.pump)
            .field("window", &self.window.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::time::Instant;

    use tickchat_frame::FrameReader;
    use tickchat_proto::{EventKind, ServerEvent, ServerFrame};

    use super::*;
    use crate::channel::JoinKind;
    use crate::connection::tests::connected_pair;
    use crate::queue::SharedQueue;

    fn worker(capacity: usize) -> (ChannelWorker, SharedQueue<Report>) {
        let channel = Arc::new(Channel::new(9, capacity, now_ms()).unwrap());
        let reports = SharedQueue::new();
        let sink = ReportSink::new(reports.clone(), None);
        let worker = ChannelWorker::new(
            channel,
            sink,
            Duration::from_millis(10),
            FrameConfig::default(),
        )
        .unwrap();
        (worker, reports)
    }

    fn join(worker: &ChannelWorker, name: &str, timestamp: u64) -> TcpStream {
        let (mut conn, client) = connected_pair();
        conn.set_name(name);
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        worker
            .channel()
            .stage_join(conn, JoinKind::Join, timestamp)
            .unwrap();
        client
    }

    fn next_batch(client: &mut TcpStream) -> Vec<ServerEvent> {
        let frame = FrameReader::new().read_frame(client).unwrap();
        match ServerFrame::from_slice(&frame).unwrap() {
            ServerFrame::Batch(events) => events,
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn joins_and_message_share_one_ordered_window() {
        let (mut worker, _) = worker(8);
        let mut scheduler = ChannelWorker::scheduler();

        let mut alice = join(&worker, "alice", 1);
        let mut bob = join(&worker, "bob", 2);
        worker
            .events()
            .push(ChatEvent::user(0, "alice", "hi", 3, 9));
        scheduler.run(&mut worker);

        for client in [&mut alice, &mut bob] {
            let batch = next_batch(client);
            let summary: Vec<(EventKind, &str, &str)> = batch
                .iter()
                .map(|e| (e.kind, e.user_name.as_str(), e.event.as_str()))
                .collect();
            assert_eq!(
                summary,
                vec![
                    (EventKind::System, "alice", "join"),
                    (EventKind::System, "bob", "join"),
                    (EventKind::User, "alice", "hi"),
                ]
            );
        }
        assert_eq!(worker.channel().member_count(), 2);
        assert_eq!(worker.channel().empty_since(), 0);
    }

    #[test]
    fn message_from_member_is_broadcast_with_its_name() {
        use std::io::Write;

        let (mut worker, _) = worker(8);
        let mut scheduler = ChannelWorker::scheduler();
        let mut gail = join(&worker, "gail", 1);
        scheduler.run(&mut worker);
        next_batch(&mut gail);

        let mut wire = bytes::BytesMut::new();
        tickchat_frame::encode_frame(br#"{"type":"message","text":"hello","timestamp":50}"#, &mut wire)
            .unwrap();
        gail.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while worker.window.is_empty() {
            assert!(Instant::now() < deadline, "message never arrived");
            scheduler.run(&mut worker);
        }
        let batch = next_batch(&mut gail);
        assert_eq!(batch, vec![ServerEvent::user("gail", "hello", 50, 9)]);
    }

    #[test]
    fn switch_request_is_reported_once() {
        use std::io::Write;

        let (mut worker, reports) = worker(8);
        let mut scheduler = ChannelWorker::scheduler();
        let mut hal = join(&worker, "hal", 1);
        scheduler.run(&mut worker);
        next_batch(&mut hal);

        let mut wire = bytes::BytesMut::new();
        for payload in [
            &br#"{"type":"join","channel_id":9}"#[..],
            br#"{"type":"join","channel_id":4,"timestamp":77}"#,
            br#"{"type":"join","channel_id":5}"#,
        ] {
            tickchat_frame::encode_frame(payload, &mut wire).unwrap();
        }
        hal.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while reports.is_empty() {
            assert!(Instant::now() < deadline, "switch never reported");
            scheduler.run(&mut worker);
        }
        scheduler.run(&mut worker);

        let reported = reports.drain();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].from, 9);
        assert_eq!(reported[0].to, 4);
        assert_eq!(reported[0].name, "hal");
        assert_eq!(reported[0].timestamp, 77);
    }

    #[test]
    fn departed_member_is_announced_and_channel_goes_empty() {
        let (mut worker, _) = worker(8);
        let mut scheduler = ChannelWorker::scheduler();
        let mut ivy = join(&worker, "ivy", 1);
        let jon = join(&worker, "jon", 2);
        scheduler.run(&mut worker);
        next_batch(&mut ivy);

        drop(jon);
        let deadline = Instant::now() + Duration::from_secs(3);
        while worker.channel().member_count() != 1 {
            assert!(Instant::now() < deadline, "hangup never resolved");
            scheduler.run(&mut worker);
        }
        scheduler.run(&mut worker);

        let batch = next_batch(&mut ivy);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].user_name, "jon");
        assert_eq!(batch[0].event, "leave");

        drop(ivy);
        while worker.channel().member_count() != 0 {
            assert!(Instant::now() < deadline, "second hangup never resolved");
            scheduler.run(&mut worker);
        }
        assert_ne!(worker.channel().empty_since(), 0);
    }

    #[test]
    fn notices_reach_their_member() {
        let (mut worker, _) = worker(8);
        let mut scheduler = ChannelWorker::scheduler();
        let mut kim = join(&worker, "kim", 1);
        scheduler.run(&mut worker);
        next_batch(&mut kim);

        let id = worker.member_ids()[0];
        worker.channel().post_notice(crate::channel::Notice {
            to: id,
            code: ErrorCode::ChannelFull,
        });
        scheduler.run(&mut worker);

        let frame = FrameReader::new().read_frame(&mut kim).unwrap();
        assert_eq!(frame.as_ref(), ErrorCode::ChannelFull.payload().as_ref());
    }
}
