use std::time::Duration;

use tickchat_proto::{validate_name, ChannelId, ErrorCode, ProtoError};
use tracing::{debug, warn};

use crate::channel::JoinKind;
use crate::clock::now_ms;
use crate::connection::{ConnId, Connection, Group};
use crate::manager::ChannelManager;
use crate::pump::{ConnectionPump, Request, RequestHandler};

/// Request handling for connections that have not joined a channel yet.
pub struct LobbyHandler<'a> {
    manager: &'a ChannelManager,
}

impl<'a> LobbyHandler<'a> {
    pub fn new(manager: &'a ChannelManager) -> Self {
        Self { manager }
    }

    fn join(
        &mut self,
        pump: &mut ConnectionPump,
        from: ConnId,
        channel: ChannelId,
        name: Option<String>,
        timestamp: u64,
    ) {
        let name = match name.as_deref().map(validate_name) {
            Some(Ok(name)) => name.to_string(),
            None | Some(Err(ProtoError::NameRequired)) => {
                return refuse(pump, from, ErrorCode::NameRequired);
            }
            Some(Err(_)) => return refuse(pump, from, ErrorCode::NameTooLong),
        };

        let target = match self.manager.get_or_create(channel) {
            Ok(target) => target,
            Err(err) => {
                warn!(conn = from, channel, error = %err, "could not open channel");
                return refuse(pump, from, ErrorCode::ChannelFull);
            }
        };
        if !target.ping_pool() {
            debug!(conn = from, channel, "channel full");
            return refuse(pump, from, ErrorCode::ChannelFull);
        }

        let Some(mut conn) = pump.detach(from) else {
            return;
        };
        conn.set_name(name);
        conn.set_group(Group::Channel(channel));

        match target.stage_join(conn, JoinKind::Join, timestamp) {
            Ok(()) => debug!(conn = from, channel, "join staged"),
            Err(mut conn) => {
                debug!(conn = from, channel, "channel filled up before staging");
                conn.set_group(Group::Lobby);
                if !conn.refuse(ErrorCode::ChannelFull) {
                    return;
                }
                if let Err(rejected) = pump.attach(conn) {
                    warn!(conn = from, error = %rejected.error, "could not return connection to lobby");
                }
            }
        }
    }
}

fn refuse(pump: &mut ConnectionPump, to: ConnId, code: ErrorCode) {
    debug!(conn = to, reason = %code, "lobby request refused");
    pump.send_to(to, &code.payload());
}

impl RequestHandler for LobbyHandler<'_> {
    fn on_request(&mut self, pump: &mut ConnectionPump, from: ConnId, request: Request) {
        match request {
            Request::Join {
                channel,
                name,
                timestamp,
            } => self.join(pump, from, channel, name, timestamp.unwrap_or_else(now_ms)),
            other => debug!(conn = from, request = ?other, "ignored in lobby"),
        }
    }

    fn on_close(&mut self, conn: Connection) {
        debug!(conn = conn.id(), peer = %conn.peer(), "lobby connection closed");
    }
}

/// Send `Lobby timeout.` to every connection that has waited in the lobby for
/// at least `timeout`, and mark it for deletion. Returns how many were evicted.
pub fn check_lobby(pump: &mut ConnectionPump, now: u64, timeout: Duration) -> usize {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let expired: Vec<ConnId> = pump
        .connections()
        .filter(|conn| now.saturating_sub(conn.accepted_at()) >= timeout_ms)
        .map(Connection::id)
        .filter(|id| !pump.is_marked(*id))
        .collect();

    for id in &expired {
        debug!(conn = *id, "lobby timeout");
        pump.send_to(*id, &ErrorCode::LobbyTimeout.payload());
        pump.mark(*id);
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Instant;

    use tickchat_frame::{encode_frame, FrameConfig, FrameReader};

    use super::*;
    use crate::config::ChannelSettings;
    use crate::connection::tests::connected_pair;

    fn lobby_with(conn: Connection) -> ConnectionPump {
        let mut pump = ConnectionPump::new("lobby", 8, FrameConfig::default()).unwrap();
        pump.attach(conn).unwrap();
        pump
    }

    fn manager(capacity: usize) -> ChannelManager {
        ChannelManager::new(
            ChannelSettings {
                capacity,
                poll_timeout: Duration::from_millis(10),
                ..ChannelSettings::default()
            },
            None,
        )
    }

    fn send(client: &mut TcpStream, payload: &[u8]) {
        let mut wire = bytes::BytesMut::new();
        encode_frame(payload, &mut wire).unwrap();
        client.write_all(&wire).unwrap();
    }

    fn pump_until(
        pump: &mut ConnectionPump,
        manager: &ChannelManager,
        mut done: impl FnMut(&ConnectionPump) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut handler = LobbyHandler::new(manager);
        while !done(pump) {
            assert!(Instant::now() < deadline, "condition never reached");
            pump.pump(Some(Duration::from_millis(20)), &mut handler).unwrap();
        }
    }

    fn read_error(client: &mut TcpStream) -> Vec<u8> {
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        FrameReader::new().read_frame(client).unwrap().to_vec()
    }

    #[test]
    fn valid_join_leaves_lobby() {
        let manager = manager(4);
        let (conn, mut client) = connected_pair();
        let mut lobby = lobby_with(conn);

        send(
            &mut client,
            br#"{"type":"join","channel_id":6,"user_name":"pat","timestamp":1}"#,
        );
        pump_until(&mut lobby, &manager, |pump| pump.is_empty());

        let channel = manager.get(6).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while channel.member_count() != 1 {
            assert!(Instant::now() < deadline, "join never applied");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn join_without_name_is_refused_and_stays() {
        let manager = manager(4);
        let (conn, mut client) = connected_pair();
        let mut lobby = lobby_with(conn);

        send(&mut client, br#"{"type":"join","channel_id":6}"#);
        let mut handler = LobbyHandler::new(&manager);
        let frame = std::thread::scope(|scope| {
            let reader = scope.spawn(|| read_error(&mut client));
            let deadline = Instant::now() + Duration::from_secs(3);
            while !reader.is_finished() {
                assert!(Instant::now() < deadline, "no refusal arrived");
                lobby
                    .pump(Some(Duration::from_millis(20)), &mut handler)
                    .unwrap();
            }
            reader.join().unwrap()
        });

        assert_eq!(frame, ErrorCode::NameRequired.payload().to_vec());
        assert_eq!(lobby.len(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn overlong_name_is_refused() {
        let manager = manager(4);
        let (conn, mut client) = connected_pair();
        let mut lobby = lobby_with(conn);

        let payload = format!(
            r#"{{"type":"join","channel_id":1,"user_name":"{}"}}"#,
            "q".repeat(64)
        );
        send(&mut client, payload.as_bytes());
        let mut handler = LobbyHandler::new(&manager);
        for _ in 0..20 {
            lobby
                .pump(Some(Duration::from_millis(10)), &mut handler)
                .unwrap();
        }
        assert_eq!(read_error(&mut client), ErrorCode::NameTooLong.payload().to_vec());
        assert_eq!(lobby.len(), 1);
    }

    #[test]
    fn full_channel_keeps_connection_in_lobby() {
        let manager = manager(1);
        let channel = manager.get_or_create(2).unwrap();
        let (mut occupant, _occupant_client) = connected_pair();
        occupant.set_name("ray");
        channel.stage_join(occupant, JoinKind::Join, 1).unwrap();

        let (conn, mut client) = connected_pair();
        let mut lobby = lobby_with(conn);
        send(
            &mut client,
            br#"{"type":"join","channel_id":2,"user_name":"sue"}"#,
        );
        let mut handler = LobbyHandler::new(&manager);
        for _ in 0..20 {
            lobby
                .pump(Some(Duration::from_millis(10)), &mut handler)
                .unwrap();
        }
        assert_eq!(read_error(&mut client), ErrorCode::ChannelFull.payload().to_vec());
        assert_eq!(lobby.len(), 1);
        assert_eq!(
            lobby.connections().next().map(Connection::group),
            Some(Group::Lobby)
        );
    }

    #[test]
    fn lobby_timeout_evicts_after_window() {
        let (conn, mut client) = connected_pair();
        let accepted = conn.accepted_at();
        let mut lobby = lobby_with(conn);

        assert_eq!(check_lobby(&mut lobby, accepted + 4_999, Duration::from_secs(5)), 0);
        assert_eq!(check_lobby(&mut lobby, accepted + 5_000, Duration::from_secs(5)), 1);
        assert_eq!(check_lobby(&mut lobby, accepted + 6_000, Duration::from_secs(5)), 0);

        let manager = manager(1);
        let mut handler = LobbyHandler::new(&manager);
        assert_eq!(lobby.resolve_deletion(&mut handler), 1);
        assert_eq!(read_error(&mut client), ErrorCode::LobbyTimeout.payload().to_vec());
    }
}
