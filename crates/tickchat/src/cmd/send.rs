use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};

use bytes::Bytes;
use tickchat_frame::{FrameReader, FrameWriter};
use tickchat_proto::{ClientMessage, EventKind, ServerFrame};
use tickchat_server::now_ms;
use tickchat_transport::TcpTransport;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{
    frame_error, io_error, proto_error, transport_error, CliError, CliResult, FAILURE, SUCCESS,
    USAGE,
};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let addr = resolve(&args.addr)?;

    let stream = TcpTransport::connect(addr, Some(wait_timeout))
        .map_err(|err| transport_error("connect failed", err))?;
    stream
        .set_read_timeout(Some(wait_timeout))
        .map_err(|err| io_error("connect failed", err))?;
    let mut reader_stream = stream
        .try_clone()
        .map_err(|err| io_error("connect failed", err))?;
    let mut writer = FrameWriter::new(stream);

    for message in outgoing(&args) {
        let payload = message
            .to_bytes()
            .map_err(|err| proto_error("encode failed", err))?;
        writer
            .send(&payload)
            .map_err(|err| frame_error("send failed", err))?;
    }

    let server = addr.to_string();
    let mut reader = FrameReader::new();
    let reply = await_reply(
        &mut reader,
        &mut reader_stream,
        args.text.is_some(),
        |frame, raw| print_frame(frame, raw, &server, format),
    )?;

    match reply {
        Reply::Delivered => Ok(SUCCESS),
        Reply::Refused(message) => {
            tracing::warn!(%message, "server refused request");
            Ok(FAILURE)
        }
    }
}

fn resolve(addr: &str) -> CliResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|err| CliError::new(USAGE, format!("invalid address {addr}: {err}")))?
        .next()
        .ok_or_else(|| CliError::new(USAGE, format!("{addr} did not resolve")))
}

fn outgoing(args: &SendArgs) -> Vec<ClientMessage> {
    let mut messages = vec![ClientMessage::Join {
        channel_id: args.channel,
        user_name: Some(args.name.clone()),
        timestamp: args.timestamp,
    }];
    if let Some(text) = &args.text {
        messages.push(ClientMessage::Message {
            text: text.clone(),
            timestamp: args.timestamp.unwrap_or_else(now_ms),
        });
    }
    messages
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Delivered,
    Refused(String),
}

/// Read frames until the join is confirmed (and, with `want_user`, until a
/// user message has come back) or the server answers with an error frame.
fn await_reply<R: Read>(
    reader: &mut FrameReader,
    src: &mut R,
    want_user: bool,
    mut on_frame: impl FnMut(&ServerFrame, &Bytes),
) -> CliResult<Reply> {
    loop {
        let raw = reader
            .read_frame(src)
            .map_err(|err| frame_error("receive failed", err))?;
        let frame =
            ServerFrame::from_slice(&raw).map_err(|err| proto_error("receive failed", err))?;
        on_frame(&frame, &raw);

        match frame {
            ServerFrame::Error(err) => return Ok(Reply::Refused(err.message)),
            ServerFrame::Batch(events) => {
                if !want_user || events.iter().any(|e| e.kind == EventKind::User) {
                    return Ok(Reply::Delivered);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;
    use tickchat_frame::encode_frame;
    use tickchat_proto::{encode_batch, ErrorCode, ServerEvent, SystemEvent};

    use super::*;
    use crate::exit::DATA_INVALID;

    fn wire(frames: &[Bytes]) -> Cursor<Vec<u8>> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut buf).unwrap();
        }
        Cursor::new(buf.to_vec())
    }

    fn join_batch() -> Bytes {
        encode_batch(&[ServerEvent::system("kim", SystemEvent::Join, 1, 4)]).unwrap()
    }

    #[test]
    fn join_only_stops_at_first_batch() {
        let mut src = wire(&[join_batch(), join_batch()]);
        let mut seen = 0;
        let reply = await_reply(&mut FrameReader::new(), &mut src, false, |_, _| seen += 1)
            .expect("reply should parse");
        assert_eq!(reply, Reply::Delivered);
        assert_eq!(seen, 1);
    }

    #[test]
    fn waits_for_user_event_when_text_was_sent() {
        let said = encode_batch(&[ServerEvent::user("kim", "yo", 2, 4)]).unwrap();
        let mut src = wire(&[join_batch(), said]);
        let mut seen = 0;
        let reply = await_reply(&mut FrameReader::new(), &mut src, true, |_, _| seen += 1)
            .expect("reply should parse");
        assert_eq!(reply, Reply::Delivered);
        assert_eq!(seen, 2);
    }

    #[test]
    fn error_frame_is_a_refusal() {
        let mut src = wire(&[ErrorCode::ChannelFull.payload()]);
        let reply = await_reply(&mut FrameReader::new(), &mut src, false, |_, _| {})
            .expect("reply should parse");
        assert_eq!(reply, Reply::Refused("The channel is full.".into()));
    }

    #[test]
    fn garbage_is_data_invalid() {
        let mut src = wire(&[Bytes::from_static(b"not json")]);
        let err = await_reply(&mut FrameReader::new(), &mut src, false, |_, _| {}).unwrap_err();
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn outgoing_joins_before_text() {
        let args = SendArgs {
            addr: "127.0.0.1:4800".into(),
            channel: 4,
            name: "kim".into(),
            text: Some("yo".into()),
            timestamp: Some(9),
            wait_timeout: "5s".into(),
        };
        let messages = outgoing(&args);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ClientMessage::Join { channel_id: 4, .. }));
        assert_eq!(messages[1].timestamp(), Some(9));
    }

    #[test]
    fn outgoing_text_is_always_stamped() {
        let args = SendArgs {
            addr: "127.0.0.1:4800".into(),
            channel: 4,
            name: "kim".into(),
            text: Some("yo".into()),
            timestamp: None,
            wait_timeout: "5s".into(),
        };
        let messages = outgoing(&args);
        assert_eq!(messages[0].timestamp(), None);
        assert!(messages[1].timestamp().is_some_and(|ts| ts > 0));
    }
}
