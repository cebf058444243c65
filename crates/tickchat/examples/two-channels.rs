//! Start a server on an ephemeral port, put one client in each of two
//! channels, and show that a message only reaches its own channel.
//!
//! Run with:
//!   cargo run --example two-channels
//!
//! Against a real server:
//!   cargo run --features cli -- serve --port 4800
//!   cargo run --features cli -- send 127.0.0.1:4800 --channel 1 --name ana --text hi

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tickchat::frame::{FrameReader, FrameWriter};
use tickchat::proto::{ClientMessage, ServerFrame};
use tickchat::server::{now_ms, ChatServer, ServerConfig};

type Client = (FrameWriter<TcpStream>, TcpStream);

fn join(addr: SocketAddr, channel: u32, name: &str) -> Result<Client, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let reader = stream.try_clone()?;
    let mut writer = FrameWriter::new(stream);
    let join = ClientMessage::Join {
        channel_id: channel,
        user_name: Some(name.to_string()),
        timestamp: None,
    };
    writer.send(&join.to_bytes()?)?;
    Ok((writer, reader))
}

fn drain(name: &str, stream: &mut TcpStream) {
    let mut reader = FrameReader::new();
    while let Ok(payload) = reader.read_frame(stream) {
        match ServerFrame::from_slice(&payload) {
            Ok(ServerFrame::Batch(events)) => {
                for event in events {
                    eprintln!(
                        "{name} sees #{} {} {}: {}",
                        event.channel_id, event.timestamp, event.user_name, event.event
                    );
                }
            }
            Ok(ServerFrame::Error(err)) => eprintln!("{name} was refused: {}", err.message),
            Err(err) => eprintln!("{name} got a malformed frame: {err}"),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = ChatServer::bind(ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    })?;
    let addr = server.local_addr().ok_or("server is not listening")?;
    let handle = server.handle();
    let runner = std::thread::spawn(move || server.run());
    eprintln!("Listening on {addr}");

    let (mut ana, mut ana_in) = join(addr, 1, "ana")?;
    let (_ben, mut ben_in) = join(addr, 2, "ben")?;
    std::thread::sleep(Duration::from_millis(200));

    let hello = ClientMessage::Message {
        text: "anyone in channel 1?".into(),
        timestamp: now_ms(),
    };
    ana.send(&hello.to_bytes()?)?;

    drain("ana", &mut ana_in);
    drain("ben", &mut ben_in);

    handle.stop();
    runner.join().map_err(|_| "server thread panicked")??;
    Ok(())
}
