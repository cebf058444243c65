//! Channel-based chat server runtime.
//!
//! Connections arrive in a lobby owned by the control thread, ask to join a
//! numbered channel under a display name, and are then handed to that
//! channel's worker thread. Each worker runs a fixed cycle through a
//! [`Scheduler`]:
//!
//! 1. `Pre`: clear last cycle's broadcast window
//! 2. `Io`: poll members and turn frames into [`Request`]s
//! 3. `Logic`: apply staged joins and leaves, broadcast the window sorted by
//!    timestamp, drop dead members
//!
//! Moving between channels goes through the [`ChannelManager`], which
//! reserves a slot at the destination before the origin lets go, so a
//! refused move leaves the member where it was.
//!
//! ```no_run
//! use tickchat_server::{ChatServer, ServerConfig};
//!
//! let mut server = ChatServer::bind(ServerConfig::default())?;
//! let handle = server.handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     handle.stop();
//! });
//! server.run()?;
//! # Ok::<(), tickchat_server::ServerError>(())
//! ```

pub mod broadcast;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod lobby;
pub mod manager;
pub mod pump;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod worker;

pub use broadcast::{BroadcastWindow, ChatEvent, EventQueue};
pub use channel::{Channel, JoinKind, Notice};
pub use clock::now_ms;
pub use config::{ChannelSettings, ServerConfig, DEFAULT_CAPACITY, DEFAULT_PORT};
pub use connection::{ConnId, Connection, Group};
pub use error::{Result, ServerError};
pub use lobby::{check_lobby, LobbyHandler};
pub use manager::ChannelManager;
pub use pump::{ConnectionPump, Request, RequestHandler};
pub use queue::SharedQueue;
pub use report::{Report, ReportSink};
pub use scheduler::{Phase, Scheduler, Task, TaskQueue};
pub use server::{ChatServer, ServerHandle};
pub use worker::ChannelWorker;
