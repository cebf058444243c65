use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tickchat_proto::ChannelId;
use tickchat_transport::{TcpTransport, Waker};
use tracing::{debug, error, info, warn};

use crate::clock::now_ms;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::lobby::{check_lobby, LobbyHandler};
use crate::manager::ChannelManager;
use crate::pump::ConnectionPump;
use crate::scheduler::{Phase, Scheduler, Task};

type ControlTask = Task<Control>;

/// State of the control thread: the listener, the lobby and the channel
/// registry.
struct Control {
    pump: ConnectionPump,
    manager: Arc<ChannelManager>,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    fault: Option<ServerError>,
}

impl Control {
    fn poll_lobby(&mut self) {
        let manager = Arc::clone(&self.manager);
        let mut handler = LobbyHandler::new(&manager);
        if let Err(err) = self.pump.pump(Some(self.config.poll_timeout), &mut handler) {
            error!(error = %err, "lobby poll failed");
            self.fault = Some(err);
            self.stop.store(true, Ordering::Release);
        }
        if self.pump.take_wakeup() {
            debug!("control thread woken");
        }
    }

    fn sweep_lobby(&mut self) {
        let evicted = check_lobby(&mut self.pump, now_ms(), self.config.lobby_timeout);
        if evicted > 0 {
            debug!(evicted, "lobby sweep");
        }
    }

    fn resolve_deletion(&mut self) {
        let manager = Arc::clone(&self.manager);
        let mut handler = LobbyHandler::new(&manager);
        self.pump.resolve_deletion(&mut handler);
    }
}

/// A bound chat server.
///
/// [`ChatServer::run`] drives the lobby on the calling thread; each channel
/// runs on a thread of its own. Use a [`ServerHandle`] to observe or stop it
/// from elsewhere.
pub struct ChatServer {
    control: Control,
    scheduler: Scheduler<Control>,
    waker: Arc<Waker>,
}

impl ChatServer {
    /// Bind the listening socket and prepare the lobby. No threads are
    /// started until a channel is first joined.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpTransport::bind(config.bind_addr())?;
        let waker = Arc::new(Waker::new()?);
        let pump = ConnectionPump::new("lobby", config.lobby_capacity, config.frame.clone())?
            .with_listener(listener)?
            .with_waker(Arc::clone(&waker))?;
        let manager = Arc::new(ChannelManager::new(
            config.channel_settings(),
            Some(Arc::clone(&waker)),
        ));

        Ok(Self {
            scheduler: Self::scheduler(&config),
            control: Control {
                pump,
                manager,
                config,
                stop: Arc::new(AtomicBool::new(false)),
                fault: None,
            },
            waker,
        })
    }

    fn scheduler(config: &ServerConfig) -> Scheduler<Control> {
        let mut scheduler = Scheduler::new();
        scheduler.push_back(
            Phase::Pre,
            ControlTask::once("startup", |control, _| {
                info!(
                    addr = ?control.pump.local_addr(),
                    lobby_capacity = control.config.lobby_capacity,
                    channel_capacity = control.config.channel_capacity,
                    "tickchat server listening"
                );
            }),
        );
        scheduler.push_back(
            Phase::Io,
            ControlTask::persistent("poll-lobby", |control, _| control.poll_lobby()),
        );
        scheduler.push_back(
            Phase::Logic,
            ControlTask::persistent("handle-reports", |control, _| {
                control.manager.handle_reports();
            }),
        );
        scheduler.push_back(
            Phase::Logic,
            ControlTask::throttled("sweep-lobby", config.sweep_interval, |control, _| {
                control.sweep_lobby()
            }),
        );
        scheduler.push_back(
            Phase::Logic,
            ControlTask::throttled("reclaim-channels", config.sweep_interval, |control, _| {
                control.manager.reclaim_idle(now_ms());
            }),
        );
        scheduler.push_back(
            Phase::Logic,
            ControlTask::persistent("resolve-deletion", |control, _| control.resolve_deletion()),
        );
        scheduler
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.control.pump.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.control.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.control.stop),
            waker: Arc::clone(&self.waker),
            manager: Arc::clone(&self.control.manager),
            local_addr: self.local_addr(),
        }
    }

    /// Run one control cycle.
    pub fn run_cycle(&mut self) -> Result<()> {
        self.scheduler.run(&mut self.control);
        match self.control.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Serve until [`ServerHandle::stop`] is called or the lobby fails, then
    /// stop every channel.
    pub fn run(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        while !self.control.stop.load(Ordering::Acquire) {
            if let Err(err) = self.run_cycle() {
                outcome = Err(err);
                break;
            }
        }

        self.control.manager.shutdown();
        info!(
            cycles = self.scheduler.cycles(),
            lobby = self.control.pump.len(),
            "tickchat server stopped"
        );
        outcome
    }
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("local_addr", &self.local_addr())
            .field("lobby", &self.control.pump.len())
            .field("manager", &self.control.manager)
            .finish()
    }
}

/// Cloneable, thread-safe view of a running [`ChatServer`].
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    manager: Arc<ChannelManager>,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// Ask the server to stop after its current cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "failed to wake server for shutdown");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Ids of the channels currently alive.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.manager.channel_ids()
    }

    /// Registered members of `channel`, or `None` if it does not exist.
    pub fn member_count(&self, channel: ChannelId) -> Option<usize> {
        self.manager.get(channel).map(|channel| channel.member_count())
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
