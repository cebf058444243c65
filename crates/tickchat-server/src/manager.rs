use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tickchat_proto::{ChannelId, ErrorCode};
use tickchat_transport::Waker;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Notice};
use crate::clock::now_ms;
use crate::config::ChannelSettings;
use crate::error::{Result, ServerError};
use crate::queue::{lock, read, write, SharedQueue};
use crate::report::{Report, ReportSink};
use crate::worker::ChannelWorker;

/// Owns every live channel and the threads that drive them.
///
/// Channels are created on first use and reclaimed after staying empty for
/// the configured idle window. Cross-channel moves arrive as [`Report`]s and
/// are resolved here, one destination lock at a time.
pub struct ChannelManager {
    channels: RwLock<BTreeMap<ChannelId, Arc<Channel>>>,
    workers: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
    reports: SharedQueue<Report>,
    sink: ReportSink,
    settings: ChannelSettings,
}

impl ChannelManager {
    /// `waker`, when given, is signalled whenever a report is submitted.
    pub fn new(settings: ChannelSettings, waker: Option<Arc<Waker>>) -> Self {
        let reports = SharedQueue::new();
        Self {
            channels: RwLock::new(BTreeMap::new()),
            workers: Mutex::new(HashMap::new()),
            sink: ReportSink::new(reports.clone(), waker),
            reports,
            settings,
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Submit-only handle given to channel workers.
    pub fn sink(&self) -> ReportSink {
        self.sink.clone()
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        read(&self.channels).get(&id).cloned()
    }

    /// Look up a channel, creating it (and starting its worker) if needed.
    pub fn get_or_create(&self, id: ChannelId) -> Result<Arc<Channel>> {
        if let Some(channel) = self.get(id) {
            return Ok(channel);
        }

        let mut channels = write(&self.channels);
        if let Some(channel) = channels.get(&id) {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(Channel::new(id, self.settings.capacity, now_ms())?);
        let worker = ChannelWorker::new(
            Arc::clone(&channel),
            self.sink(),
            self.settings.poll_timeout,
            self.settings.frame.clone(),
        )?;
        let handle = std::thread::Builder::new()
            .name(format!("channel-{id}"))
            .spawn(move || worker.run())
            .map_err(|source| ServerError::WorkerSpawn {
                channel: id,
                source,
            })?;

        channels.insert(id, Arc::clone(&channel));
        lock(&self.workers).insert(id, handle);
        info!(channel = id, capacity = self.settings.capacity, "channel created");
        Ok(channel)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        read(&self.channels).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.channels).is_empty()
    }

    /// Resolve every queued move request. Returns how many were handled.
    pub fn handle_reports(&self) -> usize {
        let reports = self.reports.drain();
        let count = reports.len();
        for report in reports {
            self.resolve_switch(report);
        }
        count
    }

    /// Reserve at the destination, then ask the origin to let go.
    ///
    /// On refusal the origin is told to notify the member, and no membership
    /// state changes anywhere.
    fn resolve_switch(&self, report: Report) {
        let Some(origin) = self.get(report.from) else {
            debug!(conn = report.conn, from = report.from, "origin channel gone, dropping move");
            return;
        };
        let refuse = |code: ErrorCode| {
            origin.post_notice(Notice {
                to: report.conn,
                code,
            })
        };

        let destination = match self.get_or_create(report.to) {
            Ok(destination) => destination,
            Err(err) => {
                error!(to = report.to, error = %err, "could not open destination channel");
                refuse(ErrorCode::ChannelFull);
                return;
            }
        };

        if !destination.reserve(report.conn, report.timestamp) {
            debug!(
                conn = report.conn,
                name = %report.name,
                to = report.to,
                "destination full, move refused"
            );
            refuse(ErrorCode::ChannelFull);
            return;
        }

        origin.request_leave(report.conn, destination, report.timestamp);
        debug!(
            conn = report.conn,
            name = %report.name,
            from = report.from,
            to = report.to,
            "move scheduled"
        );
    }

    /// Destroy channels that have been empty for the idle window with no
    /// pending joins, and channels whose worker stopped on its own. Safe to
    /// call repeatedly.
    pub fn reclaim_idle(&self, now: u64) -> Vec<ChannelId> {
        let idle_ms = u64::try_from(self.settings.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let reclaimed: Vec<(Arc<Channel>, bool)> = {
            let mut channels = write(&self.channels);
            let doomed: Vec<(ChannelId, bool)> = channels
                .iter()
                .filter_map(|(id, channel)| {
                    if channel.is_stopped() {
                        Some((*id, true))
                    } else if channel.close_if_idle(now, idle_ms) {
                        Some((*id, false))
                    } else {
                        None
                    }
                })
                .collect();
            doomed
                .into_iter()
                .filter_map(|(id, faulted)| channels.remove(&id).map(|c| (c, faulted)))
                .collect()
        };

        let mut ids = Vec::with_capacity(reclaimed.len());
        for (channel, faulted) in reclaimed {
            channel.stop();
            self.join_worker(channel.id());
            if faulted {
                warn!(channel = channel.id(), "stopped channel removed");
            } else {
                info!(channel = channel.id(), "channel reclaimed");
            }
            ids.push(channel.id());
        }
        ids
    }

    /// Stop every channel and wait for its worker.
    pub fn shutdown(&self) {
        let channels: Vec<Arc<Channel>> = {
            let mut channels = write(&self.channels);
            std::mem::take(&mut *channels).into_values().collect()
        };
        for channel in &channels {
            channel.stop();
        }
        for channel in &channels {
            self.join_worker(channel.id());
        }
        if !channels.is_empty() {
            info!(channels = channels.len(), "all channels stopped");
        }
    }

    fn join_worker(&self, id: ChannelId) {
        let handle = lock(&self.workers).remove(&id);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(channel = id, "channel worker panicked");
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channel_ids())
            .field("settings", &self.settings)
            .finish()
    }
}
