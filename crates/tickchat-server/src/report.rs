use std::sync::Arc;

use tickchat_proto::ChannelId;
use tickchat_transport::Waker;
use tracing::warn;

use crate::connection::ConnId;
use crate::queue::SharedQueue;

/// A request to move a connection between channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub from: ChannelId,
    pub to: ChannelId,
    pub conn: ConnId,
    pub name: String,
    pub timestamp: u64,
}

/// Submit-only handle to the manager's report queue.
///
/// Channels hold one of these instead of a reference to the manager.
#[derive(Clone)]
pub struct ReportSink {
    queue: SharedQueue<Report>,
    waker: Option<Arc<Waker>>,
}

impl ReportSink {
    pub(crate) fn new(queue: SharedQueue<Report>, waker: Option<Arc<Waker>>) -> Self {
        Self { queue, waker }
    }

    /// Queue `report` and wake the manager's thread.
    pub fn submit(&self, report: Report) {
        self.queue.push(report);
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                warn!(error = %err, "failed to wake report consumer");
            }
        }
    }
}

impl std::fmt::Debug for ReportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportSink")
            .field("queued", &self.queue.len())
            .finish()
    }
}
