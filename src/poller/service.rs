//! On-demand statistics requests.
//!
//! The same request fan-out the timer loop uses, callable at any time:
//! one poll across the registry, one switch right now, or a port
//! description refresh.

use crate::command::SwitchCommand;
use crate::registry::{Datapath, DatapathRegistry};
use crate::types::{now_ms, DatapathId};
use log::debug;
use std::sync::Arc;

/// Requests issued on every poll, per datapath.
pub const POLL_REQUESTS: [SwitchCommand; 3] = [
    SwitchCommand::RequestPortStats,
    SwitchCommand::RequestFlowStats,
    SwitchCommand::RequestTableStats,
];

/// Statistics from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Datapaths in the snapshot
    pub datapaths: usize,
    /// Requests accepted by a handle
    pub requests_sent: usize,
    /// Requests a handle refused (closed or saturated connection)
    pub requests_dropped: usize,
    /// Timestamp of the poll
    pub timestamp: u64,
}

impl PollStats {
    pub fn requests_issued(&self) -> usize {
        self.requests_sent + self.requests_dropped
    }
}

/// Issues statistics requests to registered datapaths without waiting for
/// replies.
pub struct PollService {
    registry: Arc<DatapathRegistry>,
}

impl PollService {
    /// Creates a service that polls whatever `registry` holds at call time.
    ///
    /// # Arguments
    /// * `registry` - Shared datapath registry, only ever snapshotted
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use fabric::poller::PollService;
    /// use fabric::DatapathRegistry;
    ///
    /// let registry = Arc::new(DatapathRegistry::new());
    /// let service = PollService::new(registry);
    /// ```
    pub fn new(registry: Arc<DatapathRegistry>) -> Self {
        Self { registry }
    }

    /// Sends the three stats requests to every datapath registered right now.
    ///
    /// A handle that refuses a request (closed or saturated connection) is
    /// counted and skipped; the other datapaths are still polled.
    ///
    /// # Returns
    /// Per-poll counts: datapaths in the snapshot, requests sent and dropped.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use fabric::poller::PollService;
    /// # use fabric::DatapathRegistry;
    /// # let service = PollService::new(Arc::new(DatapathRegistry::new()));
    /// let stats = service.poll_all();
    /// println!("{} requests to {} switches", stats.requests_sent, stats.datapaths);
    /// ```
    pub fn poll_all(&self) -> PollStats {
        let snapshot = self.registry.snapshot();
        let mut stats = PollStats {
            datapaths: snapshot.len(),
            timestamp: now_ms(),
            ..Default::default()
        };

        for datapath in &snapshot {
            poll_datapath(datapath, &mut stats);
        }
        stats
    }

    /// Polls one switch immediately, outside the timer.
    ///
    /// # Arguments
    /// * `id` - Datapath to poll
    ///
    /// # Returns
    /// Counts for this one datapath, or `None` if it is not registered.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use fabric::poller::PollService;
    /// # use fabric::DatapathRegistry;
    /// # let service = PollService::new(Arc::new(DatapathRegistry::new()));
    /// if service.poll_now(0x0a01).is_none() {
    ///     println!("switch 0x0a01 is not connected");
    /// }
    /// ```
    pub fn poll_now(&self, id: DatapathId) -> Option<PollStats> {
        let datapath = self.registry.snapshot().into_iter().find(|dp| dp.id == id)?;
        let mut stats = PollStats {
            datapaths: 1,
            timestamp: now_ms(),
            ..Default::default()
        };
        poll_datapath(&datapath, &mut stats);
        Some(stats)
    }

    /// Asks one switch for its port descriptions.
    ///
    /// # Arguments
    /// * `id` - Datapath to ask
    ///
    /// # Returns
    /// `true` if the request was handed to the switch's connection, `false`
    /// if the switch is unknown or its connection refused the request.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use fabric::poller::PollService;
    /// # use fabric::DatapathRegistry;
    /// # let service = PollService::new(Arc::new(DatapathRegistry::new()));
    /// let sent = service.request_port_desc(0x0a01);
    /// ```
    pub fn request_port_desc(&self, id: DatapathId) -> bool {
        let handle = match self.registry.handle(id) {
            Some(handle) => handle,
            None => {
                debug!("Port description requested for unregistered switch {}", id);
                return false;
            }
        };
        match handle.send(SwitchCommand::RequestPortDesc) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped port description request for switch {}: {}", id, e);
                false
            }
        }
    }
}

fn poll_datapath(datapath: &Datapath, stats: &mut PollStats) {
    for request in POLL_REQUESTS.iter() {
        match datapath.handle.send(request.clone()) {
            Ok(()) => stats.requests_sent += 1,
            Err(e) => {
                stats.requests_dropped += 1;
                debug!(
                    "Dropped {} for switch {}: {}",
                    request.name(),
                    datapath.id,
                    e
                );
            }
        }
    }
}
