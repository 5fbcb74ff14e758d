//! Telemetry polling.
//!
//! Two ways to request statistics:
//! 1. **Scheduled** (TelemetryPoller): fixed-interval background task
//! 2. **On demand** (PollService): one poll, one switch, or port descriptions
//!
//! Replies are handled separately by `ReplyHandlers`, whenever they arrive.

pub mod replies;
pub mod scheduler;
pub mod service;

pub use replies::ReplyHandlers;
pub use scheduler::{PollerConfig, PollerTotals, TelemetryPoller};
pub use service::{PollService, PollStats, POLL_REQUESTS};
