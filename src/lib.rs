//! # Fabric Controller
//!
//! OpenFlow 1.3 control plane for a fabric of switches:
//! - MAC learning with tiered rule priorities over a two-stage table pipeline
//! - Fixed-interval statistics polling of every connected switch
//! - Telemetry records for counters, port state and decisions
//!
//! ```text
//! transport ──events──▶ controller ──▶ flow manager ──commands──▶ transport
//!                           │               │
//!                           ▼               ▼
//!                     reply handlers ──▶ telemetry sink
//!                           ▲
//! poller (timer) ──stats requests──▶ registry snapshot ──▶ transport
//! ```

pub mod command;
pub mod config;
pub mod controller;
pub mod event;
pub mod flow;
pub mod openflow;
pub mod poller;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use command::{SwitchCommand, SwitchHandle};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use event::{ControllerEvent, EventKind};
pub use registry::{Datapath, DatapathRegistry};
pub use types::{now_ms, ConnectionId, DatapathId, MacAddr, PortNo};
