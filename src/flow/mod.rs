//! Packet-in handling: parse, classify, learn, decide.

pub mod classify;
pub mod learning;
pub mod manager;
pub mod packet;

pub use classify::{classify, Classification, FlowClass};
pub use learning::{Learned, MacLearning, MacTable};
pub use manager::{FlowConfig, FlowManager, FlowManagerStats, PacketDecision};
pub use packet::{parse_frame, PacketShape, ParsedPacket};
