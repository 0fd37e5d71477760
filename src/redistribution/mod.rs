//! Many-to-many redistribution (async transpose) between ranks.

pub mod engine;
pub mod group;
pub mod interconnect;

pub use engine::{EngineStats, RedistributionEngine, DEFAULT_TAG_BASE};
pub use group::{RedistributionGroup, Role};
pub use interconnect::{ChannelInterconnect, ClusterInterconnect, Interconnect, Request};
