//! Streaming dataflow transport for real-time telescope pipelines.
//!
//! Typed, versioned [`StreamBuffer`]s travel between [`Stage`]s over
//! [`Link`]s, each bound to a [`Channel`] backend (in-process memory, shared
//! memory, TCP socket or a cluster fabric). Many-to-many data exchange goes
//! through the [`RedistributionEngine`]; the boundary with real-time input
//! and output is handled by [`RealtimeRing`] and [`DoubleBufferedSink`].

// Module naming follows project convention (PascalCase for the low-level layers)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Buffer;
#[allow(non_snake_case)]
pub mod Transport;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod realtime;
pub mod redistribution;
pub mod sink;
pub mod stage;

pub use config::{ChannelConfig, FlowConfig, LinkConfig, MissingDataPolicy, ParameterSet, RingConfig, SinkConfig, SyncMode};
pub use error::{FlowError, FlowResult, Peer, TransportFault};
pub use link::{Direction, Link, LinkState, LinkStats};
pub use realtime::{RealtimeRing, SynchronizedReaderWriter, Timestamp, WallClockReaderWriter};
pub use redistribution::{Interconnect, RedistributionEngine, RedistributionGroup, Role};
pub use sink::{DoubleBufferedSink, SinkReport, SinkWriter};
pub use stage::{run_cooperative, Pipeline, PipelineContext, Stage, StageOutcome, StageRunner, Step};
pub use Buffer::{FieldKind, FieldSpec, Layout, Serializable, StreamBuffer, Streamable, Transposable};
pub use Transport::{Channel, ChannelKind, State};
