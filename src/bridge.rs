//! The bridge core: buffers, the multiplexing loop, demand-driven writes
//! and the lifecycle controller that orders startup and teardown.
//!
//! ## Architecture
//!
//! - `chunk` - Inbound chunk with fill cursor, single-shot pipe read/write
//! - `pump` - Dedicated poll thread reading filter stdout
//! - `outbound` - Best-effort writer into filter stdin
//! - `fault` - One-shot fatal-condition reporting
//! - `endpoint` - Contract with the pipeline (publish, inbound posts, control)
//! - `lifecycle` - `Bridge`, the startup/teardown state machine

pub mod chunk;
pub mod endpoint;
pub mod fault;
pub mod lifecycle;
pub mod outbound;
pub mod pump;

pub use endpoint::{InboundSink, PipelineEndpoints};
pub use fault::{BridgeEvent, FaultReporter};
pub use lifecycle::{Bridge, BridgeWiring};
pub use outbound::OutboundWriter;
