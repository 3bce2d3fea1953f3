//! Contract between the bridge and the audio pipeline it is spliced into.

use std::time::Duration;

use crate::error::BridgeError;

/// The two pipeline-facing endpoints, as one unit the lifecycle controller
/// can publish and withdraw.
pub trait PipelineEndpoints {
    /// Make both endpoints visible to the pipeline. After this, demand and
    /// inbound callbacks may start arriving.
    fn publish(&mut self) -> Result<(), BridgeError>;

    /// Withdraw both endpoints. When this returns no further callbacks run.
    fn unpublish(&mut self);
}

/// Receives filled inbound regions from the multiplexing loop.
///
/// Implementations must not block and must copy what they keep: the slice
/// is only valid for the duration of the call.
pub trait InboundSink: Send {
    fn post(&mut self, bytes: &[u8]);
}

/// Control queries the pipeline may send to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    GetLatency,
    AddInput,
    RemoveInput,
    AddOutput,
    RemoveOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Latency(Duration),
    Ack,
}

/// Answer a control message.
///
/// The bridge claims no inherent latency: bytes buffered in the pipes or
/// inside the filter are not accounted for.
pub fn handle_control(message: ControlMessage) -> ControlReply {
    match message {
        ControlMessage::GetLatency => ControlReply::Latency(Duration::ZERO),
        ControlMessage::AddInput
        | ControlMessage::RemoveInput
        | ControlMessage::AddOutput
        | ControlMessage::RemoveOutput => ControlReply::Ack,
    }
}
