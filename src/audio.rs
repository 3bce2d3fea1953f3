//! Wire sample formats and the conversion between the f32 DSP ports of
//! the PipeWire endpoints and the raw interleaved byte stream the filter
//! process sees.

pub mod convert;
pub mod format;

pub use format::{SampleFormat, SampleSpec, default_channel_map};
