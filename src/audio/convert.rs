//! Planar f32 <-> interleaved wire bytes.
//!
//! Both directions work in caller-provided buffers so they can run on the
//! PipeWire data thread without allocating.

use super::format::SampleFormat;

/// Symmetric scaling: -1.0 maps to -32767, so the negative extreme loses
/// one LSB but never overflows.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

#[inline]
pub fn f32_to_i32(sample: f32) -> i32 {
    (f64::from(sample) * 2_147_483_647.0).clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
}

#[inline]
pub fn i32_to_f32(sample: i32) -> f32 {
    (f64::from(sample) / 2_147_483_648.0) as f32
}

/// Interleave `frames` frames from the planar `inputs` into `out`.
///
/// Returns the number of bytes produced. Stops early if `out` cannot hold
/// all frames or an input is shorter than `frames`.
pub fn encode_interleaved(
    format: SampleFormat,
    inputs: &[&[f32]],
    frames: usize,
    out: &mut [u8],
) -> usize {
    let channels = inputs.len();
    if channels == 0 {
        return 0;
    }
    let bps = format.bytes_per_sample();
    let frame_bytes = bps * channels;
    let shortest = inputs.iter().map(|ch| ch.len()).min().unwrap_or(0);
    let frames = frames.min(shortest).min(out.len() / frame_bytes);

    for frame in 0..frames {
        let base = frame * frame_bytes;
        for (ch, input) in inputs.iter().enumerate() {
            let at = base + ch * bps;
            let sample = input[frame];
            match format {
                SampleFormat::S16le => {
                    out[at..at + 2].copy_from_slice(&f32_to_i16(sample).to_le_bytes())
                }
                SampleFormat::S32le => {
                    out[at..at + 4].copy_from_slice(&f32_to_i32(sample).to_le_bytes())
                }
                SampleFormat::F32le => out[at..at + 4].copy_from_slice(&sample.to_le_bytes()),
            }
        }
    }
    frames * frame_bytes
}

/// De-interleave whole frames from `bytes` into the planar `outputs`.
///
/// Trailing bytes that do not form a complete frame are ignored. Returns
/// the number of frames written.
pub fn decode_interleaved(
    format: SampleFormat,
    bytes: &[u8],
    outputs: &mut [&mut [f32]],
    offset: usize,
) -> usize {
    let channels = outputs.len();
    if channels == 0 {
        return 0;
    }
    let bps = format.bytes_per_sample();
    let frame_bytes = bps * channels;
    let room = outputs
        .iter()
        .map(|ch| ch.len().saturating_sub(offset))
        .min()
        .unwrap_or(0);
    let frames = (bytes.len() / frame_bytes).min(room);

    for frame in 0..frames {
        let base = frame * frame_bytes;
        for (ch, output) in outputs.iter_mut().enumerate() {
            let at = base + ch * bps;
            output[offset + frame] = match format {
                SampleFormat::S16le => i16_to_f32(i16::from_le_bytes([bytes[at], bytes[at + 1]])),
                SampleFormat::S32le => i32_to_f32(i32::from_le_bytes([
                    bytes[at],
                    bytes[at + 1],
                    bytes[at + 2],
                    bytes[at + 3],
                ])),
                SampleFormat::F32le => f32::from_le_bytes([
                    bytes[at],
                    bytes[at + 1],
                    bytes[at + 2],
                    bytes[at + 3],
                ]),
            };
        }
    }
    frames
}
