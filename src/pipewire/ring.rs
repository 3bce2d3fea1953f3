//! Byte ring between the multiplexing loop and the source endpoint.
//!
//! The loop is the only producer and the source's process callback the
//! only consumer, so a wait-free SPSC ring is enough. The consumer side
//! only ever sees whole frames; a partial frame is held by the producer
//! until the rest of it arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::audio::SampleFormat;
use crate::audio::convert::decode_interleaved;
use crate::bridge::InboundSink;

#[derive(Debug, Default)]
pub struct RingStats {
    overflow_bytes: AtomicU64,
    underrun_frames: AtomicU64,
}

impl RingStats {
    /// Bytes of filter output dropped because the ring was full.
    pub fn overflow_bytes(&self) -> u64 {
        self.overflow_bytes.load(Ordering::Relaxed)
    }

    /// Frames the source had to render as silence.
    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }
}

/// Create a ring of `capacity` bytes framed as `channels` × `format`.
pub fn inbound_ring(
    capacity: usize,
    format: SampleFormat,
    channels: usize,
    max_frames: usize,
) -> (RingSink, FrameReader) {
    let (producer, consumer) = RingBuffer::<u8>::new(capacity);
    let stats = Arc::new(RingStats::default());
    let bytes_per_frame = format.bytes_per_sample() * channels;
    (
        RingSink {
            producer,
            bytes_per_frame,
            partial: vec![0; bytes_per_frame],
            partial_len: 0,
            stats: stats.clone(),
        },
        FrameReader {
            consumer,
            format,
            bytes_per_frame,
            staging: vec![0; max_frames * bytes_per_frame],
            stats,
        },
    )
}

/// Producer half, handed to the multiplexing loop.
///
/// Only whole frames enter the ring. The tail of a read that stops
/// mid-frame is held back until the rest of the frame arrives, so an
/// overflow always drops whole frames and the ring never loses alignment.
pub struct RingSink {
    producer: Producer<u8>,
    bytes_per_frame: usize,
    partial: Vec<u8>,
    partial_len: usize,
    stats: Arc<RingStats>,
}

impl RingSink {
    pub fn stats(&self) -> Arc<RingStats> {
        self.stats.clone()
    }

    fn drop_bytes(&self, n: usize) {
        if n > 0 {
            self.stats
                .overflow_bytes
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

impl InboundSink for RingSink {
    fn post(&mut self, bytes: &[u8]) {
        let bpf = self.bytes_per_frame;
        let mut bytes = bytes;

        if self.partial_len > 0 {
            let n = (bpf - self.partial_len).min(bytes.len());
            self.partial[self.partial_len..self.partial_len + n].copy_from_slice(&bytes[..n]);
            self.partial_len += n;
            bytes = &bytes[n..];
            if self.partial_len < bpf {
                return;
            }
            self.partial_len = 0;
            if self.producer.slots() >= bpf {
                push(&mut self.producer, &self.partial);
            } else {
                self.drop_bytes(bpf);
            }
        }

        let whole = bytes.len() / bpf * bpf;
        let room = self.producer.slots() / bpf * bpf;
        let n = whole.min(room);
        push(&mut self.producer, &bytes[..n]);
        self.drop_bytes(whole - n);

        let tail = &bytes[whole..];
        self.partial[..tail.len()].copy_from_slice(tail);
        self.partial_len = tail.len();
    }
}

fn push(producer: &mut Producer<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if let Ok(mut chunk) = producer.write_chunk(bytes.len()) {
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&bytes[..split]);
        second.copy_from_slice(&bytes[split..]);
        chunk.commit_all();
    }
}

/// Consumer half, owned by the source endpoint's process callback.
pub struct FrameReader {
    consumer: Consumer<u8>,
    format: SampleFormat,
    bytes_per_frame: usize,
    /// Holds a read that wraps around the end of the ring.
    staging: Vec<u8>,
    stats: Arc<RingStats>,
}

impl FrameReader {
    pub fn channels(&self) -> usize {
        self.bytes_per_frame / self.format.bytes_per_sample()
    }

    /// Fill `frames` frames of every output, decoding whatever whole frames
    /// are queued and padding the rest with silence. At most `max_frames`
    /// are decoded per call. Returns the number of frames that carried
    /// filter output.
    ///
    /// Does not allocate.
    pub fn read_frames(&mut self, outputs: &mut [&mut [f32]], frames: usize) -> usize {
        let max_frames = self.staging.len() / self.bytes_per_frame;
        let queued = self.consumer.slots() / self.bytes_per_frame;
        let take = queued.min(frames).min(max_frames);

        let decoded = if take == 0 {
            0
        } else {
            match self.consumer.read_chunk(take * self.bytes_per_frame) {
                Ok(chunk) => {
                    let (first, second) = chunk.as_slices();
                    let decoded = if second.is_empty() {
                        decode_interleaved(self.format, first, outputs, 0)
                    } else {
                        let len = first.len() + second.len();
                        self.staging[..first.len()].copy_from_slice(first);
                        self.staging[first.len()..len].copy_from_slice(second);
                        decode_interleaved(self.format, &self.staging[..len], outputs, 0)
                    };
                    chunk.commit_all();
                    decoded
                }
                Err(_) => 0,
            }
        };

        for output in outputs.iter_mut() {
            let end = frames.min(output.len());
            if decoded < end {
                output[decoded..end].fill(0.0);
            }
        }
        if decoded < frames {
            self.stats
                .underrun_frames
                .fetch_add((frames - decoded) as u64, Ordering::Relaxed);
        }
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_frame(left: i16, right: i16) -> Vec<u8> {
        let mut bytes = left.to_le_bytes().to_vec();
        bytes.extend_from_slice(&right.to_le_bytes());
        bytes
    }

    #[test]
    fn test_partial_frame_waits_for_completion() {
        let (mut sink, mut reader) = inbound_ring(64, SampleFormat::S16le, 2, 16);
        let frame = s16_frame(i16::MAX, i16::MIN + 1);

        sink.post(&frame[..3]);
        let mut left = [1.0f32; 4];
        let mut right = [1.0f32; 4];
        let got = reader.read_frames(&mut [&mut left[..], &mut right[..]], 4);
        assert_eq!(got, 0);
        assert_eq!(left, [0.0; 4]);
        assert_eq!(right, [0.0; 4]);

        sink.post(&frame[3..]);
        let got = reader.read_frames(&mut [&mut left[..], &mut right[..]], 4);
        assert_eq!(got, 1);
        assert!((left[0] - 1.0).abs() < 1e-4);
        assert!((right[0] + 1.0).abs() < 1e-4);
        assert_eq!(&left[1..], &[0.0; 3]);
        assert_eq!(sink.stats().underrun_frames(), 4 + 3);
    }

    #[test]
    fn test_wrapped_read_is_decoded_in_order() {
        // 12-byte ring holds three stereo s16 frames; the second batch wraps.
        let (mut sink, mut reader) = inbound_ring(12, SampleFormat::S16le, 2, 8);
        let mut out_l = [0.0f32; 2];
        let mut out_r = [0.0f32; 2];

        sink.post(&[s16_frame(1000, 2000), s16_frame(3000, 4000)].concat());
        assert_eq!(reader.read_frames(&mut [&mut out_l[..], &mut out_r[..]], 2), 2);

        sink.post(&[s16_frame(5000, 6000), s16_frame(7000, 8000)].concat());
        assert_eq!(reader.read_frames(&mut [&mut out_l[..], &mut out_r[..]], 2), 2);
        let scale = i16::MAX as f32;
        assert!((out_l[0] - 5000.0 / scale).abs() < 1e-4);
        assert!((out_r[1] - 8000.0 / scale).abs() < 1e-4);
        assert_eq!(reader.channels(), 2);
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let (mut sink, mut reader) = inbound_ring(8, SampleFormat::S16le, 1, 16);
        sink.post(&[0u8; 12]);
        assert_eq!(sink.stats().overflow_bytes(), 4);

        let mut mono = [1.0f32; 6];
        assert_eq!(reader.read_frames(&mut [&mut mono[..]], 6), 4);
        assert_eq!(mono, [0.0; 6]);
    }

    #[test]
    fn test_overflow_mid_frame_keeps_alignment() {
        // Room for two mono s16 frames.
        let (mut sink, mut reader) = inbound_ring(4, SampleFormat::S16le, 1, 16);
        let sample = |v: i16| v.to_le_bytes();
        let [a0, a1] = sample(1000);
        let [b0, b1] = sample(2000);
        let [c0, c1] = sample(3000);
        let [d0, d1] = sample(4000);
        let [e0, e1] = sample(5000);

        sink.post(&[a0, a1, b0, b1, c0]);
        // Ring is full: C and D go, the first byte of E waits.
        sink.post(&[c1, d0, d1, e0]);
        assert_eq!(sink.stats().overflow_bytes(), 4);

        let mut mono = [0.0f32; 2];
        assert_eq!(reader.read_frames(&mut [&mut mono[..]], 2), 2);
        assert_eq!(mono, [1000.0 / 32768.0, 2000.0 / 32768.0]);

        sink.post(&[e1]);
        let mut mono = [0.0f32; 1];
        assert_eq!(reader.read_frames(&mut [&mut mono[..]], 1), 1);
        assert_eq!(mono, [5000.0 / 32768.0]);
    }

    #[test]
    fn test_frames_split_across_posts_arrive_whole() {
        let (mut sink, mut reader) = inbound_ring(64, SampleFormat::S16le, 2, 16);
        let bytes = [s16_frame(100, 200), s16_frame(300, 400), s16_frame(500, 600)].concat();
        for piece in [&bytes[..1], &bytes[1..6], &bytes[6..7], &bytes[7..]] {
            sink.post(piece);
        }

        let mut left = [0.0f32; 3];
        let mut right = [0.0f32; 3];
        assert_eq!(reader.read_frames(&mut [&mut left[..], &mut right[..]], 3), 3);
        assert_eq!(left, [100.0 / 32768.0, 300.0 / 32768.0, 500.0 / 32768.0]);
        assert_eq!(right, [200.0 / 32768.0, 400.0 / 32768.0, 600.0 / 32768.0]);
        assert_eq!(sink.stats().overflow_bytes(), 0);
    }

    #[test]
    fn test_oversized_quantum_is_padded_with_silence() {
        // Staging fits two frames; the caller asks for four.
        let (mut sink, mut reader) = inbound_ring(64, SampleFormat::S16le, 1, 2);
        let bytes: Vec<u8> = [1000i16, 2000, 3000, 4000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        sink.post(&bytes);

        let mut mono = [1.0f32; 4];
        assert_eq!(reader.read_frames(&mut [&mut mono[..]], 4), 2);
        assert_eq!(mono, [1000.0 / 32768.0, 2000.0 / 32768.0, 0.0, 0.0]);
        assert_eq!(sink.stats().underrun_frames(), 2);

        // The frames that did not fit stay queued.
        assert_eq!(reader.read_frames(&mut [&mut mono[..2]], 2), 2);
        assert_eq!(&mono[..2], &[3000.0 / 32768.0, 4000.0 / 32768.0]);
    }
}
