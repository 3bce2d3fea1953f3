//! Pipe buffer management.
//!
//! Inbound data (filter stdout) is read into one reusable fixed-capacity
//! [`InboundChunk`]. Reads from a pipe do not line up with audio frames,
//! so the chunk keeps a fill cursor and every fill only hands the freshly
//! read region downstream. Outbound data is never owned here: callers lend
//! a slice to [`write_to`] for the duration of one non-blocking write.

use std::io::{ErrorKind, Read, Write};

use crate::error::{BridgeError, PipeDirection};

/// One reusable inbound buffer.
///
/// `length` counts the bytes read into the buffer so far, `index` the
/// bytes already handed downstream, so `0 <= index <= length <= capacity`.
/// The region `index..length` is what the next post delivers.
pub struct InboundChunk {
    buf: Box<[u8]>,
    index: usize,
    length: usize,
}

impl InboundChunk {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            index: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes read but not yet posted downstream.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.index..self.length]
    }

    /// Record that everything pending was posted.
    pub fn mark_drained(&mut self) {
        self.index = self.length;
    }

    /// Every byte of the buffer has been filled and posted.
    pub fn is_exhausted(&self) -> bool {
        self.index == self.capacity()
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.length = 0;
    }

    fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.length..]
    }
}

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// This many bytes were appended to the chunk.
    Filled(usize),
    /// Nothing available right now; re-poll.
    WouldBlock,
}

/// Result of one non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were accepted; may be fewer than offered.
    Written(usize),
    /// The pipe is full.
    WouldBlock,
}

/// Perform exactly one read into the unfilled region of `chunk`.
///
/// Only call this after the source was reported readable: a zero-byte
/// result then means the filter closed its stdout, which is reported as
/// [`BridgeError::ProtocolViolation`] rather than a quiet EOF. `EINTR` is
/// folded into [`FillOutcome::WouldBlock`] so the loop simply re-polls.
pub fn fill_from<R: Read>(src: &mut R, chunk: &mut InboundChunk) -> Result<FillOutcome, BridgeError> {
    if chunk.length == chunk.capacity() {
        debug_assert!(false, "fill_from called on a full chunk");
        chunk.reset();
    }
    match src.read(chunk.unfilled_mut()) {
        Ok(0) => Err(BridgeError::ProtocolViolation {
            pipe: PipeDirection::FromLambda,
        }),
        Ok(n) => {
            chunk.length += n;
            Ok(FillOutcome::Filled(n))
        }
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(FillOutcome::WouldBlock)
        }
        Err(e) => Err(BridgeError::io(PipeDirection::FromLambda, e)),
    }
}

/// Perform exactly one write of as much of `bytes` as `dst` accepts.
pub fn write_to<W: Write>(dst: &mut W, bytes: &[u8]) -> Result<WriteOutcome, BridgeError> {
    if bytes.is_empty() {
        return Ok(WriteOutcome::Written(0));
    }
    match dst.write(bytes) {
        Ok(n) => Ok(WriteOutcome::Written(n)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(WriteOutcome::WouldBlock)
        }
        Err(e) => Err(BridgeError::io(PipeDirection::ToLambda, e)),
    }
}

/// Owner of the in-flight inbound chunk.
pub struct PipeBuffers {
    capacity: usize,
    inbound: Option<InboundChunk>,
}

impl PipeBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inbound: None,
        }
    }

    /// The current chunk, allocated on first use.
    pub fn acquire_inbound(&mut self) -> &mut InboundChunk {
        let capacity = self.capacity;
        self.inbound.get_or_insert_with(|| InboundChunk::new(capacity))
    }

    /// Rewind the chunk once it has been completely filled and posted.
    pub fn recycle_if_exhausted(&mut self) {
        if let Some(chunk) = self.inbound.as_mut()
            && chunk.is_exhausted()
        {
            chunk.reset();
        }
    }

    /// Free the chunk. Returns whether one was in flight.
    pub fn release_inbound(&mut self) -> bool {
        self.inbound.take().is_some()
    }

    #[cfg(test)]
    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// Replays a fixed sequence of read results.
    struct ScriptedReader {
        script: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Accepts at most `room` bytes in total, then reports a full pipe.
    struct TightWriter {
        room: usize,
        accepted: Vec<u8>,
    }

    impl Write for TightWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Drive `fill_from` the way the loop does, collecting posted regions.
    fn drive(chunk: &mut InboundChunk, reader: &mut ScriptedReader, reads: usize) -> Vec<Vec<u8>> {
        let mut posts = Vec::new();
        for _ in 0..reads {
            if let FillOutcome::Filled(_) = fill_from(reader, chunk).unwrap()
                && !chunk.pending().is_empty()
            {
                posts.push(chunk.pending().to_vec());
                chunk.mark_drained();
            }
        }
        posts
    }

    #[test]
    fn test_index_tracks_sum_of_fills() {
        let sizes = [3usize, 7, 1, 20, 5];
        let script = sizes.iter().map(|&n| Ok(vec![0xAB; n])).collect();
        let mut reader = ScriptedReader::new(script);
        let mut chunk = InboundChunk::new(64);

        let mut total = 0;
        for &n in &sizes {
            assert_eq!(fill_from(&mut reader, &mut chunk).unwrap(), FillOutcome::Filled(n));
            total += n;
            assert_eq!(chunk.length(), total);
            assert_eq!(chunk.pending().len(), n);
            chunk.mark_drained();
            assert_eq!(chunk.index(), total);
            assert!(chunk.index() <= chunk.length() && chunk.length() <= chunk.capacity());
        }
    }

    #[test]
    fn test_posts_only_fresh_region_in_order() {
        let script = vec![
            Ok(b"abc".to_vec()),
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(b"defg".to_vec()),
        ];
        let mut reader = ScriptedReader::new(script);
        let mut chunk = InboundChunk::new(16);

        let posts = drive(&mut chunk, &mut reader, 3);
        assert_eq!(posts, vec![b"abc".to_vec(), b"defg".to_vec()]);
    }

    #[test]
    fn test_would_block_never_advances_cursors() {
        let script = vec![
            Ok(vec![1, 2]),
            Err(io::ErrorKind::WouldBlock.into()),
            Err(io::ErrorKind::Interrupted.into()),
        ];
        let mut reader = ScriptedReader::new(script);
        let mut chunk = InboundChunk::new(8);

        fill_from(&mut reader, &mut chunk).unwrap();
        chunk.mark_drained();
        for _ in 0..2 {
            assert_eq!(fill_from(&mut reader, &mut chunk).unwrap(), FillOutcome::WouldBlock);
            assert_eq!((chunk.index(), chunk.length()), (2, 2));
            assert!(chunk.pending().is_empty());
        }
    }

    #[test]
    fn test_zero_read_is_protocol_violation() {
        let mut reader = ScriptedReader::new(vec![Ok(Vec::new())]);
        let mut chunk = InboundChunk::new(8);
        let err = fill_from(&mut reader, &mut chunk).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ProtocolViolation {
                pipe: PipeDirection::FromLambda
            }
        ));
        assert_eq!(chunk.length(), 0);
    }

    #[test]
    fn test_hard_read_error_is_io_error() {
        let mut reader =
            ScriptedReader::new(vec![Err(io::Error::from_raw_os_error(libc::EIO))]);
        let mut chunk = InboundChunk::new(8);
        assert!(matches!(
            fill_from(&mut reader, &mut chunk),
            Err(BridgeError::Io {
                pipe: PipeDirection::FromLambda,
                ..
            })
        ));
    }

    #[test]
    fn test_read_request_is_bounded_by_remaining_capacity() {
        let mut reader = ScriptedReader::new(vec![Ok(vec![7; 6]), Ok(vec![9; 6])]);
        let mut chunk = InboundChunk::new(8);
        assert_eq!(fill_from(&mut reader, &mut chunk).unwrap(), FillOutcome::Filled(6));
        chunk.mark_drained();
        assert_eq!(fill_from(&mut reader, &mut chunk).unwrap(), FillOutcome::Filled(2));
        assert_eq!(chunk.pending(), &[9, 9]);
        chunk.mark_drained();
        assert!(chunk.is_exhausted());
    }

    #[test]
    fn test_buffers_recycle_exhausted_chunk() {
        let mut buffers = PipeBuffers::new(4);
        assert!(!buffers.has_inbound());
        let mut reader = ScriptedReader::new(vec![Ok(vec![1, 2, 3, 4]), Ok(vec![5])]);

        {
            let chunk = buffers.acquire_inbound();
            fill_from(&mut reader, chunk).unwrap();
            chunk.mark_drained();
        }
        buffers.recycle_if_exhausted();
        let chunk = buffers.acquire_inbound();
        assert_eq!((chunk.index(), chunk.length()), (0, 0));
        fill_from(&mut reader, chunk).unwrap();
        assert_eq!(chunk.pending(), &[5]);

        assert!(buffers.release_inbound());
        assert!(!buffers.release_inbound());
    }

    #[test]
    fn test_short_write_reports_accepted_count() {
        let mut dst = TightWriter {
            room: 4,
            accepted: Vec::new(),
        };
        assert_eq!(write_to(&mut dst, &[1; 10]).unwrap(), WriteOutcome::Written(4));
        assert_eq!(write_to(&mut dst, &[2; 10]).unwrap(), WriteOutcome::WouldBlock);
        assert_eq!(write_to(&mut dst, &[]).unwrap(), WriteOutcome::Written(0));
        assert_eq!(dst.accepted, vec![1; 4]);
    }
}
