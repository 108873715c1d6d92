use flate2::{Decompress, DecompressError, FlushDecompress};
use std::{convert::TryInto, mem, time::Instant};

/// Sentinel terminating every complete message in a zlib stream.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const INTERNAL_BUFFER_SIZE: usize = 32 * 1024;

/// Inflater of a connection-lifetime zlib stream.
///
/// Frames are concatenated into one compressed buffer until the suffix
/// marks a message boundary, then inflated in one pass.
#[derive(Debug)]
pub struct Inflater {
    decompress: Decompress,
    compressed: Vec<u8>,
    internal_buffer: Vec<u8>,
    buffer: Vec<u8>,
    last_shrink: Instant,
    shard: [u64; 2],
}

impl Inflater {
    pub fn new(shard: [u64; 2]) -> Self {
        Self {
            decompress: Decompress::new(true),
            compressed: Vec::new(),
            internal_buffer: Vec::with_capacity(INTERNAL_BUFFER_SIZE),
            buffer: Vec::with_capacity(INTERNAL_BUFFER_SIZE),
            last_shrink: Instant::now(),
            shard,
        }
    }

    /// Append a frame to the compressed buffer.
    pub fn extend(&mut self, slice: &[u8]) {
        self.compressed.extend_from_slice(slice);
    }

    /// Inflate the next message if a complete payload was received.
    ///
    /// Returns `None` while the payload is still partial.
    pub fn msg(&mut self) -> Result<Option<&[u8]>, DecompressError> {
        let length = self.compressed.len();

        if length < 4 || self.compressed[(length - 4)..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        let before = self.decompress.total_in();
        let mut offset = 0;

        loop {
            self.internal_buffer.clear();

            self.decompress.decompress_vec(
                &self.compressed[offset..],
                &mut self.internal_buffer,
                FlushDecompress::Sync,
            )?;

            offset = (self.decompress.total_in() - before)
                .try_into()
                .unwrap_or_default();
            self.buffer.extend_from_slice(&self.internal_buffer);

            let not_at_capacity = self.internal_buffer.len() < self.internal_buffer.capacity();

            if not_at_capacity || offset > self.compressed.len() {
                break;
            }
        }

        tracing::trace!(
            bytes_in = self.compressed.len(),
            bytes_out = self.buffer.len(),
            shard_id = self.shard[0],
            shard_total = self.shard[1],
            "payload lengths",
        );
        self.compressed.clear();

        Ok(Some(&self.buffer))
    }

    /// Clear the message buffer and occasionally shrink its capacity.
    pub fn clear(&mut self) {
        self.shrink();

        self.compressed.clear();
        self.internal_buffer.clear();
        self.buffer.clear();
    }

    /// Reset the inflater back to a fresh stream state.
    pub fn reset(&mut self) {
        let _old = mem::replace(self, Self::new(self.shard));
    }

    /// Shrink the buffers if at least 60 seconds have passed since the last
    /// shrink.
    fn shrink(&mut self) {
        if self.last_shrink.elapsed().as_secs() < 60 {
            return;
        }

        self.compressed.shrink_to_fit();
        self.buffer.shrink_to_fit();

        tracing::trace!(
            compressed_capacity = self.compressed.capacity(),
            buffer_capacity = self.buffer.capacity(),
            shard_id = self.shard[0],
            shard_total = self.shard[1],
            "shrunk buffers",
        );

        self.last_shrink = Instant::now();
    }
}
