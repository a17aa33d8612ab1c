//! Buffered sequential writer over a block region.
//!
//! Metadata records are laid down append-style: small writes accumulate
//! in a one-block buffer, writes of at least a full buffer bypass it
//! when the buffer is clean, and `flush` zero-pads the tail out to a
//! whole block. The first error latches; every later call returns it.

use crate::{CodecError, Result};
use tracing::warn;

/// Destination for sequential buffered output.
pub trait RegionWriter {
    /// Write `data` at the given byte offset within the region.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;

    /// Make previously written bytes durable.
    fn sync(&mut self) -> std::io::Result<()>;
}

/// Append-oriented writer with one block of buffering.
#[derive(Debug)]
pub struct BufferedBlockWriter<W: RegionWriter> {
    region: W,
    block_size: usize,
    /// Byte offset of the start of the current buffer.
    position: u64,
    buffer: Vec<u8>,
    error: Option<String>,
}

impl<W: RegionWriter> BufferedBlockWriter<W> {
    pub fn new(region: W, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(CodecError::InvalidField {
                field: "block_size",
                reason: "must be nonzero",
            });
        }
        Ok(Self {
            region,
            block_size,
            position: 0,
            buffer: Vec::with_capacity(block_size),
            error: None,
        })
    }

    /// Bytes that still fit in the current buffer.
    #[must_use]
    pub fn space_remaining(&self) -> usize {
        self.block_size - self.buffer.len()
    }

    /// Total bytes accepted so far, buffered or written.
    #[must_use]
    pub fn bytes_accepted(&self) -> u64 {
        self.position + self.buffer.len() as u64
    }

    fn check_latch(&self) -> Result<()> {
        match &self.error {
            Some(message) => Err(CodecError::Write(message.clone())),
            None => Ok(()),
        }
    }

    fn latch(&mut self, err: &std::io::Error) -> CodecError {
        let message = err.to_string();
        warn!(
            target: "fvdo::geometry",
            event = "buffered_writer_error",
            error = %message
        );
        self.error = Some(message.clone());
        CodecError::Write(message)
    }

    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        match self.region.write_at(self.position, data) {
            Ok(()) => {
                self.position += data.len() as u64;
                Ok(())
            }
            Err(err) => Err(self.latch(&err)),
        }
    }

    fn flush_full_buffer(&mut self) -> Result<()> {
        debug_assert_eq!(self.buffer.len(), self.block_size);
        let block = std::mem::take(&mut self.buffer);
        let result = self.write_out(&block);
        self.buffer = Vec::with_capacity(self.block_size);
        result
    }

    /// Append `data` to the region.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        self.check_latch()?;
        while !data.is_empty() {
            if self.buffer.is_empty() && data.len() >= self.block_size {
                // Whole blocks bypass the buffer.
                let direct = data.len() / self.block_size * self.block_size;
                self.write_out(&data[..direct])?;
                data = &data[direct..];
                continue;
            }
            let take = self.space_remaining().min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.space_remaining() == 0 {
                self.flush_full_buffer()?;
            }
        }
        Ok(())
    }

    /// Zero-pad the tail to a whole block, write it, and sync.
    pub fn flush(&mut self) -> Result<()> {
        self.check_latch()?;
        if !self.buffer.is_empty() {
            let mut block = std::mem::take(&mut self.buffer);
            block.resize(self.block_size, 0);
            self.write_out(&block)?;
            self.buffer = Vec::with_capacity(self.block_size);
        }
        match self.region.sync() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(&err)),
        }
    }

    /// Flush and give the region back.
    pub fn finish(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.region)
    }
}
