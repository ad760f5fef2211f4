//! Operation framing on top of a [`Backend`].
//!
//! Every exchange with the device is declared up front: [`Transport::start_write`],
//! [`Transport::start_read`] or [`Transport::start_write_read`] announce the total number of
//! bytes, then [`Transport::write`] / [`Transport::read`] move them in as many calls as the caller
//! likes. Small writes are collected in the scratch buffer and only flushed once the operation is
//! complete; reads are served from the scratch buffer whenever the device delivered more than was
//! asked for in one call.
//!
//! A transport is not synchronised. Only one logical command may be in flight at a time.

use tracing::{debug, error, warn};

use crate::backend::{self, Backend};
use crate::config::{OverrunPolicy, TransportConfig};
use crate::error::{ArgumentError, Error, ProtocolError, Result};

pub struct Transport<B> {
    backend: B,
    chunk_size: usize,
    max_timeouts: usize,
    overrun: OverrunPolicy,

    buffer: Box<[u8]>,

    /// Bytes still expected for the current write operation.
    write_remaining: usize,
    /// Bytes staged in `buffer[..write_buffered]`.
    write_buffered: usize,

    /// Bytes the device still has to deliver for the current read operation.
    read_remaining: usize,
    /// Bytes of the current read operation in `buffer[read_pos..]`.
    read_available: usize,
    read_pos: usize,
    /// Bytes received beyond the current read operation, following the available ones.
    surplus: usize,
}

impl<B: std::fmt::Debug> std::fmt::Debug for Transport<B> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Transport")
            .field("backend", &self.backend)
            .field("write_remaining", &self.write_remaining)
            .field("write_buffered", &self.write_buffered)
            .field("read_remaining", &self.read_remaining)
            .field("read_available", &self.read_available)
            .field("surplus", &self.surplus)
            .finish()
    }
}

impl<B: Backend> Transport<B> {
    /// Creates a transport owning `backend`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer geometry in `config` is invalid, see [`TransportConfig`].
    pub fn new(backend: B, config: &TransportConfig) -> Result<Self> {
        config.validate();

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(config.buffer_size).is_err() {
            error!("Transport buffer allocation of {} bytes failed.", config.buffer_size);
            return Err(Error::Allocation(config.buffer_size));
        }
        buffer.resize(config.buffer_size, 0);

        Ok(Self {
            backend,
            chunk_size: config.chunk_size,
            max_timeouts: config.max_timeouts,
            overrun: config.overrun,
            buffer: buffer.into_boxed_slice(),
            write_remaining: 0,
            write_buffered: 0,
            read_remaining: 0,
            read_available: 0,
            read_pos: 0,
            surplus: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Bytes still expected by the current write operation.
    pub fn write_remaining(&self) -> usize {
        self.write_remaining
    }

    /// Bytes still expected by the current read operation, buffered or not.
    pub fn read_remaining(&self) -> usize {
        self.read_remaining + self.read_available
    }

    /// Starts a write operation of `length` bytes.
    ///
    /// All bytes of the operation must be written before another operation is started.
    pub fn start_write(&mut self, length: usize) -> Result<()> {
        if length == 0 {
            return Err(ArgumentError::ZeroLength.into());
        }

        debug!("Starting write operation (length = {} bytes).", length);
        self.reset_write(length);
        Ok(())
    }

    /// Starts a read operation of `length` bytes.
    ///
    /// All bytes of the operation must be read before another operation is started.
    pub fn start_read(&mut self, length: usize) -> Result<()> {
        if length == 0 {
            return Err(ArgumentError::ZeroLength.into());
        }

        debug!("Starting read operation (length = {} bytes).", length);
        if self.write_remaining > 0 {
            // A plain read has no paired write; whatever is staged will never be sent.
            warn!(
                "Last write operation was not performed, dropping {} staged bytes.",
                self.write_buffered
            );
            self.write_remaining = 0;
            self.write_buffered = 0;
        }
        self.reset_read(length);
        Ok(())
    }

    /// Starts a write operation followed by a read operation.
    ///
    /// This is not the same as [`Transport::start_write`] followed by [`Transport::start_read`]:
    /// the device answers the write with the read data, so the write must be completed before
    /// the first byte of the read is requested.
    pub fn start_write_read(&mut self, write_length: usize, read_length: usize) -> Result<()> {
        if write_length == 0 || read_length == 0 {
            return Err(ArgumentError::ZeroLength.into());
        }

        debug!(
            "Starting write / read operation (length = {} / {} bytes).",
            write_length, read_length
        );
        self.reset_write(write_length);
        self.reset_read(read_length);
        Ok(())
    }

    fn reset_write(&mut self, length: usize) {
        if self.write_buffered > 0 {
            warn!("Last write operation left {} bytes in the buffer.", self.write_buffered);
        }
        if self.write_remaining > 0 {
            warn!("Last write operation was not performed.");
        }
        if self.surplus > 0 {
            // A new command can't be answered by data that arrived before it was sent.
            warn!("Discarding {} bytes received ahead of a write operation.", self.surplus);
            self.surplus = 0;
        }

        self.write_remaining = length;
        self.write_buffered = 0;
    }

    fn reset_read(&mut self, length: usize) {
        if self.read_available > 0 {
            warn!("Last read operation left {} bytes in the buffer.", self.read_available);
        }
        if self.read_remaining > 0 {
            warn!("Last read operation left {} bytes on the device.", self.read_remaining);
        }

        let surplus = std::mem::take(&mut self.surplus);
        let surplus_pos = self.read_pos + self.read_available;

        if surplus > 0 && surplus <= length {
            debug!("Using {} bytes received ahead of the read operation.", surplus);
            self.read_pos = surplus_pos;
            self.read_available = surplus;
            self.read_remaining = length - surplus;
            return;
        }

        if surplus > 0 {
            warn!(
                "Discarding {} bytes received ahead of a read operation of {} bytes.",
                surplus, length
            );
        }

        self.read_remaining = length;
        self.read_available = 0;
        self.read_pos = 0;
    }

    /// Writes `data` as part of the current write operation.
    ///
    /// The data is only buffered until the operation is complete; the call that completes it
    /// sends everything to the device.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let length = data.len();

        if length > self.write_remaining {
            error!(
                "Requested to write {} bytes but only {} bytes are expected for the write operation.",
                length, self.write_remaining
            );
            return Err(ArgumentError::WriteLengthExceeded {
                requested: length,
                expected: self.write_remaining,
            }
            .into());
        }

        if length < self.write_remaining {
            let available = self.buffer.len() - self.write_buffered;
            if length > available {
                error!("Write request is too large for the buffer.");
                return Err(ArgumentError::BufferTooSmall {
                    requested: length,
                    available,
                }
                .into());
            }

            self.buffer[self.write_buffered..][..length].copy_from_slice(data);
            self.write_remaining -= length;
            self.write_buffered += length;

            debug!("Wrote {} bytes into buffer.", length);
            return Ok(());
        }

        // This completes the operation.
        self.write_remaining = 0;

        if self.write_buffered == 0 {
            return backend::send(&mut self.backend, data, self.max_timeouts);
        }

        // Fill the buffer up to the next chunk boundary so that only the final transfer of the
        // operation can be short.
        let fill = self.write_buffered.next_multiple_of(self.chunk_size) - self.write_buffered;
        let (head, tail) = data.split_at(fill.min(length));

        if !head.is_empty() {
            self.buffer[self.write_buffered..][..head.len()].copy_from_slice(head);
            debug!("Buffer filled up with {} bytes.", head.len());
        }

        let buffered = self.write_buffered + head.len();
        self.write_buffered = 0;
        backend::send(&mut self.backend, &self.buffer[..buffered], self.max_timeouts)?;

        if tail.is_empty() {
            return Ok(());
        }

        backend::send(&mut self.backend, tail, self.max_timeouts)
    }

    /// Reads `buf.len()` bytes of the current read operation.
    ///
    /// Fails if the write half of the operation has not been completed yet.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut length = buf.len();

        if self.write_remaining > 0 {
            error!(
                "Requested to read while {} bytes of the write operation are still expected.",
                self.write_remaining
            );
            return Err(ArgumentError::WriteIncomplete {
                remaining: self.write_remaining,
            }
            .into());
        }

        if length > self.read_remaining + self.read_available {
            error!(
                "Requested to read {} bytes but only {} bytes are expected for the read operation.",
                length,
                self.read_remaining + self.read_available
            );
            return Err(ArgumentError::ReadLengthExceeded {
                requested: length,
                expected: self.read_remaining + self.read_available,
            }
            .into());
        }

        if length <= self.read_available {
            buf.copy_from_slice(&self.buffer[self.read_pos..][..length]);
            self.read_available -= length;
            self.read_pos += length;

            debug!("Read {} bytes from buffer.", length);
            return Ok(());
        }

        let mut pos = 0;

        if self.read_available > 0 {
            let n = self.read_available;
            buf[..n].copy_from_slice(&self.buffer[self.read_pos..][..n]);
            pos = n;
            length -= n;

            debug!("Read {} bytes from buffer to flush it.", n);
            self.read_available = 0;
            self.read_pos = 0;
        }

        while length > 0 {
            // The device may always answer with a full chunk, so requests smaller than that go
            // through the scratch buffer.
            let into_buffer = length < self.chunk_size;

            let received = if into_buffer {
                backend::receive(&mut self.backend, &mut self.buffer[..self.chunk_size], self.max_timeouts)?
            } else {
                backend::receive(&mut self.backend, &mut buf[pos..][..self.chunk_size], self.max_timeouts)?
            };

            let mut accepted = received;
            if received > self.read_remaining {
                error!(
                    "Expected {} bytes from device but {} bytes received.",
                    self.read_remaining, received
                );

                if self.overrun == OverrunPolicy::Reject || !into_buffer {
                    return Err(ProtocolError::Overrun {
                        expected: self.read_remaining,
                        received,
                    }
                    .into());
                }

                accepted = self.read_remaining;
                self.surplus = received - accepted;
            }

            if into_buffer {
                let n = accepted.min(length);
                buf[pos..][..n].copy_from_slice(&self.buffer[..n]);

                // Keep whatever was received beyond this call for the next one.
                self.read_available = accepted - n;
                self.read_pos = n;

                pos += n;
                length -= n;
                debug!("Read {} bytes from buffer.", n);
            } else {
                pos += accepted;
                length -= accepted;
                debug!("Read {} bytes from device.", accepted);
            }

            self.read_remaining -= accepted;
        }

        Ok(())
    }
}
