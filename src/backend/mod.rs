//! Physical byte transports.
//!
//! A [`Backend`] moves bytes to and from one device in single physical transfers. It knows
//! nothing about operations or framing; that is the job of [`crate::transport::Transport`].
//! The bounded timeout-retry policy shared by all backends lives in [`send`] and [`receive`].

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "usb")]
pub mod usb;

use std::io;

use tracing::{debug, error, warn};

use crate::error::{Direction, Error, Result};

/// Failure of a single physical transfer attempt.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TransferError {
    /// Transfer timed out after {transferred} bytes.
    TimedOut { transferred: usize },

    /// {0}
    Io(#[from] io::Error),
}

impl TransferError {
    /// Classifies an I/O error, treating the kinds a timed-out transfer produces as timeouts.
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransferError::TimedOut { transferred: 0 },
            _ => TransferError::Io(error),
        }
    }
}

/// A physical byte pipe to one device.
///
/// Implementations perform exactly one physical transfer per call and never retry.
pub trait Backend {
    /// Sends a prefix of `data` in one physical transfer, returning how many bytes went out.
    fn send_once(&mut self, data: &[u8]) -> std::result::Result<usize, TransferError>;

    /// Receives into `buf` in one physical transfer, returning how many bytes arrived.
    ///
    /// `buf` is always exactly one chunk long.
    fn receive_once(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError>;

    /// Releases the underlying resource. The backend is dropped afterwards regardless of the result.
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn send_once(&mut self, data: &[u8]) -> std::result::Result<usize, TransferError> {
        (**self).send_once(data)
    }

    fn receive_once(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError> {
        (**self).receive_once(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }
}

/// Sends all of `data`.
///
/// A timeout that moved no data consumes one of `max_timeouts` tries; any progress restores the
/// full budget. Non-timeout errors abort immediately.
pub(crate) fn send<B: Backend + ?Sized>(backend: &mut B, mut data: &[u8], max_timeouts: usize) -> Result<()> {
    let mut tries = max_timeouts;

    while tries > 0 && !data.is_empty() {
        let transferred = match backend.send_once(data) {
            Ok(n) => n,
            Err(TransferError::TimedOut { transferred }) => {
                warn!("Failed to send data to device: timeout ({} bytes sent).", transferred);
                transferred
            }
            Err(TransferError::Io(e)) => {
                error!("Failed to send data to device: {}.", e);
                return Err(Error::Io {
                    direction: Direction::Send,
                    source: e,
                });
            }
        };

        if transferred > 0 {
            tries = max_timeouts;
        } else {
            tries -= 1;
        }

        data = &data[transferred.min(data.len())..];
        debug!("Sent {} bytes to device.", transferred);
    }

    if data.is_empty() {
        return Ok(());
    }

    error!("Sending data to device timed out.");
    Err(Error::Timeout(Direction::Send))
}

/// Receives one chunk into `buf`, returning the number of bytes received.
///
/// A timeout is only reported when every one of `max_timeouts` attempts moved nothing. A timed
/// out attempt that still delivered data counts as success.
pub(crate) fn receive<B: Backend + ?Sized>(backend: &mut B, buf: &mut [u8], max_timeouts: usize) -> Result<usize> {
    for _ in 0..max_timeouts {
        let transferred = match backend.receive_once(buf) {
            Ok(n) => n,
            Err(TransferError::TimedOut { transferred }) => {
                warn!("Failed to receive data from device: timeout ({} bytes received).", transferred);
                transferred
            }
            Err(TransferError::Io(e)) => {
                error!("Failed to receive data from device: {}.", e);
                return Err(Error::Io {
                    direction: Direction::Receive,
                    source: e,
                });
            }
        };

        if transferred > 0 {
            debug!("Received {} bytes from device.", transferred);
            return Ok(transferred.min(buf.len()));
        }
    }

    error!("Receiving data from device timed out.");
    Err(Error::Timeout(Direction::Receive))
}

#[cfg(test)]
mod tests {
    use super::mock::{MockBackend, Reply};
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn receive_times_out_after_budget() {
        let mut backend = MockBackend::new(vec![Reply::Timeout(vec![]), Reply::Timeout(vec![]), Reply::Data(vec![1])]);
        let mut buf = [0; 16];

        let err = receive(&mut backend, &mut buf, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(backend.receive_calls(), 2);
    }

    #[test]
    fn receive_accepts_partial_data_on_last_try() {
        let mut backend = MockBackend::new(vec![Reply::Timeout(vec![]), Reply::Timeout(vec![7, 8])]);
        let mut buf = [0; 16];

        assert_eq!(receive(&mut backend, &mut buf, 2).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[test]
    fn receive_does_not_retry_io_errors() {
        let mut backend = MockBackend::new(vec![Reply::Fault, Reply::Data(vec![1])]);
        let mut buf = [0; 16];

        let err = receive(&mut backend, &mut buf, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(backend.receive_calls(), 1);
    }

    #[test]
    fn send_times_out_without_progress() {
        let mut backend = MockBackend::new(vec![]);
        backend.stall_sends(2);

        let err = send(&mut backend, &[1, 2, 3], 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(backend.sent().is_empty());
    }

    #[test]
    fn send_recovers_after_single_timeout() {
        let mut backend = MockBackend::new(vec![]);
        backend.stall_sends(1);

        send(&mut backend, &[1, 2, 3], 2).unwrap();
        assert_eq!(backend.sent(), &[vec![1, 2, 3]]);
    }

    #[test]
    fn send_continues_after_partial_transfer() {
        let mut backend = MockBackend::new(vec![]).with_max_send(2);

        send(&mut backend, &[1, 2, 3, 4, 5], 2).unwrap();
        assert_eq!(backend.sent(), &[vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn send_accepts_partial_data_on_last_try() {
        let mut backend = MockBackend::new(vec![]);
        backend.stall_sends(1);
        backend.time_out_send_after(2);

        send(&mut backend, &[1, 2, 3, 4], 2).unwrap();
        assert_eq!(backend.sent(), &[vec![1, 2], vec![3, 4]]);
    }
}
