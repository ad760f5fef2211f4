use std::fmt;
use std::io;

/// A result type with the error hardwired to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Direction of a transfer, seen from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Send,
    /// Device to host.
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("sending data to device"),
            Direction::Receive => f.write_str("receiving data from device"),
        }
    }
}

/// Coarse classification of an [`Error`].
///
/// Callers mostly need to know whether retrying the whole logical operation can help
/// ([`ErrorKind::Timeout`]), whether they misused the API ([`ErrorKind::Argument`]) or whether
/// the session must be considered unusable ([`ErrorKind::Io`], [`ErrorKind::Protocol`]).
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid argument or operation sequencing. Nothing was transferred.
    Argument,
    /// No data could be moved within the retry budget.
    Timeout,
    /// The backend reported a fault (disconnect, stall, I/O error).
    Io,
    /// The device sent something the protocol does not allow.
    Protocol,
    /// A resource (the transport buffer) could not be allocated.
    Resource,
    /// The device could not be found or opened.
    Device,
}

/// The error type used by this library.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// {0}
    Argument(#[from] ArgumentError),

    /// Timeout while {0}.
    Timeout(Direction),

    /// I/O error while {direction}.
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// {0}
    Protocol(#[from] ProtocolError),

    /// Failed to allocate a transport buffer of {0} bytes.
    Allocation(usize),

    /// {0}
    Open(#[from] OpenError),

    /// Failed to release the device.
    Release(#[source] io::Error),
}

impl Error {
    /// Returns the [`ErrorKind`] describing this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_) => ErrorKind::Argument,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Io { .. } => ErrorKind::Io,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Allocation(_) => ErrorKind::Resource,
            Error::Open(_) => ErrorKind::Device,
            Error::Release(_) => ErrorKind::Io,
        }
    }
}

#[derive(Debug, thiserror::Error, docsplay::Display, PartialEq, Eq)]
pub enum ArgumentError {
    /// Operation length must not be zero.
    ZeroLength,

    /// Requested to write {requested} bytes but only {expected} bytes are expected for the write operation.
    WriteLengthExceeded { requested: usize, expected: usize },

    /// Requested to read {requested} bytes but only {expected} bytes are expected for the read operation.
    ReadLengthExceeded { requested: usize, expected: usize },

    /// Write request of {requested} bytes is too large for the buffer ({available} bytes free).
    BufferTooSmall { requested: usize, available: usize },

    /// {0} bytes of data do not fit into a single command.
    PayloadTooLarge(usize),

    /// Read requested while {remaining} bytes of the preceding write are still expected.
    WriteIncomplete { remaining: usize },
}

#[derive(Debug, thiserror::Error, docsplay::Display, PartialEq, Eq)]
pub enum ProtocolError {
    /// Expected {expected} bytes from device but {received} bytes received.
    Overrun { expected: usize, received: usize },

    /// Maximum number of device connections exceeded ({0}).
    TooManyConnections(usize),

    /// Invalid connection entry size ({0} bytes).
    InvalidEntrySize(usize),

    /// Registration response of {0} bytes exceeds the maximum size.
    ResponseTooLarge(usize),

    /// Obtained invalid connection handle.
    InvalidHandle,

    /// Malformed response: {0}
    Malformed(String),
}

impl From<scroll::Error> for ProtocolError {
    fn from(error: scroll::Error) -> Self {
        ProtocolError::Malformed(error.to_string())
    }
}

impl From<scroll::Error> for Error {
    fn from(error: scroll::Error) -> Self {
        Error::Protocol(error.into())
    }
}

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum OpenError {
    /// No matching device found.
    NotFound,

    /// Device already has an open session.
    AlreadyOpen,

    /// Multiple devices match, refusing to guess.
    Ambiguous,

    /// USB error while {while_}.
    Usb {
        while_: &'static str,
        #[source]
        source: io::Error,
    },

    /// USB interface {0} not found.
    InterfaceNotFound(u8),

    /// Interface {0} endpoint not found.
    EndpointNotFound(&'static str),

    /// Could not connect to remote host.
    Connect(#[source] io::Error),

    /// The {0} backend is not available in this build.
    Unsupported(&'static str),
}
