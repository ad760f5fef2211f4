use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use super::{Backend, TransferError};
use crate::error::OpenError;

/// Stream backend on one connected TCP socket.
///
/// TCP has no chunk ceiling of its own, so a send hands the whole buffer to the socket and a
/// receive takes whatever the socket has, up to the buffer it was given.
#[derive(Debug)]
pub struct TcpBackend {
    stream: TcpStream,
}

impl TcpBackend {
    #[tracing::instrument(skip(timeout))]
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, OpenError> {
        debug!("Trying to connect to {}.", addr);

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(OpenError::Connect)?;
        Self::from_stream(stream, timeout)
    }

    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self, OpenError> {
        stream.set_nodelay(true).map_err(OpenError::Connect)?;
        stream.set_read_timeout(Some(timeout)).map_err(OpenError::Connect)?;
        stream.set_write_timeout(Some(timeout)).map_err(OpenError::Connect)?;

        info!("Connected to {:?}.", stream.peer_addr().ok());
        Ok(Self { stream })
    }
}

impl Backend for TcpBackend {
    fn send_once(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        match self.stream.write(data) {
            Ok(0) => Err(TransferError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => Ok(n),
            Err(e) => Err(TransferError::from_io(e)),
        }
    }

    fn receive_once(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        match self.stream.read(buf) {
            Ok(0) => Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by device",
            ))),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransferError::from_io(e)),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}
