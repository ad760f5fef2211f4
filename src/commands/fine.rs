//! Renesas single-wire debug interface (FINE).

use scroll::{Pread, Pwrite, LE};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{ArgumentError, Result};
use crate::transport::Transport;

const CMD_FINE_IO: u8 = 0xe0;

const FINE_HEADER_SIZE: usize = 13;
const FINE_STATUS_SIZE: usize = 4;

/// Result of a [`fine_io`] operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FineIo {
    pub data: Vec<u8>,
    /// Status word reported by the device. Its meaning is not documented.
    pub status: u32,
}

/// Performs a FINE I/O operation.
///
/// Must only be used while the FINE target interface is selected. Sends `out` and reads back
/// `in_length` bytes.
pub fn fine_io<B: Backend>(
    transport: &mut Transport<B>,
    out: &[u8],
    in_length: usize,
    param: u32,
) -> Result<FineIo> {
    let out_length = u32::try_from(out.len()).map_err(|_| ArgumentError::PayloadTooLarge(out.len()))?;
    let in_length32 = u32::try_from(in_length).map_err(|_| ArgumentError::PayloadTooLarge(in_length))?;

    transport.start_write_read(FINE_HEADER_SIZE + out.len(), FINE_STATUS_SIZE + in_length)?;

    let mut header = [0u8; FINE_HEADER_SIZE];
    header[0] = CMD_FINE_IO;
    header.pwrite_with(out_length, 1, LE)?;
    header.pwrite_with(in_length32, 5, LE)?;
    header.pwrite_with(param, 9, LE)?;

    transport.write(&header)?;
    if !out.is_empty() {
        transport.write(out)?;
    }

    let mut data = vec![0u8; in_length];
    transport.read(&mut data)?;

    let mut status = [0u8; FINE_STATUS_SIZE];
    transport.read(&mut status)?;
    let status: u32 = status.pread_with(0, LE)?;

    if status != 0 {
        warn!("FINE I/O finished with status {:#010x}.", status);
    } else {
        debug!("FINE I/O transferred {} bytes out, {} bytes in.", out.len(), in_length);
    }

    Ok(FineIo { data, status })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::mock::{MockBackend, Reply};
    use crate::config::TransportConfig;
    use crate::error::ErrorKind;

    #[test]
    fn exchange() {
        let backend = MockBackend::new(vec![Reply::Data(vec![0x11, 0x22, 0x33, 0x01, 0x00, 0x00, 0x00])]);
        let mut transport = Transport::new(backend, &TransportConfig::default()).unwrap();

        let result = fine_io(&mut transport, &[0xaa, 0xbb], 3, 0x12345678).unwrap();

        assert_eq!(
            result,
            FineIo {
                data: vec![0x11, 0x22, 0x33],
                status: 1
            }
        );
        // Header and payload go out in one transfer.
        assert_eq!(
            transport.backend().sent(),
            [vec![
                0xe0, 0x02, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12, 0xaa, 0xbb
            ]]
        );
    }

    #[test]
    fn without_payload() {
        let backend = MockBackend::new(vec![Reply::Data(vec![0; FINE_STATUS_SIZE])]);
        let mut transport = Transport::new(backend, &TransportConfig::default()).unwrap();

        let result = fine_io(&mut transport, &[], 0, 0).unwrap();

        assert!(result.data.is_empty());
        assert_eq!(result.status, 0);
        assert_eq!(transport.backend().sent().len(), 1);
    }

    #[test]
    fn missing_status_times_out() {
        let backend = MockBackend::new(vec![Reply::Data(vec![0x11, 0x22])]);
        let mut transport = Transport::new(backend, &TransportConfig::default()).unwrap();

        let err = fine_io(&mut transport, &[0x01], 2, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
