use std::future::Future;
use std::io;
use std::time::Duration;

use async_io::{block_on, Timer};
use futures_lite::FutureExt;
use nusb::transfer::{Direction, EndpointType, RequestBuffer};
use nusb::{DeviceInfo, Interface};
use tracing::{debug, trace};

use super::{Backend, TransferError};
use crate::error::OpenError;

/// USB interface number of J-Link devices.
pub const USB_INTERFACE_NUMBER: u8 = 0;

/// USB interface number of J-Link OB (on-board) devices.
pub const USB_INTERFACE_NUMBER_OB: u8 = 2;

/// Runs `fut` to completion unless `timeout` expires first.
fn wait<T>(fut: impl Future<Output = T>, timeout: Duration) -> Option<T> {
    block_on(async { Some(fut.await) }.or(async {
        Timer::after(timeout).await;
        None
    }))
}

/// Classifies the completion of one bulk transfer.
///
/// A transfer cancelled because its attempt timed out still reports the bytes it moved before
/// the cancellation took effect.
fn completion_result(
    status: Result<(), nusb::transfer::TransferError>,
    transferred: usize,
    timed_out: bool,
) -> Result<usize, TransferError> {
    match status {
        Ok(()) => Ok(transferred),
        Err(nusb::transfer::TransferError::Cancelled) if timed_out => Err(TransferError::TimedOut { transferred }),
        Err(e) => Err(TransferError::Io(io::Error::other(e))),
    }
}

/// Bulk-pipe backend on one claimed interface with one IN and one OUT endpoint.
pub struct UsbBackend {
    interface: Interface,
    endpoint_in: u8,
    endpoint_out: u8,
    chunk_size: usize,
    timeout: Duration,
}

impl std::fmt::Debug for UsbBackend {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("UsbBackend")
            .field("endpoint_in", &format_args!("{:#04x}", self.endpoint_in))
            .field("endpoint_out", &format_args!("{:#04x}", self.endpoint_out))
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl UsbBackend {
    /// Opens the device and claims the probe's interface.
    #[tracing::instrument(skip_all, fields(bus = info.bus_number(), address = info.device_address()))]
    pub fn open(info: &DeviceInfo, onboard: bool, chunk_size: usize, timeout: Duration) -> Result<Self, OpenError> {
        let interface_number = if onboard {
            USB_INTERFACE_NUMBER_OB
        } else {
            USB_INTERFACE_NUMBER
        };

        debug!(
            "Trying to open device (bus:address = {:03}:{:03}).",
            info.bus_number(),
            info.device_address()
        );

        let device = info.open().map_err(|source| OpenError::Usb {
            while_: "opening device",
            source,
        })?;

        let config = device.active_configuration().map_err(|e| OpenError::Usb {
            while_: "reading configuration descriptor",
            source: io::Error::other(e),
        })?;

        let group = config
            .interfaces()
            .find(|group| group.interface_number() == interface_number)
            .ok_or(OpenError::InterfaceNotFound(interface_number))?;
        let alt = group
            .alt_settings()
            .next()
            .ok_or(OpenError::InterfaceNotFound(interface_number))?;

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for ep in alt.endpoints() {
            trace!("endpoint {:#04x}: {:?} {:?}", ep.address(), ep.direction(), ep.transfer_type());
            if ep.transfer_type() != EndpointType::Bulk {
                continue;
            }
            match ep.direction() {
                Direction::In => endpoint_in = Some(ep.address()),
                Direction::Out => endpoint_out = Some(ep.address()),
            }
        }

        let endpoint_in = endpoint_in.ok_or(OpenError::EndpointNotFound("IN"))?;
        let endpoint_out = endpoint_out.ok_or(OpenError::EndpointNotFound("OUT"))?;
        debug!("Using endpoint {:02x} (IN) and {:02x} (OUT).", endpoint_in, endpoint_out);

        let interface = device
            .claim_interface(interface_number)
            .map_err(|source| OpenError::Usb {
                while_: "claiming interface",
                source,
            })?;

        debug!("Device opened successfully.");

        Ok(Self {
            interface,
            endpoint_in,
            endpoint_out,
            chunk_size,
            timeout,
        })
    }
}

impl Backend for UsbBackend {
    fn send_once(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        let len = data.len().min(self.chunk_size);

        let mut queue = self.interface.bulk_out_queue(self.endpoint_out);
        queue.submit(data[..len].to_vec());

        let (comp, timed_out) = match wait(queue.next_complete(), self.timeout) {
            Some(comp) => (comp, false),
            None => {
                // The cancelled transfer still tells how much the device accepted.
                queue.cancel_all();
                (block_on(queue.next_complete()), true)
            }
        };

        let transferred = comp.data.actual_length();
        trace!("bulk out {:#04x}: {} of {} bytes, {:?}", self.endpoint_out, transferred, len, comp.status);
        completion_result(comp.status, transferred, timed_out)
    }

    fn receive_once(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut queue = self.interface.bulk_in_queue(self.endpoint_in);
        // Always request a full chunk, the device only behaves when read in chunk units.
        queue.submit(RequestBuffer::new(self.chunk_size));

        let (comp, timed_out) = match wait(queue.next_complete(), self.timeout) {
            Some(comp) => (comp, false),
            None => {
                queue.cancel_all();
                (block_on(queue.next_complete()), true)
            }
        };

        // Bytes that arrived before a cancellation are part of the response too.
        let transferred = comp.data.len().min(buf.len());
        buf[..transferred].copy_from_slice(&comp.data[..transferred]);
        trace!("bulk in {:#04x}: {} bytes, {:?}", self.endpoint_in, transferred, comp.status);
        completion_result(comp.status, transferred, timed_out)
    }
}

#[cfg(test)]
mod tests {
    use nusb::transfer::TransferError as UsbError;

    use super::*;

    #[test]
    fn completed_transfer() {
        assert!(matches!(completion_result(Ok(()), 2048, false), Ok(2048)));
        // Finished just as the timer fired.
        assert!(matches!(completion_result(Ok(()), 12, true), Ok(12)));
    }

    #[test]
    fn cancelled_after_timeout_keeps_progress() {
        assert!(matches!(
            completion_result(Err(UsbError::Cancelled), 100, true),
            Err(TransferError::TimedOut { transferred: 100 })
        ));
        assert!(matches!(
            completion_result(Err(UsbError::Cancelled), 0, true),
            Err(TransferError::TimedOut { transferred: 0 })
        ));
    }

    #[test]
    fn faults_are_io_errors() {
        assert!(matches!(
            completion_result(Err(UsbError::Stall), 0, false),
            Err(TransferError::Io(_))
        ));
        assert!(matches!(
            completion_result(Err(UsbError::Disconnected), 5, true),
            Err(TransferError::Io(_))
        ));
        assert!(matches!(
            completion_result(Err(UsbError::Cancelled), 0, false),
            Err(TransferError::Io(_))
        ));
    }
}
