//! Devices and the sessions opened on them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::commands::{self, Capabilities, FineIo};
use crate::config::TransportConfig;
use crate::connection::{self, Connection, Registration, Unregistration};
use crate::context::Context;
use crate::error::{Error, OpenError, Result};
use crate::transport::Transport;

/// Where a USB device sits on the bus.
#[cfg(feature = "usb")]
#[derive(Clone, Debug)]
pub struct UsbLocation {
    pub(crate) info: nusb::DeviceInfo,
    /// J-Link USB address (0 to 3), derived from the product id.
    pub usb_address: u8,
    /// On-board probes expose the J-Link protocol on a different interface.
    pub onboard: bool,
}

#[cfg(feature = "usb")]
impl UsbLocation {
    pub fn bus(&self) -> u8 {
        self.info.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.info.device_address()
    }
}

#[derive(Clone, Debug)]
pub enum DeviceAddress {
    #[cfg(feature = "usb")]
    Usb(UsbLocation),
    Tcp(SocketAddr),
}

impl DeviceAddress {
    pub fn is_usb(&self) -> bool {
        match self {
            #[cfg(feature = "usb")]
            DeviceAddress::Usb(_) => true,
            DeviceAddress::Tcp(_) => false,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "usb")]
            DeviceAddress::Usb(usb) => write!(f, "usb {:03}:{:03}", usb.bus(), usb.address()),
            DeviceAddress::Tcp(addr) => write!(f, "tcp {}", addr),
        }
    }
}

#[derive(Debug)]
struct DeviceInner {
    serial: Option<u32>,
    address: DeviceAddress,
    open: AtomicBool,
}

/// A J-Link device.
///
/// Cheap to clone; all clones refer to the same device and share its open state. At most one
/// session can be open on a device at any time.
#[derive(Clone, Debug)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.serial {
            Some(serial) => write!(f, "J-Link {} ({})", serial, self.inner.address),
            None => write!(f, "J-Link ({})", self.inner.address),
        }
    }
}

impl Device {
    fn new(address: DeviceAddress, serial: Option<u32>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                serial,
                address,
                open: AtomicBool::new(false),
            }),
        }
    }

    #[cfg(feature = "usb")]
    pub(crate) fn usb(location: UsbLocation, serial: Option<u32>) -> Self {
        Self::new(DeviceAddress::Usb(location), serial)
    }

    /// A device reachable over the network.
    pub fn tcp(addr: SocketAddr, serial: Option<u32>) -> Self {
        Self::new(DeviceAddress::Tcp(addr), serial)
    }

    pub fn serial(&self) -> Option<u32> {
        self.inner.serial
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    /// Takes another reference to the device.
    pub fn acquire(&self) -> Device {
        self.clone()
    }

    /// Gives up this reference. The device is freed with its last reference.
    pub fn release(self) {}

    /// Number of live references, open sessions included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Opens a session on the device.
    pub fn open(&self, ctx: &Context) -> Result<DeviceHandle> {
        let _enter = ctx.span().enter();
        self.open_with(ctx.config(), || self.open_backend(ctx.config()))
    }

    fn open_with(
        &self,
        config: &TransportConfig,
        backend: impl FnOnce() -> Result<Box<dyn Backend + Send>>,
    ) -> Result<DeviceHandle> {
        if self.inner.open.swap(true, Ordering::AcqRel) {
            error!("{} already has an open session.", self);
            return Err(OpenError::AlreadyOpen.into());
        }

        let handle = backend()
            .and_then(|backend| Transport::new(backend, config))
            .map(|transport| DeviceHandle {
                device: self.clone(),
                transport,
            });

        match &handle {
            Ok(_) => info!("Opened {}.", self),
            Err(e) => {
                self.inner.open.store(false, Ordering::Release);
                error!("Failed to open {}: {}", self, e);
            }
        }
        handle
    }

    fn open_backend(&self, config: &TransportConfig) -> Result<Box<dyn Backend + Send>> {
        match &self.inner.address {
            #[cfg(feature = "usb")]
            DeviceAddress::Usb(usb) => {
                let backend =
                    crate::backend::usb::UsbBackend::open(&usb.info, usb.onboard, config.chunk_size, config.timeout())?;
                Ok(Box::new(backend))
            }
            #[cfg(feature = "tcp")]
            DeviceAddress::Tcp(addr) => {
                let backend = crate::backend::tcp::TcpBackend::connect(*addr, config.timeout())?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "tcp"))]
            DeviceAddress::Tcp(_) => {
                let _ = config;
                Err(OpenError::Unsupported("TCP").into())
            }
        }
    }
}

/// An open session on a [`Device`].
///
/// The session is closed when the handle is dropped; use [`DeviceHandle::close`] to learn
/// whether releasing the device succeeded.
pub struct DeviceHandle {
    device: Device,
    transport: Transport<Box<dyn Backend + Send>>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device)
            .field("write_remaining", &self.transport.write_remaining())
            .field("read_remaining", &self.transport.read_remaining())
            .finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.inner.open.store(false, Ordering::Release);
    }
}

impl DeviceHandle {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Closes the session.
    ///
    /// The backend and transport buffer are freed and the device can be opened again even when
    /// releasing it fails.
    pub fn close(mut self) -> Result<()> {
        debug!("Closing {}.", self.device);

        let result = self.transport.backend_mut().shutdown();
        let device = self.device.clone();
        drop(self);

        match result {
            Ok(()) => {
                debug!("Closed {}.", device);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to release {}: {}", device, e);
                Err(Error::Release(e))
            }
        }
    }

    pub fn start_write(&mut self, length: usize) -> Result<()> {
        self.transport.start_write(length)
    }

    pub fn start_read(&mut self, length: usize) -> Result<()> {
        self.transport.start_read(length)
    }

    pub fn start_write_read(&mut self, write_length: usize, read_length: usize) -> Result<()> {
        self.transport.start_write_read(write_length, read_length)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write(data)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.transport.read(buf)
    }

    pub fn register(&mut self, connection: &Connection) -> Result<Registration> {
        connection::register(&mut self.transport, connection)
    }

    pub fn unregister(&mut self, connection: &Connection) -> Result<Unregistration> {
        connection::unregister(&mut self.transport, connection)
    }

    pub fn get_caps(&mut self) -> Result<Capabilities> {
        commands::get_caps(&mut self.transport)
    }

    pub fn get_extended_caps(&mut self) -> Result<Capabilities> {
        commands::get_extended_caps(&mut self.transport)
    }

    pub fn fine_io(&mut self, out: &[u8], in_length: usize, param: u32) -> Result<FineIo> {
        commands::fine_io(&mut self.transport, out, in_length, param)
    }
}
