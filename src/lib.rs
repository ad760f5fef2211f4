#![deny(unused_must_use)]

//! Host-side transport for SEGGER J-Link debug probes.
//!
//! Devices are found through a [`Context`], opened into a [`DeviceHandle`] and talked to in
//! declared write/read operations, see [`transport`].

pub mod backend;
pub mod commands;
pub mod config;
pub mod connection;
mod context;
mod device;
pub mod discovery;
mod error;
pub mod transport;

pub use config::{OverrunPolicy, TransportConfig};
pub use connection::{Connection, Registration, Unregistration};
pub use context::Context;
#[cfg(feature = "usb")]
pub use device::UsbLocation;
pub use device::{Device, DeviceAddress, DeviceHandle};
pub use discovery::DeviceSelector;
pub use error::{ArgumentError, Direction, Error, ErrorKind, OpenError, ProtocolError, Result};
pub use transport::Transport;
