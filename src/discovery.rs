use std::fmt;
use std::net::IpAddr;

use anyhow::{anyhow, bail};

use crate::device::{Device, DeviceAddress};

/// USB vendor id of SEGGER.
pub const VENDOR_ID: u16 = 0x1366;

/// Port the J-Link remote server listens on.
pub const DEFAULT_TCP_PORT: u16 = 19020;

#[cfg(feature = "usb")]
const USB_CLASS_VENDOR_SPECIFIC: u8 = 0xff;

/// Maps a J-Link product id to the USB address the probe was configured with.
///
/// Probes configured for USB address `n` enumerate with product id `0x0101 + n`.
pub fn usb_address(product_id: u16) -> Option<u8> {
    match product_id {
        0x0101..=0x0104 => Some((product_id - 0x0101) as u8),
        _ => None,
    }
}

/// Parses the serial number string of a probe.
///
/// J-Link serial numbers are decimal, sometimes padded with leading zeros.
pub fn parse_serial(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Finds all J-Link probes connected via USB.
#[cfg(feature = "usb")]
#[tracing::instrument(skip_all)]
pub(crate) fn list_jlink_devices() -> Result<Vec<Device>, crate::error::OpenError> {
    tracing::debug!("Searching for J-Link probes using nusb");

    let devices = nusb::list_devices().map_err(|source| crate::error::OpenError::Usb {
        while_: "listing devices",
        source,
    })?;
    let probes: Vec<_> = devices.filter_map(get_jlink_info).collect();

    tracing::debug!("Found {} J-Link probes", probes.len());
    Ok(probes)
}

/// Checks if a given device is a J-Link probe, returning `Some(Device)` if so.
#[cfg(feature = "usb")]
fn get_jlink_info(info: nusb::DeviceInfo) -> Option<Device> {
    use crate::backend::usb::USB_INTERFACE_NUMBER;
    use crate::device::UsbLocation;

    if info.vendor_id() != VENDOR_ID {
        return None;
    }

    let Some(usb_address) = usb_address(info.product_id()) else {
        tracing::trace!(
            "{:04x}:{:04x}: unsupported product id, skipping",
            info.vendor_id(),
            info.product_id()
        );
        return None;
    };

    let serial = match info.serial_number() {
        Some(s) => {
            let serial = parse_serial(s);
            if serial.is_none() {
                tracing::warn!("Failed to parse serial number {:?}", s);
            }
            serial
        }
        None => {
            tracing::debug!("Probe at USB address {} has no serial number", usb_address);
            None
        }
    };

    // Regular probes have a vendor specific interface 0, on-board ones put a CDC interface there.
    let onboard = info
        .interfaces()
        .find(|i| i.interface_number() == USB_INTERFACE_NUMBER)
        .is_some_and(|i| i.class() != USB_CLASS_VENDOR_SPECIFIC);

    tracing::trace!(
        "Found J-Link at {:03}:{:03}: serial {:?}, USB address {}, on-board {}",
        info.bus_number(),
        info.device_address(),
        serial,
        usb_address,
        onboard
    );

    Some(Device::usb(
        UsbLocation {
            info,
            usb_address,
            onboard,
        },
        serial,
    ))
}

/// Selects a device.
///
/// Parsed from one of:
///
/// - `<serial>`: USB device with the given serial number
/// - `usb` or `usb:<serial>`: the only USB device, or the one with the given serial number
/// - `tcp:<host>` or `tcp:<host>:<port>`: network device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
// Selectors are written as strings in configuration files, see `TryFrom<&str>`.
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelector {
    Usb { serial: Option<u32> },
    Tcp { host: String, port: u16 },
}

impl TryFrom<&str> for DeviceSelector {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value == "usb" {
            return Ok(DeviceSelector::Usb { serial: None });
        }

        if let Some(serial) = value.strip_prefix("usb:") {
            let serial = parse_serial(serial).ok_or_else(|| anyhow!("invalid serial number {:?}", serial))?;
            return Ok(DeviceSelector::Usb { serial: Some(serial) });
        }

        if let Some(addr) = value.strip_prefix("tcp:") {
            // Colons in IPv6 addresses require brackets when a port follows.
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') || host.ends_with(']') => (host, port.parse()?),
                _ => (addr, DEFAULT_TCP_PORT),
            };
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                bail!("missing host in {:?}", value);
            }
            return Ok(DeviceSelector::Tcp {
                host: host.to_string(),
                port,
            });
        }

        match parse_serial(value) {
            Some(serial) => Ok(DeviceSelector::Usb { serial: Some(serial) }),
            None => bail!("invalid device selector {:?}", value),
        }
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        TryFrom::<&str>::try_from(&value)
    }
}

impl From<DeviceSelector> for String {
    fn from(selector: DeviceSelector) -> Self {
        selector.to_string()
    }
}

impl DeviceSelector {
    pub fn matches(&self, device: &Device) -> bool {
        match (self, device.address()) {
            (DeviceSelector::Usb { serial }, address) if address.is_usb() => {
                serial.map(|s| device.serial() == Some(s)).unwrap_or(true)
            }
            (DeviceSelector::Tcp { host, port }, DeviceAddress::Tcp(addr)) => {
                host.parse::<IpAddr>().ok() == Some(addr.ip()) && *port == addr.port()
            }
            _ => false,
        }
    }
}

impl From<&Device> for DeviceSelector {
    fn from(device: &Device) -> Self {
        match device.address() {
            DeviceAddress::Tcp(addr) => DeviceSelector::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            #[cfg(feature = "usb")]
            DeviceAddress::Usb(_) => DeviceSelector::Usb {
                serial: device.serial(),
            },
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Usb { serial: None } => write!(f, "usb"),
            DeviceSelector::Usb { serial: Some(serial) } => write!(f, "usb:{serial}"),
            DeviceSelector::Tcp { host, port } if host.contains(':') => write!(f, "tcp:[{host}]:{port}"),
            DeviceSelector::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}
