use std::fmt;

use bitvec::prelude::*;
use tracing::debug;

use crate::backend::Backend;
use crate::error::Result;
use crate::transport::Transport;

const CMD_GET_CAPS: u8 = 0xe8;
const CMD_GET_EXT_CAPS: u8 = 0xed;

/// Size of the device capabilities in bytes.
pub const DEV_CAPS_SIZE: usize = 4;

/// Size of the extended device capabilities in bytes.
pub const DEV_EXT_CAPS_SIZE: usize = 32;

/// Device capabilities.
///
/// The numbers are bit positions in the capability bitfield.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
    GetHwVersion = 1,
    AdaptiveClocking = 3,
    ReadConfig = 4,
    WriteConfig = 5,
    GetFreeMemory = 11,
    SetTargetPower = 13,
    SelectTif = 17,
    Swo = 23,
    Register = 27,
    /// The device supports [`get_extended_caps`].
    GetExtCaps = 31,
}

impl Capability {
    const ALL: [Capability; 10] = [
        Capability::GetHwVersion,
        Capability::AdaptiveClocking,
        Capability::ReadConfig,
        Capability::WriteConfig,
        Capability::GetFreeMemory,
        Capability::SetTargetPower,
        Capability::SelectTif,
        Capability::Swo,
        Capability::Register,
        Capability::GetExtCaps,
    ];
}

/// A set of capabilities advertised by a device.
///
/// Holds the extended capability bitfield; the legacy one covers its first 32 bits.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    bits: BitArray<[u8; DEV_EXT_CAPS_SIZE], Lsb0>,
}

impl Capabilities {
    /// Creates a `Capabilities` instance from the raw bitfield, shorter fields are zero-extended.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut bytes = [0u8; DEV_EXT_CAPS_SIZE];
        let n = raw.len().min(DEV_EXT_CAPS_SIZE);
        bytes[..n].copy_from_slice(&raw[..n]);
        Self {
            bits: BitArray::new(bytes),
        }
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.bits[cap as usize]
    }

    /// Iterates over the known capabilities in the set.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|&cap| self.contains(cap))
    }

    pub fn to_raw(&self) -> [u8; DEV_EXT_CAPS_SIZE] {
        self.bits.into_inner()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Retrieves the capabilities of the device.
pub fn get_caps<B: Backend>(transport: &mut Transport<B>) -> Result<Capabilities> {
    transport.start_write_read(1, DEV_CAPS_SIZE)?;
    transport.write(&[CMD_GET_CAPS])?;

    let mut buf = [0u8; DEV_CAPS_SIZE];
    transport.read(&mut buf)?;

    let caps = Capabilities::from_raw(&buf);
    debug!("Device capabilities: {:?}", caps);
    Ok(caps)
}

/// Retrieves the extended capabilities of the device.
///
/// Only available if the device reports [`Capability::GetExtCaps`].
pub fn get_extended_caps<B: Backend>(transport: &mut Transport<B>) -> Result<Capabilities> {
    transport.start_write_read(1, DEV_EXT_CAPS_SIZE)?;
    transport.write(&[CMD_GET_EXT_CAPS])?;

    let mut buf = [0u8; DEV_EXT_CAPS_SIZE];
    transport.read(&mut buf)?;

    let caps = Capabilities::from_raw(&buf);
    debug!("Extended device capabilities: {:?}", caps);
    Ok(caps)
}
