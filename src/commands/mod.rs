//! Device commands built on the transport primitives.

mod caps;
mod fine;

pub use caps::{get_caps, get_extended_caps, Capabilities, Capability, DEV_CAPS_SIZE, DEV_EXT_CAPS_SIZE};
pub use fine::{fine_io, FineIo};
