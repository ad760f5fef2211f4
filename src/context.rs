use std::net::ToSocketAddrs;

use tracing::{debug, Span};

use crate::config::TransportConfig;
use crate::device::Device;
use crate::discovery::DeviceSelector;
use crate::error::{OpenError, Result};

/// Library context.
///
/// Holds the transport configuration every session opened through it uses, and the span all
/// log output of those sessions is recorded in. There is no global state: independent contexts
/// can coexist.
#[derive(Debug)]
pub struct Context {
    config: TransportConfig,
    span: Span,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Context {
    /// Creates a context.
    ///
    /// # Panics
    ///
    /// Panics if the buffer geometry in `config` is invalid, see [`TransportConfig`].
    pub fn new(config: TransportConfig) -> Self {
        config.validate();

        let span = tracing::info_span!("jaylink");
        span.in_scope(|| debug!("Context initialized with {:?}.", config));

        Self { config, span }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Tears the context down. Devices obtained from it stay valid, but can no longer be opened
    /// through it.
    pub fn exit(self) {
        self.span.in_scope(|| debug!("Context exited."));
    }

    /// Lists all J-Link devices connected via USB.
    #[cfg(feature = "usb")]
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let _enter = self.span.enter();
        Ok(crate::discovery::list_jlink_devices()?)
    }

    /// Resolves `selector` to exactly one device.
    ///
    /// A USB selector without serial number only succeeds if exactly one device is connected.
    pub fn find(&self, selector: &DeviceSelector) -> Result<Device> {
        let _enter = self.span.enter();
        debug!("Looking for device matching {}.", selector);

        match selector {
            DeviceSelector::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(OpenError::Connect)?
                    .next()
                    .ok_or(OpenError::NotFound)?;
                Ok(Device::tcp(addr, None))
            }
            DeviceSelector::Usb { .. } => self.find_usb(selector),
        }
    }

    #[cfg(feature = "usb")]
    fn find_usb(&self, selector: &DeviceSelector) -> Result<Device> {
        let mut matching = crate::discovery::list_jlink_devices()?
            .into_iter()
            .filter(|device| selector.matches(device));

        let device = matching.next().ok_or(OpenError::NotFound)?;
        if matching.next().is_some() {
            return Err(OpenError::Ambiguous.into());
        }
        Ok(device)
    }

    #[cfg(not(feature = "usb"))]
    fn find_usb(&self, _selector: &DeviceSelector) -> Result<Device> {
        Err(OpenError::Unsupported("USB").into())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::device::DeviceAddress;

    #[test]
    fn find_resolves_tcp_selector() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx = Context::default();
        let selector = DeviceSelector::try_from(format!("tcp:127.0.0.1:{}", addr.port())).unwrap();
        let device = ctx.find(&selector).unwrap();

        assert!(matches!(device.address(), DeviceAddress::Tcp(a) if *a == addr));
        assert_eq!(device.serial(), None);
        ctx.exit();
    }

    #[test]
    #[should_panic(expected = "at least one transfer attempt")]
    fn rejects_zero_retries() {
        Context::new(TransportConfig {
            max_timeouts: 0,
            ..Default::default()
        });
    }
}
