#![deny(unused_must_use)]

use jlprobe::commands::Capability;
use jlprobe::{Connection, Context, DeviceSelector, TransportConfig};

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let ctx = Context::new(TransportConfig::default());

    let selector = match std::env::args().nth(1) {
        Some(s) => DeviceSelector::try_from(s)?,
        None => DeviceSelector::Usb { serial: None },
    };

    if selector == (DeviceSelector::Usb { serial: None }) {
        for dev in ctx.list_devices()? {
            tracing::info!("found {}", dev);
        }
    }

    let dev = ctx.find(&selector)?;
    let mut handle = dev.open(&ctx)?;

    let caps = handle.get_caps()?;
    tracing::info!("caps {:?}", caps);

    if caps.contains(Capability::GetExtCaps) {
        let caps = handle.get_extended_caps()?;
        tracing::info!("ext caps {:?}", caps);
    }

    if caps.contains(Capability::Register) {
        let reg = handle.register(&Connection::local(std::process::id()))?;
        tracing::info!("registered with handle {}", reg.connection.handle);
        for conn in reg.others() {
            tracing::info!(
                "  other connection: handle {} pid {} host {} ({} ms)",
                conn.handle,
                conn.pid,
                conn.hid,
                conn.timestamp
            );
        }
        if let Some(info) = &reg.info {
            tracing::debug!("registration info {:02x?}", info);
        }

        let unreg = handle.unregister(&reg.connection)?;
        tracing::info!("unregistered, {} connections left", unreg.connections.len());
    }

    handle.close()?;
    ctx.exit();

    Ok(())
}
