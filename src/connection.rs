//! Connection registration.
//!
//! Probes keep a small table of the clients currently talking to them. Registering adds the
//! caller to that table and hands out a handle; both registering and unregistering return the
//! whole table as the device sees it plus an optional informational payload.

use std::net::Ipv4Addr;

use scroll::{Pread, Pwrite, BE, LE};
use tracing::{debug, error};

use crate::backend::Backend;
use crate::error::{ProtocolError, Result};
use crate::transport::Transport;

/// Maximum number of connections that can be registered on a device.
pub const MAX_CONNECTIONS: usize = 16;

const CMD_REGISTER: u8 = 0x09;
const REG_CMD_REGISTER: u8 = 0x64;
const REG_CMD_UNREGISTER: u8 = 0x65;

const REG_REQUEST_SIZE: usize = 14;
const REG_HEADER_SIZE: usize = 8;
/// Size of the first part of every response.
const REG_MIN_SIZE: usize = 0x4c;
const REG_MAX_SIZE: usize = 0x200;
const REG_CONN_INFO_SIZE: usize = 16;

/// A client connection as recorded by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Handle assigned by the device, 0 for a connection that isn't registered yet.
    pub handle: u16,
    /// Identification of the client process, usually its PID.
    pub pid: u32,
    /// IP address of the client.
    pub hid: Ipv4Addr,
    pub iid: u8,
    pub cid: u8,
    /// Time of the last registration in milliseconds since the device powered up.
    pub timestamp: u32,
}

impl Connection {
    /// A not-yet-registered connection for a client on this host.
    pub fn local(pid: u32) -> Self {
        Self {
            handle: 0,
            pid,
            hid: Ipv4Addr::UNSPECIFIED,
            iid: 0,
            cid: 0,
            timestamp: 0,
        }
    }

    fn parse(entry: &[u8]) -> std::result::Result<Self, scroll::Error> {
        Ok(Self {
            pid: entry.pread_with(0, LE)?,
            // Network byte order.
            hid: Ipv4Addr::from(entry.pread_with::<u32>(4, BE)?),
            iid: entry.pread(8)?,
            cid: entry.pread(9)?,
            handle: entry.pread_with(10, LE)?,
            timestamp: entry.pread_with(12, LE)?,
        })
    }
}

/// Result of [`register`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    /// The caller's connection with the handle (and, when listed, timestamp) the device assigned.
    pub connection: Connection,
    /// All connections the device currently has registered.
    pub connections: Vec<Connection>,
    pub info: Option<Vec<u8>>,
}

impl Registration {
    /// Connections registered by other clients.
    pub fn others(&self) -> impl Iterator<Item = &Connection> {
        let own = self.connection.handle;
        self.connections.iter().filter(move |c| c.handle != own)
    }
}

/// Result of [`unregister`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unregistration {
    /// Connections that remain registered.
    pub connections: Vec<Connection>,
    pub info: Option<Vec<u8>>,
}

struct Response {
    handle: u16,
    connections: Vec<Connection>,
    info: Option<Vec<u8>>,
}

/// Registers `connection` on the device.
#[tracing::instrument(skip(transport))]
pub fn register<B: Backend>(transport: &mut Transport<B>, connection: &Connection) -> Result<Registration> {
    let response = exchange(transport, REG_CMD_REGISTER, connection)?;

    if response.handle == 0 {
        error!("Obtained invalid connection handle.");
        return Err(ProtocolError::InvalidHandle.into());
    }

    let mut connection = Connection {
        handle: response.handle,
        ..*connection
    };
    if let Some(own) = response.connections.iter().find(|c| c.handle == response.handle) {
        connection.timestamp = own.timestamp;
    }

    debug!(
        "Registered with handle {} ({} connections active).",
        connection.handle,
        response.connections.len()
    );

    Ok(Registration {
        connection,
        connections: response.connections,
        info: response.info,
    })
}

/// Unregisters `connection` from the device.
#[tracing::instrument(skip(transport))]
pub fn unregister<B: Backend>(transport: &mut Transport<B>, connection: &Connection) -> Result<Unregistration> {
    let response = exchange(transport, REG_CMD_UNREGISTER, connection)?;

    debug!(
        "Unregistered handle {} ({} connections active).",
        connection.handle,
        response.connections.len()
    );

    Ok(Unregistration {
        connections: response.connections,
        info: response.info,
    })
}

fn exchange<B: Backend>(transport: &mut Transport<B>, command: u8, connection: &Connection) -> Result<Response> {
    let mut request = [0u8; REG_REQUEST_SIZE];
    request[0] = CMD_REGISTER;
    request[1] = command;
    request.pwrite_with(connection.pid, 2, LE)?;
    request.pwrite_with(u32::from(connection.hid), 6, BE)?;
    request[10] = connection.iid;
    request[11] = connection.cid;
    request.pwrite_with(connection.handle, 12, LE)?;

    transport.start_write_read(REG_REQUEST_SIZE, REG_MIN_SIZE)?;
    transport.write(&request)?;

    let mut buf = vec![0u8; REG_MIN_SIZE];
    transport.read(&mut buf)?;

    let handle: u16 = buf.pread_with(0, LE)?;
    let num: u16 = buf.pread_with(2, LE)?;
    let entry_size: u16 = buf.pread_with(4, LE)?;
    let info_size: u16 = buf.pread_with(6, LE)?;
    let (num, entry_size, info_size) = (num as usize, entry_size as usize, info_size as usize);

    if num > MAX_CONNECTIONS {
        error!("Maximum number of device connections exceeded: {}.", num);
        return Err(ProtocolError::TooManyConnections(num).into());
    }

    if entry_size != REG_CONN_INFO_SIZE {
        error!("Invalid connection entry size: {} bytes.", entry_size);
        return Err(ProtocolError::InvalidEntrySize(entry_size).into());
    }

    let table_size = num * entry_size;
    let size = REG_HEADER_SIZE + table_size + info_size;

    if size > REG_MAX_SIZE {
        error!("Maximum registration information size exceeded: {} bytes.", size);
        return Err(ProtocolError::ResponseTooLarge(size).into());
    }

    if size > REG_MIN_SIZE {
        transport.start_read(size - REG_MIN_SIZE)?;
        buf.resize(size, 0);
        transport.read(&mut buf[REG_MIN_SIZE..])?;
    }

    let table = &buf[REG_HEADER_SIZE..][..table_size];
    let connections = table
        .chunks_exact(entry_size)
        .map(Connection::parse)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let info = (info_size > 0).then(|| buf[REG_HEADER_SIZE + table_size..][..info_size].to_vec());

    Ok(Response {
        handle,
        connections,
        info,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::mock::{MockBackend, Reply};
    use crate::config::{OverrunPolicy, TransportConfig};
    use crate::error::{Error, ErrorKind};

    fn entry(c: &Connection) -> Vec<u8> {
        let mut e = vec![0u8; REG_CONN_INFO_SIZE];
        e.pwrite_with(c.pid, 0, LE).unwrap();
        e.pwrite_with(u32::from(c.hid), 4, BE).unwrap();
        e[8] = c.iid;
        e[9] = c.cid;
        e.pwrite_with(c.handle, 10, LE).unwrap();
        e.pwrite_with(c.timestamp, 12, LE).unwrap();
        e
    }

    /// Builds a device response, padded to the minimum size.
    fn response(handle: u16, table: &[Connection], info: &[u8]) -> Vec<u8> {
        let mut r = vec![0u8; REG_HEADER_SIZE];
        r.pwrite_with(handle, 0, LE).unwrap();
        r.pwrite_with(table.len() as u16, 2, LE).unwrap();
        r.pwrite_with(REG_CONN_INFO_SIZE as u16, 4, LE).unwrap();
        r.pwrite_with(info.len() as u16, 6, LE).unwrap();
        for c in table {
            r.extend(entry(c));
        }
        r.extend_from_slice(info);
        if r.len() < REG_MIN_SIZE {
            r.resize(REG_MIN_SIZE, 0);
        }
        r
    }

    fn other(handle: u16) -> Connection {
        Connection {
            handle,
            pid: 1000 + handle as u32,
            hid: Ipv4Addr::new(192, 168, 0, handle as u8),
            iid: 1,
            cid: 2,
            timestamp: 500 * handle as u32,
        }
    }

    /// Serves the first `REG_MIN_SIZE` bytes, then the tail, like the device does.
    fn device(reply: Vec<u8>) -> MockBackend {
        let (head, tail) = reply.split_at(REG_MIN_SIZE);
        let mut backend = MockBackend::new(vec![Reply::Data(head.to_vec())]);
        if !tail.is_empty() {
            backend.push(Reply::Data(tail.to_vec()));
        }
        backend
    }

    #[test]
    fn register_returns_assigned_handle() {
        let me = Connection {
            pid: 4242,
            ..Connection::local(0)
        };
        let assigned = Connection {
            handle: 7,
            timestamp: 1234,
            ..me
        };
        let table = [other(3), assigned];
        let mut t = Transport::new(device(response(7, &table, &[])), &TransportConfig::default()).unwrap();

        let reg = register(&mut t, &me).unwrap();

        assert_eq!(reg.connection, assigned);
        assert_eq!(reg.connections, table);
        assert_eq!(reg.others().copied().collect::<Vec<_>>(), [other(3)]);
        assert_eq!(reg.info, None);

        let sent = t.backend().sent_bytes();
        assert_eq!(sent.len(), REG_REQUEST_SIZE);
        assert_eq!(&sent[..2], &[CMD_REGISTER, REG_CMD_REGISTER]);
        assert_eq!(&sent[2..6], &4242u32.to_le_bytes());
    }

    #[test]
    fn large_table_is_read_in_two_operations() {
        let table: Vec<_> = (1..=6).map(other).collect();
        let info = b"J-Link remote server".to_vec();
        let reply = response(2, &table, &info);
        assert!(reply.len() > REG_MIN_SIZE);

        let mut t = Transport::new(device(reply), &TransportConfig::default()).unwrap();
        let reg = register(&mut t, &Connection::local(1)).unwrap();

        assert_eq!(reg.connection.handle, 2);
        assert_eq!(reg.connection.timestamp, 1000);
        assert_eq!(reg.connections, table);
        assert_eq!(reg.info, Some(info));
        assert_eq!(t.backend().receive_calls(), 2);
    }

    #[test]
    fn single_transfer_response_with_retained_overrun() {
        let table: Vec<_> = (1..=6).map(other).collect();
        let config = TransportConfig {
            overrun: OverrunPolicy::Retain,
            ..Default::default()
        };
        let mut t = Transport::new(
            MockBackend::new(vec![Reply::Data(response(4, &table, &[]))]),
            &config,
        )
        .unwrap();

        let reg = register(&mut t, &Connection::local(1)).unwrap();
        assert_eq!(reg.connections, table);
        assert_eq!(t.backend().receive_calls(), 1);
    }

    #[test]
    fn too_many_connections() {
        let mut reply = response(1, &[], &[]);
        reply.pwrite_with(17u16, 2, LE).unwrap();
        let mut t = Transport::new(device(reply), &TransportConfig::default()).unwrap();

        let err = register(&mut t, &Connection::local(1)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::TooManyConnections(17))));
    }

    #[test]
    fn invalid_entry_size() {
        let mut reply = response(1, &[], &[]);
        reply.pwrite_with(12u16, 4, LE).unwrap();
        let mut t = Transport::new(device(reply), &TransportConfig::default()).unwrap();

        let err = register(&mut t, &Connection::local(1)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidEntrySize(12))));
    }

    #[test]
    fn oversized_info() {
        let mut reply = response(1, &[], &[]);
        reply.pwrite_with(600u16, 6, LE).unwrap();
        let mut t = Transport::new(device(reply), &TransportConfig::default()).unwrap();

        let err = register(&mut t, &Connection::local(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn zero_handle_is_rejected() {
        let mut t = Transport::new(device(response(0, &[], &[])), &TransportConfig::default()).unwrap();

        let err = register(&mut t, &Connection::local(1)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidHandle)));
    }

    #[test]
    fn unregister_returns_remaining_table() {
        let me = Connection {
            handle: 9,
            hid: Ipv4Addr::new(10, 0, 0, 1),
            ..Connection::local(77)
        };
        let table = [other(3)];
        let mut t = Transport::new(device(response(0, &table, &[0xab])), &TransportConfig::default()).unwrap();

        let unreg = unregister(&mut t, &me).unwrap();
        assert_eq!(unreg.connections, table);
        assert_eq!(unreg.info, Some(vec![0xab]));

        let sent = t.backend().sent_bytes();
        assert_eq!(sent[1], REG_CMD_UNREGISTER);
        assert_eq!(&sent[6..10], &[10, 0, 0, 1]);
        assert_eq!(&sent[12..14], &9u16.to_le_bytes());
    }
}
