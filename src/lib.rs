//! An async BLE host stack over a byte-oriented HCI transport.
//!
//! The stack implements the host side of Bluetooth Low Energy above an
//! opaque controller transport: HCI command scheduling and ACL flow
//! control with L2CAP recombination, the attribute protocol state
//! machines, and a GATT server and client on top. Security keys, client
//! characteristic configuration and GATT discovery caches can be kept
//! across restarts with the filesystem [`store`].
//!
//! The [`Adapter`](host::Adapter) drives a [`Transport`]; everything else
//! hangs off the connections it produces.

#![allow(clippy::needless_lifetimes)]

mod fmt;

use att::AttErrorCode;
use types::{AddrKind, BdAddr};

pub mod att;
pub mod attribute;
mod attribute_server;
pub mod codec;
pub mod config;
pub mod connection;
mod connection_manager;
mod cursor;
pub mod dedup;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod scan;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod mock_transport;
#[cfg(test)]
mod tests;

pub mod prelude {
    //! Convenience include of most commonly used types.
    pub use super::att::AttErrorCode;
    pub use super::attribute::*;
    pub use super::connection::*;
    pub use super::gatt::client::GattClient;
    pub use super::gatt::{GattHandler, GattServer};
    pub use super::host::{Adapter, Runner};
    pub use super::scan::*;
    pub use super::store::Store;
    pub use super::types::uuid::Uuid;
    pub use super::types::{AddrKind, BdAddr, ConnHandle, DisconnectReason, Role, SecurityLevel};
    pub use super::{Address, BleHostError, Error, Transport};
}

/// The byte channel towards an HCI controller.
///
/// Each read and write moves exactly one complete HCI packet, including
/// the leading packet indicator byte (0x01 command, 0x02 ACL data,
/// 0x04 event).
pub trait Transport: embedded_io::ErrorType {
    /// Write one packet.
    async fn write(&self, packet: &[u8]) -> Result<(), Self::Error>;
    /// Read one packet into `buf`, returning the filled portion.
    async fn read<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], Self::Error>;
}

/// A BLE device address: kind byte plus 48-bit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// Address type.
    pub kind: AddrKind,
    /// Address value.
    pub addr: BdAddr,
}

impl Address {
    /// Create a public address.
    pub fn public(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(val),
        }
    }

    /// Create a random address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }

    /// Kind byte followed by the address, most significant byte first.
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0; 7];
        bytes[0] = self.kind.into_inner();
        let mut addr_bytes = self.addr.raw();
        addr_bytes.reverse();
        bytes[1..].copy_from_slice(&addr_bytes);
        bytes
    }

    /// Parse the `tt:aa:aa:aa:bb:bb:bb` form produced by [`core::fmt::Display`].
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; 7];
        let mut parts = s.split(':');
        for slot in bytes.iter_mut() {
            let part = parts.next().ok_or(Error::InvalidArgument)?;
            if part.len() != 2 {
                return Err(Error::InvalidArgument);
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidArgument)?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidArgument);
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[1..]);
        addr.reverse();
        Ok(Self {
            kind: AddrKind(bytes[0]),
            addr: BdAddr::new(addr),
        })
    }

    /// Whether this is a resolvable random address (top two bits of the
    /// most significant octet are 0b01).
    pub fn is_resolvable_random(&self) -> bool {
        self.kind == AddrKind::RANDOM && (self.addr.raw()[5] >> 6) == 0b01
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6]
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Address {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}

/// Errors returned by the host.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleHostError<E> {
    /// Error from the transport.
    Transport(E),
    /// Error from the host.
    BleHost(Error),
}

/// Errors related to the host.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Error encoding or decoding wire data.
    Codec(codec::Error),
    /// An HCI command failed with this status.
    Hci(types::Status),
    /// Error from the Attribute protocol.
    Att(AttErrorCode),
    /// A public API contract was violated by the caller.
    InvalidArgument,
    /// Insufficient space in the buffer.
    InsufficientSpace,
    /// Invalid value.
    InvalidValue,
    /// Resource not found.
    NotFound,
    /// Invalid state.
    InvalidState,
    /// Unsupported operation.
    NotSupported,
    /// Operation timed out.
    Timeout,
    /// Connection is disconnected.
    Disconnected,
    /// Connection limit has been reached.
    ConnectionLimitReached,
    /// The controller reported a hardware error and needs a reset.
    HardwareError(u8),
    /// A reliable write session was aborted because a prepare write echo
    /// did not match what was sent.
    ReliableWriteAborted,
    /// Another procedure of the same kind is already running.
    Busy,
    /// Other error.
    Other,
}

impl<E> From<Error> for BleHostError<E> {
    fn from(value: Error) -> Self {
        Self::BleHost(value)
    }
}

impl From<AttErrorCode> for Error {
    fn from(error: AttErrorCode) -> Self {
        Self::Att(error)
    }
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}

impl<E> From<codec::Error> for BleHostError<E> {
    fn from(error: codec::Error) -> Self {
        Self::BleHost(Error::Codec(error))
    }
}

impl<E> From<AttErrorCode> for BleHostError<E> {
    fn from(error: AttErrorCode) -> Self {
        Self::BleHost(Error::Att(error))
    }
}

impl From<types::Status> for Error {
    fn from(status: types::Status) -> Self {
        Self::Hci(status)
    }
}
