//! HCI wire framing: packet types, opcodes, events and ACL headers.

use crate::codec::{Decode, Encode, Error as CodecError, Type};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::types::{AddrKind, BdAddr, ConnHandle, Status};

/// Packet indicator bytes in front of every transport packet.
pub(crate) const HCI_PACKET_COMMAND: u8 = 0x01;
pub(crate) const HCI_PACKET_ACL_DATA: u8 = 0x02;
pub(crate) const HCI_PACKET_EVENT: u8 = 0x04;

pub(crate) const HCI_COMMAND_HDR: usize = 4;
pub(crate) const HCI_ACL_HDR: usize = 5;
pub(crate) const HCI_MAX_EVENT_PARAMS: usize = 255;

// Opcode group fields.
#[derive(Clone, Copy)]
#[repr(u16)]
enum OpcodeGroup {
    LinkControl = 0x01,
    HciControl = 0x03,
    InfoParams = 0x04,
    StatusParams = 0x05,
    Le = 0x08,
}

impl OpcodeGroup {
    const fn ocf(self, ocf: u16) -> u16 {
        (self as u16) << 10 | ocf
    }
}

/// A 16-bit HCI command opcode (OGF << 10 | OCF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Opcode(pub u16);

impl Opcode {
    pub const DISCONNECT: Opcode = Opcode(OpcodeGroup::LinkControl.ocf(0x0006));
    pub const READ_REMOTE_VERSION: Opcode = Opcode(OpcodeGroup::LinkControl.ocf(0x001D));

    pub const SET_EVENT_MASK: Opcode = Opcode(OpcodeGroup::HciControl.ocf(0x0001));
    pub const RESET: Opcode = Opcode(OpcodeGroup::HciControl.ocf(0x0003));

    pub const READ_LOCAL_VERSION: Opcode = Opcode(OpcodeGroup::InfoParams.ocf(0x0001));
    pub const READ_BUFFER_SIZE: Opcode = Opcode(OpcodeGroup::InfoParams.ocf(0x0005));
    pub const READ_BD_ADDR: Opcode = Opcode(OpcodeGroup::InfoParams.ocf(0x0009));

    pub const READ_RSSI: Opcode = Opcode(OpcodeGroup::StatusParams.ocf(0x0005));

    pub const LE_SET_EVENT_MASK: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0001));
    pub const LE_READ_BUFFER_SIZE: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0002));
    pub const LE_SET_RANDOM_ADDRESS: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0005));
    pub const LE_SET_ADV_PARAMS: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0006));
    pub const LE_SET_ADV_DATA: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0008));
    pub const LE_SET_SCAN_RESPONSE_DATA: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0009));
    pub const LE_SET_ADV_ENABLE: Opcode = Opcode(OpcodeGroup::Le.ocf(0x000A));
    pub const LE_SET_SCAN_PARAMS: Opcode = Opcode(OpcodeGroup::Le.ocf(0x000B));
    pub const LE_SET_SCAN_ENABLE: Opcode = Opcode(OpcodeGroup::Le.ocf(0x000C));
    pub const LE_CREATE_CONN: Opcode = Opcode(OpcodeGroup::Le.ocf(0x000D));
    pub const LE_CREATE_CONN_CANCEL: Opcode = Opcode(OpcodeGroup::Le.ocf(0x000E));
    pub const LE_CONN_UPDATE: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0013));
    pub const LE_READ_REMOTE_FEATURES: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0016));
    pub const LE_START_ENCRYPTION: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0019));
    pub const LE_LTK_REQUEST_REPLY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x001A));
    pub const LE_LTK_REQUEST_NEGATIVE_REPLY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x001B));
    pub const LE_READ_LOCAL_P256_PUBLIC_KEY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0025));
    pub const LE_GENERATE_DHKEY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0026));
    pub const LE_SET_DATA_LENGTH: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0022));
    pub const LE_READ_PHY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0030));
    pub const LE_SET_PHY: Opcode = Opcode(OpcodeGroup::Le.ocf(0x0032));
}

// Event codes.
pub(crate) const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub(crate) const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub(crate) const EVT_READ_REMOTE_VERSION_COMPLETE: u8 = 0x0C;
pub(crate) const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub(crate) const EVT_COMMAND_STATUS: u8 = 0x0F;
pub(crate) const EVT_HARDWARE_ERROR: u8 = 0x10;
pub(crate) const EVT_NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
pub(crate) const EVT_ENCRYPTION_KEY_REFRESH_COMPLETE: u8 = 0x30;
pub(crate) const EVT_LE_META: u8 = 0x3E;

// LE meta subevent codes.
pub(crate) const LE_CONNECTION_COMPLETE: u8 = 0x01;
pub(crate) const LE_ADVERTISING_REPORT: u8 = 0x02;
pub(crate) const LE_CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
pub(crate) const LE_READ_REMOTE_FEATURES_COMPLETE: u8 = 0x04;
pub(crate) const LE_LONG_TERM_KEY_REQUEST: u8 = 0x05;
pub(crate) const LE_READ_LOCAL_P256_PUBLIC_KEY_COMPLETE: u8 = 0x08;
pub(crate) const LE_GENERATE_DHKEY_COMPLETE: u8 = 0x09;
pub(crate) const LE_ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;
pub(crate) const LE_PHY_UPDATE_COMPLETE: u8 = 0x0C;
pub(crate) const LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;

/// ACL packet boundary flag, bits 12..14 of the handle field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AclBoundary {
    FirstNonFlushable,
    Continuing,
    FirstFlushable,
    Complete,
}

impl AclBoundary {
    fn to_bits(self) -> u16 {
        match self {
            Self::FirstNonFlushable => 0b00,
            Self::Continuing => 0b01,
            Self::FirstFlushable => 0b10,
            Self::Complete => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::FirstNonFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }

    /// Whether this flag starts a new L2CAP PDU.
    pub fn is_first(&self) -> bool {
        !matches!(self, Self::Continuing)
    }
}

/// Header of an ACL data packet (after the packet indicator byte).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AclHeader {
    pub handle: ConnHandle,
    pub boundary: AclBoundary,
    pub length: u16,
}

impl AclHeader {
    pub(crate) fn encode_packet(&self, payload: &[u8], dest: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(HCI_PACKET_ACL_DATA)?;
        w.write(self.handle.raw() | (self.boundary.to_bits() << 12))?;
        w.write(payload.len() as u16)?;
        w.append(payload)?;
        Ok(w.len())
    }

    /// Decode the header of an ACL packet body (packet indicator already
    /// consumed). Returns the header and the payload.
    pub(crate) fn decode_packet(data: &[u8]) -> Result<(AclHeader, &[u8]), CodecError> {
        let mut r = ReadCursor::new(data);
        let handle_flags: u16 = r.read()?;
        let length: u16 = r.read()?;
        let payload = r.remaining();
        if payload.len() != length as usize {
            return Err(CodecError::InvalidValue);
        }
        Ok((
            AclHeader {
                handle: ConnHandle::new(handle_flags),
                boundary: AclBoundary::from_bits(handle_flags >> 12),
                length,
            },
            payload,
        ))
    }
}

/// A parsed HCI event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<'d> {
    CommandComplete {
        num_hci_cmd_pkts: u8,
        opcode: Opcode,
        /// Return parameters, starting with the status byte.
        params: &'d [u8],
    },
    CommandStatus {
        status: Status,
        num_hci_cmd_pkts: u8,
        opcode: Opcode,
    },
    DisconnectionComplete {
        status: Status,
        handle: ConnHandle,
        reason: u8,
    },
    EncryptionChange {
        status: Status,
        handle: ConnHandle,
        enabled: bool,
    },
    EncryptionKeyRefreshComplete {
        status: Status,
        handle: ConnHandle,
    },
    ReadRemoteVersionComplete {
        status: Status,
        handle: ConnHandle,
        version: u8,
        manufacturer: u16,
        subversion: u16,
    },
    HardwareError {
        code: u8,
    },
    NumberOfCompletedPackets {
        it: CompletedPacketsIter<'d>,
    },
    Le(LeEvent<'d>),
    Unknown {
        code: u8,
        params: &'d [u8],
    },
}

/// A parsed LE meta subevent.
#[derive(Debug, Clone, PartialEq)]
pub enum LeEvent<'d> {
    ConnectionComplete(LeConnectionComplete),
    AdvertisingReport {
        num_reports: u8,
        data: &'d [u8],
    },
    ConnectionUpdateComplete {
        status: Status,
        handle: ConnHandle,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    ReadRemoteFeaturesComplete {
        status: Status,
        handle: ConnHandle,
        features: u64,
    },
    LongTermKeyRequest {
        handle: ConnHandle,
        rand: u64,
        ediv: u16,
    },
    ReadLocalP256PublicKeyComplete {
        status: Status,
        key: &'d [u8],
    },
    GenerateDhKeyComplete {
        status: Status,
        key: &'d [u8],
    },
    PhyUpdateComplete {
        status: Status,
        handle: ConnHandle,
        tx_phy: u8,
        rx_phy: u8,
    },
    ExtendedAdvertisingReport {
        num_reports: u8,
        data: &'d [u8],
    },
    Unknown {
        subevent: u8,
        params: &'d [u8],
    },
}

/// Parameters shared by the legacy and enhanced connection complete
/// subevents.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeConnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub role: u8,
    pub peer_addr_kind: AddrKind,
    pub peer_addr: BdAddr,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl<'d> Event<'d> {
    /// Decode an event packet body (packet indicator already consumed).
    pub fn decode(data: &'d [u8]) -> Result<Event<'d>, CodecError> {
        let mut r = ReadCursor::new(data);
        let code: u8 = r.read()?;
        let len: u8 = r.read()?;
        let params = r.remaining();
        if params.len() != len as usize {
            return Err(CodecError::InvalidValue);
        }
        let mut r = ReadCursor::new(params);
        match code {
            EVT_COMMAND_COMPLETE => {
                let num_hci_cmd_pkts: u8 = r.read()?;
                let opcode: u16 = r.read()?;
                Ok(Event::CommandComplete {
                    num_hci_cmd_pkts,
                    opcode: Opcode(opcode),
                    params: r.remaining(),
                })
            }
            EVT_COMMAND_STATUS => {
                let status: Status = r.read()?;
                let num_hci_cmd_pkts: u8 = r.read()?;
                let opcode: u16 = r.read()?;
                Ok(Event::CommandStatus {
                    status,
                    num_hci_cmd_pkts,
                    opcode: Opcode(opcode),
                })
            }
            EVT_DISCONNECTION_COMPLETE => Ok(Event::DisconnectionComplete {
                status: r.read()?,
                handle: r.read()?,
                reason: r.read()?,
            }),
            EVT_ENCRYPTION_CHANGE => Ok(Event::EncryptionChange {
                status: r.read()?,
                handle: r.read()?,
                enabled: r.read::<u8>()? != 0,
            }),
            EVT_ENCRYPTION_KEY_REFRESH_COMPLETE => Ok(Event::EncryptionKeyRefreshComplete {
                status: r.read()?,
                handle: r.read()?,
            }),
            EVT_READ_REMOTE_VERSION_COMPLETE => Ok(Event::ReadRemoteVersionComplete {
                status: r.read()?,
                handle: r.read()?,
                version: r.read()?,
                manufacturer: r.read()?,
                subversion: r.read()?,
            }),
            EVT_HARDWARE_ERROR => Ok(Event::HardwareError { code: r.read()? }),
            EVT_NUMBER_OF_COMPLETED_PACKETS => {
                let count: u8 = r.read()?;
                let rest = r.remaining();
                if rest.len() != count as usize * 4 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Event::NumberOfCompletedPackets {
                    it: CompletedPacketsIter { data: rest },
                })
            }
            EVT_LE_META => Ok(Event::Le(LeEvent::decode(params)?)),
            _ => Ok(Event::Unknown { code, params }),
        }
    }
}

impl<'d> LeEvent<'d> {
    fn decode(params: &'d [u8]) -> Result<LeEvent<'d>, CodecError> {
        let mut r = ReadCursor::new(params);
        let subevent: u8 = r.read()?;
        match subevent {
            LE_CONNECTION_COMPLETE => Ok(LeEvent::ConnectionComplete(Self::conn_complete(&mut r)?)),
            LE_ENHANCED_CONNECTION_COMPLETE => {
                // Same prefix as the legacy event with the local and peer
                // resolvable addresses spliced in before the interval.
                let status: Status = r.read()?;
                let handle: ConnHandle = r.read()?;
                let role: u8 = r.read()?;
                let peer_addr_kind = AddrKind(r.read::<u8>()?);
                let peer_addr: BdAddr = r.read()?;
                r.skip(12)?;
                Ok(LeEvent::ConnectionComplete(LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer_addr_kind,
                    peer_addr,
                    interval: r.read()?,
                    latency: r.read()?,
                    supervision_timeout: r.read()?,
                }))
            }
            LE_ADVERTISING_REPORT => {
                let num_reports: u8 = r.read()?;
                Ok(LeEvent::AdvertisingReport {
                    num_reports,
                    data: r.remaining(),
                })
            }
            LE_EXTENDED_ADVERTISING_REPORT => {
                let num_reports: u8 = r.read()?;
                Ok(LeEvent::ExtendedAdvertisingReport {
                    num_reports,
                    data: r.remaining(),
                })
            }
            LE_CONNECTION_UPDATE_COMPLETE => Ok(LeEvent::ConnectionUpdateComplete {
                status: r.read()?,
                handle: r.read()?,
                interval: r.read()?,
                latency: r.read()?,
                supervision_timeout: r.read()?,
            }),
            LE_READ_REMOTE_FEATURES_COMPLETE => Ok(LeEvent::ReadRemoteFeaturesComplete {
                status: r.read()?,
                handle: r.read()?,
                features: r.read()?,
            }),
            LE_LONG_TERM_KEY_REQUEST => Ok(LeEvent::LongTermKeyRequest {
                handle: r.read()?,
                rand: r.read()?,
                ediv: r.read()?,
            }),
            LE_READ_LOCAL_P256_PUBLIC_KEY_COMPLETE => Ok(LeEvent::ReadLocalP256PublicKeyComplete {
                status: r.read()?,
                key: r.remaining(),
            }),
            LE_GENERATE_DHKEY_COMPLETE => Ok(LeEvent::GenerateDhKeyComplete {
                status: r.read()?,
                key: r.remaining(),
            }),
            LE_PHY_UPDATE_COMPLETE => Ok(LeEvent::PhyUpdateComplete {
                status: r.read()?,
                handle: r.read()?,
                tx_phy: r.read()?,
                rx_phy: r.read()?,
            }),
            _ => Ok(LeEvent::Unknown {
                subevent,
                params: r.remaining(),
            }),
        }
    }

    fn conn_complete(r: &mut ReadCursor<'d>) -> Result<LeConnectionComplete, CodecError> {
        Ok(LeConnectionComplete {
            status: r.read()?,
            handle: r.read()?,
            role: r.read()?,
            peer_addr_kind: AddrKind(r.read::<u8>()?),
            peer_addr: r.read()?,
            interval: r.read()?,
            latency: r.read()?,
            supervision_timeout: r.read()?,
        })
    }
}

/// Yields `(handle, completed)` pairs of a Number Of Completed Packets
/// event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPacketsIter<'d> {
    data: &'d [u8],
}

impl<'d> CompletedPacketsIter<'d> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(ConnHandle, u16)> {
        if self.data.len() < 4 {
            return None;
        }
        let (entry, rest) = self.data.split_at(4);
        self.data = rest;
        Some((
            ConnHandle::new(u16::from_le_bytes([entry[0], entry[1]])),
            u16::from_le_bytes([entry[2], entry[3]]),
        ))
    }
}

/// Connection parameters for LE Create Connection and Connection Update.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// Connection interval range, 1.25 ms units.
    pub interval_min: u16,
    pub interval_max: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout, 10 ms units.
    pub supervision_timeout: u16,
    /// Connection event length range, 0.625 ms units.
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            interval_min: 0x0018,
            interval_max: 0x0028,
            latency: 0,
            supervision_timeout: 0x00C8,
            min_ce_length: 0,
            max_ce_length: 0,
        }
    }
}

impl Type for ConnParams {
    fn size(&self) -> usize {
        12
    }
}

impl Encode for ConnParams {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.interval_min)?;
        w.write(self.interval_max)?;
        w.write(self.latency)?;
        w.write(self.supervision_timeout)?;
        w.write(self.min_ce_length)?;
        w.write(self.max_ce_length)?;
        Ok(())
    }
}

/// Advertising parameters for LE Set Advertising Parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvParams {
    /// Advertising interval range, 0.625 ms units.
    pub interval_min: u16,
    pub interval_max: u16,
    /// ADV_IND, ADV_DIRECT_IND, ...
    pub kind: u8,
    pub own_addr_kind: AddrKind,
    pub peer_addr_kind: AddrKind,
    pub peer_addr: BdAddr,
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            interval_min: 0x0100,
            interval_max: 0x0100,
            kind: 0,
            own_addr_kind: AddrKind::PUBLIC,
            peer_addr_kind: AddrKind::PUBLIC,
            peer_addr: BdAddr::default(),
            channel_map: 0x07,
            filter_policy: 0,
        }
    }
}

impl Type for AdvParams {
    fn size(&self) -> usize {
        15
    }
}

impl Encode for AdvParams {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.interval_min)?;
        w.write(self.interval_max)?;
        w.write(self.kind)?;
        w.write(self.own_addr_kind.into_inner())?;
        w.write(self.peer_addr_kind.into_inner())?;
        w.write_ref(&self.peer_addr)?;
        w.write(self.channel_map)?;
        w.write(self.filter_policy)?;
        Ok(())
    }
}

/// Scan parameters for LE Set Scan Parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    pub active: bool,
    /// Scan interval and window, 0.625 ms units.
    pub interval: u16,
    pub window: u16,
    pub own_addr_kind: AddrKind,
    pub filter_policy: u8,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: false,
            interval: 0x0010,
            window: 0x0010,
            own_addr_kind: AddrKind::PUBLIC,
            filter_policy: 0,
        }
    }
}

impl Type for ScanParams {
    fn size(&self) -> usize {
        7
    }
}

impl Encode for ScanParams {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.active as u8)?;
        w.write(self.interval)?;
        w.write(self.window)?;
        w.write(self.own_addr_kind.into_inner())?;
        w.write(self.filter_policy)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_header_round_trip() {
        let hdr = AclHeader {
            handle: ConnHandle::new(0x0042),
            boundary: AclBoundary::Continuing,
            length: 3,
        };
        let mut buf = [0u8; 16];
        let len = hdr.encode_packet(&[1, 2, 3], &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x02, 0x42, 0x10, 0x03, 0x00, 1, 2, 3]);

        let (decoded, payload) = AclHeader::decode_packet(&buf[1..len]).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn command_complete_decodes_opcode_and_params() {
        // num=1, opcode=Reset, status=0
        let body = [EVT_COMMAND_COMPLETE, 4, 1, 0x03, 0x0C, 0x00];
        match Event::decode(&body[..]).unwrap() {
            Event::CommandComplete {
                num_hci_cmd_pkts,
                opcode,
                params,
            } => {
                assert_eq!(num_hci_cmd_pkts, 1);
                assert_eq!(opcode, Opcode::RESET);
                assert_eq!(params, &[0x00]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn number_of_completed_packets_iterates() {
        let body = [EVT_NUMBER_OF_COMPLETED_PACKETS, 9, 2, 0x01, 0x00, 2, 0, 0x02, 0x00, 1, 0];
        match Event::decode(&body[..]).unwrap() {
            Event::NumberOfCompletedPackets { mut it } => {
                assert_eq!(it.next(), Some((ConnHandle::new(1), 2)));
                assert_eq!(it.next(), Some((ConnHandle::new(2), 1)));
                assert_eq!(it.next(), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_event_is_rejected() {
        assert!(Event::decode(&[EVT_DISCONNECTION_COMPLETE, 9, 0]).is_err());
    }
}
