//! Attribute protocol PDUs.

use crate::codec::{Decode, Encode, Error as CodecError, Type};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::types::uuid::Uuid;

pub(crate) const ATT_ERROR_RSP: u8 = 0x01;
pub(crate) const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub(crate) const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub(crate) const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub(crate) const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub(crate) const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub(crate) const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub(crate) const ATT_READ_REQ: u8 = 0x0A;
pub(crate) const ATT_READ_RSP: u8 = 0x0B;
pub(crate) const ATT_READ_BLOB_REQ: u8 = 0x0C;
pub(crate) const ATT_READ_BLOB_RSP: u8 = 0x0D;
pub(crate) const ATT_READ_MULTIPLE_REQ: u8 = 0x0E;
pub(crate) const ATT_READ_MULTIPLE_RSP: u8 = 0x0F;
pub(crate) const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub(crate) const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub(crate) const ATT_WRITE_REQ: u8 = 0x12;
pub(crate) const ATT_WRITE_RSP: u8 = 0x13;
pub(crate) const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub(crate) const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub(crate) const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub(crate) const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub(crate) const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub(crate) const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub(crate) const ATT_HANDLE_VALUE_CFM: u8 = 0x1E;
pub(crate) const ATT_WRITE_CMD: u8 = 0x52;
pub(crate) const ATT_SIGNED_WRITE_CMD: u8 = 0xD2;

/// ATT protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    DatabaseOutOfSync,
    ValueNotAllowed,
    /// Application error codes 0x80..=0x9F.
    Application(u8),
    WriteRequestRejected,
    CccdImproperlyConfigured,
    ProcedureAlreadyInProgress,
    OutOfRange,
    /// Reserved or profile-defined codes not otherwise named.
    Other(u8),
}

impl AttErrorCode {
    pub fn to_raw(self) -> u8 {
        match self {
            Self::InvalidHandle => 0x01,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InvalidPdu => 0x04,
            Self::InsufficientAuthentication => 0x05,
            Self::RequestNotSupported => 0x06,
            Self::InvalidOffset => 0x07,
            Self::InsufficientAuthorization => 0x08,
            Self::PrepareQueueFull => 0x09,
            Self::AttributeNotFound => 0x0A,
            Self::AttributeNotLong => 0x0B,
            Self::InsufficientEncryptionKeySize => 0x0C,
            Self::InvalidAttributeValueLength => 0x0D,
            Self::UnlikelyError => 0x0E,
            Self::InsufficientEncryption => 0x0F,
            Self::UnsupportedGroupType => 0x10,
            Self::InsufficientResources => 0x11,
            Self::DatabaseOutOfSync => 0x12,
            Self::ValueNotAllowed => 0x13,
            Self::Application(code) => code,
            Self::WriteRequestRejected => 0xFC,
            Self::CccdImproperlyConfigured => 0xFD,
            Self::ProcedureAlreadyInProgress => 0xFE,
            Self::OutOfRange => 0xFF,
            Self::Other(code) => code,
        }
    }

    /// Decode a received error code. Code zero is not a valid error and
    /// is substituted with [`AttErrorCode::UnlikelyError`].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::UnlikelyError,
            0x01 => Self::InvalidHandle,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x04 => Self::InvalidPdu,
            0x05 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x07 => Self::InvalidOffset,
            0x08 => Self::InsufficientAuthorization,
            0x09 => Self::PrepareQueueFull,
            0x0A => Self::AttributeNotFound,
            0x0B => Self::AttributeNotLong,
            0x0C => Self::InsufficientEncryptionKeySize,
            0x0D => Self::InvalidAttributeValueLength,
            0x0E => Self::UnlikelyError,
            0x0F => Self::InsufficientEncryption,
            0x10 => Self::UnsupportedGroupType,
            0x11 => Self::InsufficientResources,
            0x12 => Self::DatabaseOutOfSync,
            0x13 => Self::ValueNotAllowed,
            0x80..=0x9F => Self::Application(raw),
            0xFC => Self::WriteRequestRejected,
            0xFD => Self::CccdImproperlyConfigured,
            0xFE => Self::ProcedureAlreadyInProgress,
            0xFF => Self::OutOfRange,
            other => Self::Other(other),
        }
    }
}

/// An ATT request (or command) PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum AttReq<'d> {
    ExchangeMtu {
        mtu: u16,
    },
    FindInformation {
        start_handle: u16,
        end_handle: u16,
    },
    FindByTypeValue {
        start_handle: u16,
        end_handle: u16,
        att_type: u16,
        att_value: &'d [u8],
    },
    ReadByType {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    Read {
        handle: u16,
    },
    ReadBlob {
        handle: u16,
        offset: u16,
    },
    ReadMultiple {
        handles: &'d [u8],
    },
    ReadByGroupType {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    Write {
        handle: u16,
        data: &'d [u8],
    },
    WriteCmd {
        handle: u16,
        data: &'d [u8],
    },
    PrepareWrite {
        handle: u16,
        offset: u16,
        value: &'d [u8],
    },
    ExecuteWrite {
        flags: u8,
    },
    SignedWrite {
        handle: u16,
        data: &'d [u8],
    },
    Confirmation,
}

impl<'d> AttReq<'d> {
    /// Whether the opcode expects a response PDU.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Self::WriteCmd { .. } | Self::SignedWrite { .. } | Self::Confirmation
        )
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::ExchangeMtu { .. } => ATT_EXCHANGE_MTU_REQ,
            Self::FindInformation { .. } => ATT_FIND_INFORMATION_REQ,
            Self::FindByTypeValue { .. } => ATT_FIND_BY_TYPE_VALUE_REQ,
            Self::ReadByType { .. } => ATT_READ_BY_TYPE_REQ,
            Self::Read { .. } => ATT_READ_REQ,
            Self::ReadBlob { .. } => ATT_READ_BLOB_REQ,
            Self::ReadMultiple { .. } => ATT_READ_MULTIPLE_REQ,
            Self::ReadByGroupType { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            Self::Write { .. } => ATT_WRITE_REQ,
            Self::WriteCmd { .. } => ATT_WRITE_CMD,
            Self::PrepareWrite { .. } => ATT_PREPARE_WRITE_REQ,
            Self::ExecuteWrite { .. } => ATT_EXECUTE_WRITE_REQ,
            Self::SignedWrite { .. } => ATT_SIGNED_WRITE_CMD,
            Self::Confirmation => ATT_HANDLE_VALUE_CFM,
        }
    }

    pub fn decode(data: &'d [u8]) -> Result<AttReq<'d>, CodecError> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                let mtu: u16 = r.read()?;
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_FIND_INFORMATION_REQ => {
                let start_handle: u16 = r.read()?;
                let end_handle: u16 = r.read()?;
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::FindInformation {
                    start_handle,
                    end_handle,
                })
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                let start_handle: u16 = r.read()?;
                let end_handle: u16 = r.read()?;
                let att_type: u16 = r.read()?;
                Ok(Self::FindByTypeValue {
                    start_handle,
                    end_handle,
                    att_type,
                    att_value: r.remaining(),
                })
            }
            ATT_READ_BY_TYPE_REQ => {
                let start: u16 = r.read()?;
                let end: u16 = r.read()?;
                let attribute_type = Uuid::decode(r.remaining())?;
                Ok(Self::ReadByType {
                    start,
                    end,
                    attribute_type,
                })
            }
            ATT_READ_REQ => {
                let handle: u16 = r.read()?;
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::Read { handle })
            }
            ATT_READ_BLOB_REQ => {
                let handle: u16 = r.read()?;
                let offset: u16 = r.read()?;
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ReadBlob { handle, offset })
            }
            ATT_READ_MULTIPLE_REQ => {
                let handles = r.remaining();
                if handles.len() < 4 || handles.len() % 2 != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ReadMultiple { handles })
            }
            ATT_READ_BY_GROUP_TYPE_REQ => {
                let start: u16 = r.read()?;
                let end: u16 = r.read()?;
                let group_type = Uuid::decode(r.remaining())?;
                Ok(Self::ReadByGroupType { start, end, group_type })
            }
            ATT_WRITE_REQ => {
                let handle: u16 = r.read()?;
                Ok(Self::Write {
                    handle,
                    data: r.remaining(),
                })
            }
            ATT_WRITE_CMD => {
                let handle: u16 = r.read()?;
                Ok(Self::WriteCmd {
                    handle,
                    data: r.remaining(),
                })
            }
            ATT_PREPARE_WRITE_REQ => {
                let handle: u16 = r.read()?;
                let offset: u16 = r.read()?;
                Ok(Self::PrepareWrite {
                    handle,
                    offset,
                    value: r.remaining(),
                })
            }
            ATT_EXECUTE_WRITE_REQ => {
                let flags: u8 = r.read()?;
                if r.available() != 0 || flags > 1 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ExecuteWrite { flags })
            }
            ATT_SIGNED_WRITE_CMD => {
                // Signature is the trailing 12 bytes.
                let handle: u16 = r.read()?;
                let rest = r.remaining();
                if rest.len() < 12 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::SignedWrite {
                    handle,
                    data: &rest[..rest.len() - 12],
                })
            }
            ATT_HANDLE_VALUE_CFM => {
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::Confirmation)
            }
            _ => Err(CodecError::InvalidValue),
        }
    }
}

impl<'d> Type for AttReq<'d> {
    fn size(&self) -> usize {
        1 + match self {
            Self::ExchangeMtu { .. } => 2,
            Self::FindInformation { .. } => 4,
            Self::FindByTypeValue { att_value, .. } => 6 + att_value.len(),
            Self::ReadByType { attribute_type, .. } => 4 + attribute_type.size(),
            Self::Read { .. } => 2,
            Self::ReadBlob { .. } => 4,
            Self::ReadMultiple { handles } => handles.len(),
            Self::ReadByGroupType { group_type, .. } => 4 + group_type.size(),
            Self::Write { data, .. } => 2 + data.len(),
            Self::WriteCmd { data, .. } => 2 + data.len(),
            Self::PrepareWrite { value, .. } => 4 + value.len(),
            Self::ExecuteWrite { .. } => 1,
            Self::SignedWrite { data, .. } => 2 + data.len() + 12,
            Self::Confirmation => 0,
        }
    }
}

impl<'d> Encode for AttReq<'d> {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.opcode())?;
        match self {
            Self::ExchangeMtu { mtu } => w.write(*mtu)?,
            Self::FindInformation {
                start_handle,
                end_handle,
            } => {
                w.write(*start_handle)?;
                w.write(*end_handle)?;
            }
            Self::FindByTypeValue {
                start_handle,
                end_handle,
                att_type,
                att_value,
            } => {
                w.write(*start_handle)?;
                w.write(*end_handle)?;
                w.write(*att_type)?;
                w.append(att_value)?;
            }
            Self::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                w.write(*start)?;
                w.write(*end)?;
                w.write_ref(attribute_type)?;
            }
            Self::Read { handle } => w.write(*handle)?,
            Self::ReadBlob { handle, offset } => {
                w.write(*handle)?;
                w.write(*offset)?;
            }
            Self::ReadMultiple { handles } => w.append(handles)?,
            Self::ReadByGroupType { start, end, group_type } => {
                w.write(*start)?;
                w.write(*end)?;
                w.write_ref(group_type)?;
            }
            Self::Write { handle, data } | Self::WriteCmd { handle, data } => {
                w.write(*handle)?;
                w.append(data)?;
            }
            Self::PrepareWrite { handle, offset, value } => {
                w.write(*handle)?;
                w.write(*offset)?;
                w.append(value)?;
            }
            Self::ExecuteWrite { flags } => w.write(*flags)?,
            Self::SignedWrite { handle, data } => {
                w.write(*handle)?;
                w.append(data)?;
                w.append(&[0; 12])?;
            }
            Self::Confirmation => {}
        }
        Ok(())
    }
}

/// An ATT response, notification or indication PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum AttRsp<'d> {
    Error {
        request: u8,
        handle: u16,
        code: AttErrorCode,
    },
    ExchangeMtu {
        mtu: u16,
    },
    FindInformation {
        format: u8,
        it: FindInformationIter<'d>,
    },
    FindByTypeValue {
        it: FindByTypeValueIter<'d>,
    },
    ReadByType {
        it: ReadByTypeIter<'d>,
    },
    Read {
        data: &'d [u8],
    },
    ReadBlob {
        data: &'d [u8],
    },
    ReadMultiple {
        data: &'d [u8],
    },
    ReadByGroupType {
        it: ReadByGroupTypeIter<'d>,
    },
    Write,
    PrepareWrite {
        handle: u16,
        offset: u16,
        value: &'d [u8],
    },
    ExecuteWrite,
    Notification {
        handle: u16,
        data: &'d [u8],
    },
    Indication {
        handle: u16,
        data: &'d [u8],
    },
}

impl<'d> AttRsp<'d> {
    pub fn decode(data: &'d [u8]) -> Result<AttRsp<'d>, CodecError> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        match opcode {
            ATT_ERROR_RSP => {
                let request: u8 = r.read()?;
                let handle: u16 = r.read()?;
                let code: u8 = r.read()?;
                Ok(Self::Error {
                    request,
                    handle,
                    code: AttErrorCode::from_raw(code),
                })
            }
            ATT_EXCHANGE_MTU_RSP => {
                let mtu: u16 = r.read()?;
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_FIND_INFORMATION_RSP => {
                let format: u8 = r.read()?;
                let pair = match format {
                    0x01 => 4,
                    0x02 => 18,
                    _ => return Err(CodecError::InvalidValue),
                };
                let rest = r.remaining();
                if rest.is_empty() || rest.len() % pair != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::FindInformation {
                    format,
                    it: FindInformationIter { pair, data: rest },
                })
            }
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                let rest = r.remaining();
                if rest.is_empty() || rest.len() % 4 != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::FindByTypeValue {
                    it: FindByTypeValueIter { data: rest },
                })
            }
            ATT_READ_BY_TYPE_RSP => {
                let len: u8 = r.read()?;
                let rest = r.remaining();
                if len < 2 || rest.is_empty() || rest.len() % len as usize != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ReadByType {
                    it: ReadByTypeIter {
                        len: len as usize,
                        data: rest,
                    },
                })
            }
            ATT_READ_RSP => Ok(Self::Read { data: r.remaining() }),
            ATT_READ_BLOB_RSP => Ok(Self::ReadBlob { data: r.remaining() }),
            ATT_READ_MULTIPLE_RSP => Ok(Self::ReadMultiple { data: r.remaining() }),
            ATT_READ_BY_GROUP_TYPE_RSP => {
                let len: u8 = r.read()?;
                let rest = r.remaining();
                if len < 4 || rest.is_empty() || rest.len() % len as usize != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ReadByGroupType {
                    it: ReadByGroupTypeIter {
                        len: len as usize,
                        data: rest,
                    },
                })
            }
            ATT_WRITE_RSP => {
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::Write)
            }
            ATT_PREPARE_WRITE_RSP => {
                let handle: u16 = r.read()?;
                let offset: u16 = r.read()?;
                Ok(Self::PrepareWrite {
                    handle,
                    offset,
                    value: r.remaining(),
                })
            }
            ATT_EXECUTE_WRITE_RSP => {
                if r.available() != 0 {
                    return Err(CodecError::InvalidValue);
                }
                Ok(Self::ExecuteWrite)
            }
            ATT_HANDLE_VALUE_NTF => {
                let handle: u16 = r.read()?;
                Ok(Self::Notification {
                    handle,
                    data: r.remaining(),
                })
            }
            ATT_HANDLE_VALUE_IND => {
                let handle: u16 = r.read()?;
                Ok(Self::Indication {
                    handle,
                    data: r.remaining(),
                })
            }
            _ => Err(CodecError::InvalidValue),
        }
    }

    /// The response opcode a request opcode answers to.
    pub fn expected_opcode(request: u8) -> u8 {
        request + 1
    }
}

/// Yields `(handle, uuid)` pairs from a Find Information response.
#[derive(Debug, Clone, PartialEq)]
pub struct FindInformationIter<'d> {
    pair: usize,
    data: &'d [u8],
}

impl<'d> FindInformationIter<'d> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, Uuid), CodecError>> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < self.pair {
            self.data = &[];
            return Some(Err(CodecError::InsufficientSpace));
        }
        let (entry, rest) = self.data.split_at(self.pair);
        self.data = rest;
        let handle = u16::from_le_bytes([entry[0], entry[1]]);
        Some(Ok((handle, Uuid::from_slice(&entry[2..]))))
    }
}

/// Yields `(found, group_end)` pairs from a Find By Type Value response.
#[derive(Debug, Clone, PartialEq)]
pub struct FindByTypeValueIter<'d> {
    data: &'d [u8],
}

impl<'d> FindByTypeValueIter<'d> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, u16), CodecError>> {
        if self.data.len() < 4 {
            return None;
        }
        let (entry, rest) = self.data.split_at(4);
        self.data = rest;
        Some(Ok((
            u16::from_le_bytes([entry[0], entry[1]]),
            u16::from_le_bytes([entry[2], entry[3]]),
        )))
    }
}

/// Yields `(handle, value)` pairs from a Read By Type response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadByTypeIter<'d> {
    len: usize,
    data: &'d [u8],
}

impl<'d> ReadByTypeIter<'d> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, &'d [u8]), CodecError>> {
        if self.data.len() < self.len {
            return None;
        }
        let (entry, rest) = self.data.split_at(self.len);
        self.data = rest;
        Some(Ok((u16::from_le_bytes([entry[0], entry[1]]), &entry[2..])))
    }
}

/// Yields `(start, end, value)` triples from a Read By Group Type response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadByGroupTypeIter<'d> {
    len: usize,
    data: &'d [u8],
}

impl<'d> ReadByGroupTypeIter<'d> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, u16, &'d [u8]), CodecError>> {
        if self.data.len() < self.len {
            return None;
        }
        let (entry, rest) = self.data.split_at(self.len);
        self.data = rest;
        Some(Ok((
            u16::from_le_bytes([entry[0], entry[1]]),
            u16::from_le_bytes([entry[2], entry[3]]),
            &entry[4..],
        )))
    }
}
