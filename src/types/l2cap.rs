//! L2CAP basic-mode header and fixed channel ids.

use crate::codec::{Decode, Encode, Error, Type};

pub(crate) const L2CAP_CID_ATT: u16 = 0x0004;
pub(crate) const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;
pub(crate) const L2CAP_CID_SMP: u16 = 0x0006;

/// The 4-byte header in front of every L2CAP PDU.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct L2capHeader {
    /// Payload length, excluding this header.
    pub length: u16,
    /// Destination channel.
    pub channel: u16,
}

impl Type for L2capHeader {
    fn size(&self) -> usize {
        4
    }
}

impl Encode for L2capHeader {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < 4 {
            return Err(Error::InsufficientSpace);
        }
        self.length.encode(&mut dest[0..2])?;
        self.channel.encode(&mut dest[2..4])?;
        Ok(())
    }
}

impl<'d> Decode<'d> for L2capHeader {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        Ok(Self {
            length: u16::decode(&src[0..])?,
            channel: u16::decode(&src[2..])?,
        })
    }
}
