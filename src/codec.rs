//! Little-endian wire codec traits shared by the HCI and ATT layers.

/// Errors from encoding or decoding wire data.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Destination buffer too small or source truncated.
    InsufficientSpace,
    /// A field held a value outside its domain.
    InvalidValue,
}

/// A type with a known encoded size.
pub trait Type {
    /// Size of the encoded form in bytes.
    fn size(&self) -> usize;
}

/// A type that can be encoded into a little-endian byte buffer.
pub trait Encode: Type {
    /// Encode into `dest`, which is at least `self.size()` bytes.
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error>;
}

/// A type that can be decoded from a little-endian byte buffer.
pub trait Decode<'d>: Sized {
    /// Decode from the start of `src`.
    fn decode(src: &'d [u8]) -> Result<Self, Error>;
}

impl Type for u8 {
    fn size(&self) -> usize {
        1
    }
}

impl Encode for u8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.is_empty() {
            return Err(Error::InsufficientSpace);
        }
        dest[0] = *self;
        Ok(())
    }
}

impl<'d> Decode<'d> for u8 {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        src.first().copied().ok_or(Error::InsufficientSpace)
    }
}

impl Type for u16 {
    fn size(&self) -> usize {
        2
    }
}

impl Encode for u16 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < 2 {
            return Err(Error::InsufficientSpace);
        }
        dest[..2].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl<'d> Decode<'d> for u16 {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        if src.len() < 2 {
            return Err(Error::InsufficientSpace);
        }
        Ok(u16::from_le_bytes([src[0], src[1]]))
    }
}

impl Type for u32 {
    fn size(&self) -> usize {
        4
    }
}

impl Encode for u32 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < 4 {
            return Err(Error::InsufficientSpace);
        }
        dest[..4].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl<'d> Decode<'d> for u32 {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        if src.len() < 4 {
            return Err(Error::InsufficientSpace);
        }
        Ok(u32::from_le_bytes([src[0], src[1], src[2], src[3]]))
    }
}

impl Type for u64 {
    fn size(&self) -> usize {
        8
    }
}

impl Encode for u64 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < 8 {
            return Err(Error::InsufficientSpace);
        }
        dest[..8].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl<'d> Decode<'d> for u64 {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        if src.len() < 8 {
            return Err(Error::InsufficientSpace);
        }
        let mut b = [0; 8];
        b.copy_from_slice(&src[..8]);
        Ok(u64::from_le_bytes(b))
    }
}

impl<const N: usize> Type for [u8; N] {
    fn size(&self) -> usize {
        N
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < N {
            return Err(Error::InsufficientSpace);
        }
        dest[..N].copy_from_slice(self);
        Ok(())
    }
}

impl<'d, const N: usize> Decode<'d> for [u8; N] {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        if src.len() < N {
            return Err(Error::InsufficientSpace);
        }
        let mut b = [0; N];
        b.copy_from_slice(&src[..N]);
        Ok(b)
    }
}
