//! Conversions between characteristic payloads and typed values
//!
//! The queue itself only ever moves raw bytes around; these traits are
//! applied at the edges (`Session::read_as`, `Session::write_value` and
//! `Session::listen_as`) so a failed conversion only ever affects the one
//! call that made it.

use crate::{Error, Result};

pub trait Decode: Sized {
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

pub trait Encode {
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

impl Decode for Vec<u8> {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Encode for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }
}

impl Encode for [u8] {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl Decode for bool {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(Error::DecodeFailed(format!("expected a single 0/1 byte, got {:?}", bytes))),
        }
    }
}

impl Encode for bool {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(vec![*self as u8])
    }
}

impl Decode for String {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|err| Error::DecodeFailed(err.to_string()))
    }
}

impl Encode for String {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Encode for str {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

// GATT integers are little endian
macro_rules! impl_le_codec {
    ($($ty:ty),*) => {
        $(
            impl Decode for $ty {
                fn from_bytes(bytes: &[u8]) -> Result<Self> {
                    let array = bytes.try_into().map_err(|_| {
                        Error::DecodeFailed(format!("expected {} bytes for {}, got {}",
                                                    std::mem::size_of::<$ty>(),
                                                    stringify!($ty),
                                                    bytes.len()))
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }
            }

            impl Encode for $ty {
                fn to_bytes(&self) -> Result<Vec<u8>> {
                    Ok(self.to_le_bytes().to_vec())
                }
            }
        )*
    };
}

impl_le_codec!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Encodes a value that may not fit the characteristic, failing with
/// `Error::EncodeFailed` when the encoded length exceeds `max_len`
pub fn encode_bounded<T: Encode + ?Sized>(value: &T, max_len: usize) -> Result<Vec<u8>> {
    let bytes = value.to_bytes()?;
    if bytes.len() > max_len {
        return Err(Error::EncodeFailed(format!("{} bytes exceeds the {} byte limit",
                                               bytes.len(), max_len)));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(u16::from_bytes(&[0x34, 0x12]).unwrap(), 0x1234);
        assert_eq!(0x1234u16.to_bytes().unwrap(), vec![0x34, 0x12]);
        assert_eq!(i16::from_bytes(&[0xff, 0xff]).unwrap(), -1);
    }

    #[test]
    fn short_payloads_fail_to_decode() {
        assert!(matches!(u32::from_bytes(&[1, 2, 3]), Err(Error::DecodeFailed(_))));
        assert!(matches!(bool::from_bytes(&[2]), Err(Error::DecodeFailed(_))));
        assert!(matches!(String::from_bytes(&[0xff, 0xfe]), Err(Error::DecodeFailed(_))));
    }

    #[test]
    fn bounded_encoding() {
        assert_eq!(encode_bounded("hi", 20).unwrap(), b"hi".to_vec());
        assert!(matches!(encode_bounded("too long for this", 4), Err(Error::EncodeFailed(_))));
    }
}
