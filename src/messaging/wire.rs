//! Packet codec: every packet is one bincode frame. Stream transports add a length prefix
//!  (4 bytes big endian) on top of that.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::group::error::PeerError;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    TooLarge(usize),
}

impl From<WireError> for PeerError {
    fn from(value: WireError) -> Self {
        PeerError::Serialization(value.to_string())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    let buf = bincode::serialize(value).map_err(WireError::Encode)?;
    if buf.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(buf.len()));
    }
    Ok(Bytes::from(buf))
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, WireError> {
    if buf.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(buf.len()));
    }
    bincode::deserialize(buf).map_err(WireError::Decode)
}

/// Prepends the length prefix for stream transports
pub fn length_prefixed(frame: &[u8]) -> Result<Bytes, WireError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(frame.len()));
    }
    let mut buf = BytesMut::with_capacity(LEN_SIZE + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    Ok(buf.freeze())
}

/// Parses a length prefix, rejecting lengths beyond the maximum frame length
pub fn frame_len(len_buf: [u8; LEN_SIZE]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_decode_garbage() {
        let result = decode::<(String, u64)>(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(WireError::Decode(_))));

        let error: PeerError = result.unwrap_err().into();
        assert!(matches!(error, PeerError::Serialization(_)));
    }

    #[test]
    fn test_length_prefixed() {
        let buf = length_prefixed(b"abc").unwrap();
        assert_eq!(buf.as_ref(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[rstest]
    #[case::empty([0, 0, 0, 0], Some(0))]
    #[case::small([0, 0, 1, 2], Some(258))]
    #[case::max([1, 0, 0, 0], Some(MAX_FRAME_LEN))]
    #[case::too_large([1, 0, 0, 1], None)]
    #[case::huge([0xff, 0xff, 0xff, 0xff], None)]
    fn test_frame_len(#[case] len_buf: [u8; 4], #[case] expected: Option<usize>) {
        assert_eq!(frame_len(len_buf).ok(), expected);
    }
}
