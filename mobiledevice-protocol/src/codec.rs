//! Frame Codec
//!
//! Pure encode/decode helpers for the two frame formats spoken by this crate.
//! Nothing here performs I/O.
//!
//! ## Multiplexer frame
//!
//! ```text
//! +--------+---------+--------------+-----+-------------------+
//! | length | version | message type | tag | payload (plist)   |
//! | u32 LE | u32 LE  | u32 LE       | u32 | length - 16 bytes |
//! +--------+---------+--------------+-----+-------------------+
//! ```
//!
//! ## Property-list frame
//!
//! ```text
//! +------------------+--------------------------+
//! | payload length   | UTF-8 XML property list  |
//! | u32 big-endian   | payload length bytes     |
//! +------------------+--------------------------+
//! ```

use crate::{ProtocolError, Result};

/// Size of the multiplexer frame header in bytes
pub const MUXER_HEADER_SIZE: usize = 16;

/// Size of the property-list frame length prefix in bytes
pub const PLIST_LENGTH_SIZE: usize = 4;

/// Multiplexer protocol version for property-list payloads
pub const MUXER_PLIST_VERSION: u32 = 1;

/// Largest payload a multiplexer frame can describe
pub const MAX_MUXER_PAYLOAD: usize = u32::MAX as usize - MUXER_HEADER_SIZE;

/// Multiplexer header message-type discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Binary result message
    Result,
    /// Binary connect request
    Connect,
    /// Binary listen request
    Listen,
    /// Binary device-attached notification
    DeviceAdd,
    /// Binary device-detached notification
    DeviceRemove,
    /// Binary device-paired notification
    DevicePaired,
    /// Property-list message; the semantic type rides in the payload
    Plist,
}

impl MessageType {
    /// Wire value of this discriminant
    pub fn as_u32(&self) -> u32 {
        match self {
            MessageType::Result => 1,
            MessageType::Connect => 2,
            MessageType::Listen => 3,
            MessageType::DeviceAdd => 4,
            MessageType::DeviceRemove => 5,
            MessageType::DevicePaired => 6,
            MessageType::Plist => 8,
        }
    }

    /// Decode a wire value, `None` for unknown discriminants
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Result),
            2 => Some(MessageType::Connect),
            3 => Some(MessageType::Listen),
            4 => Some(MessageType::DeviceAdd),
            5 => Some(MessageType::DeviceRemove),
            6 => Some(MessageType::DevicePaired),
            8 => Some(MessageType::Plist),
            _ => None,
        }
    }
}

/// Decoded multiplexer frame header
///
/// `message_type` is kept raw so that any header round-trips; use
/// [`MuxerHeader::kind`] to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerHeader {
    /// Total frame length including this header
    pub length: u32,
    /// Protocol version
    pub version: u32,
    /// Message-type discriminant
    pub message_type: u32,
    /// Request/response correlation tag
    pub tag: u32,
}

impl MuxerHeader {
    /// Header for a payload of `payload_len` bytes
    pub fn for_payload(
        payload_len: usize,
        version: u32,
        message_type: MessageType,
        tag: u32,
    ) -> Result<Self> {
        if payload_len > MAX_MUXER_PAYLOAD {
            return Err(ProtocolError::FrameSizeExceeded(
                payload_len,
                MAX_MUXER_PAYLOAD,
            ));
        }

        Ok(Self {
            length: (payload_len + MUXER_HEADER_SIZE) as u32,
            version,
            message_type: message_type.as_u32(),
            tag,
        })
    }

    /// Interpreted message type
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u32(self.message_type)
    }

    /// Payload length described by this header
    pub fn payload_len(&self) -> Result<usize> {
        (self.length as usize)
            .checked_sub(MUXER_HEADER_SIZE)
            .ok_or_else(|| {
                ProtocolError::MalformedFrame(format!(
                    "frame length {} is smaller than the {} byte header",
                    self.length, MUXER_HEADER_SIZE
                ))
            })
    }
}

/// Encode a multiplexer header
pub fn encode_muxer_header(header: &MuxerHeader) -> [u8; MUXER_HEADER_SIZE] {
    let mut bytes = [0u8; MUXER_HEADER_SIZE];
    bytes[0..4].copy_from_slice(&header.length.to_le_bytes());
    bytes[4..8].copy_from_slice(&header.version.to_le_bytes());
    bytes[8..12].copy_from_slice(&header.message_type.to_le_bytes());
    bytes[12..16].copy_from_slice(&header.tag.to_le_bytes());
    bytes
}

/// Decode a multiplexer header from the first 16 bytes of `bytes`
///
/// Fails with `MalformedFrame` if fewer than 16 bytes are supplied.
pub fn decode_muxer_header(bytes: &[u8]) -> Result<MuxerHeader> {
    if bytes.len() < MUXER_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "multiplexer header needs {} bytes, got {}",
            MUXER_HEADER_SIZE,
            bytes.len()
        )));
    }

    let field = |offset: usize| {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };

    Ok(MuxerHeader {
        length: field(0),
        version: field(4),
        message_type: field(8),
        tag: field(12),
    })
}

/// Encode a complete multiplexer frame (header followed by payload)
pub fn encode_muxer_frame(
    version: u32,
    message_type: MessageType,
    tag: u32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let header = MuxerHeader::for_payload(payload.len(), version, message_type, tag)?;
    let mut frame = Vec::with_capacity(MUXER_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&encode_muxer_header(&header));
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a property-list frame: big-endian length prefix followed by payload
pub fn encode_plist_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameSizeExceeded(payload.len(), u32::MAX as usize))?;

    let mut frame = Vec::with_capacity(PLIST_LENGTH_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode the big-endian length prefix of a property-list frame
///
/// Fails with `TruncatedFrame` when fewer than 4 bytes are supplied.
pub fn decode_plist_frame_length(bytes: &[u8]) -> Result<u32> {
    match bytes.get(..PLIST_LENGTH_SIZE) {
        Some(prefix) => Ok(u32::from_be_bytes([
            prefix[0], prefix[1], prefix[2], prefix[3],
        ])),
        None => Err(ProtocolError::truncated(PLIST_LENGTH_SIZE, bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = MuxerHeader {
            length: 0x0102_0304,
            version: 1,
            message_type: 8,
            tag: 7,
        };
        let bytes = encode_muxer_header(&header);
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[8, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[7, 0, 0, 0]);
    }

    #[test]
    fn test_short_header_is_malformed() {
        let result = decode_muxer_header(&[0u8; 15]);
        assert!(matches!(result, Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn test_header_smaller_than_itself_is_malformed() {
        let header = MuxerHeader {
            length: 8,
            version: 1,
            message_type: 8,
            tag: 1,
        };
        assert!(matches!(
            header.payload_len(),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_plist_frame_prefix() {
        let frame = encode_plist_frame(b"<plist/>").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 8]);
        assert_eq!(&frame[4..], b"<plist/>");
        assert_eq!(decode_plist_frame_length(&frame).unwrap(), 8);
    }

    #[test]
    fn test_plist_length_truncated() {
        for len in 0..PLIST_LENGTH_SIZE {
            let result = decode_plist_frame_length(&[0u8; 3][..len]);
            assert!(matches!(
                result,
                Err(ProtocolError::TruncatedFrame { expected: 4, actual }) if actual == len
            ));
        }
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Plist.as_u32(), 8);
        assert_eq!(MessageType::from_u32(8), Some(MessageType::Plist));
        assert_eq!(MessageType::from_u32(7), None);
    }

    proptest! {
        #[test]
        fn prop_muxer_frame_roundtrip(
            version in any::<u32>(),
            tag in any::<u32>(),
            kind in prop::sample::select(vec![
                MessageType::Result,
                MessageType::Connect,
                MessageType::Listen,
                MessageType::DeviceAdd,
                MessageType::DeviceRemove,
                MessageType::DevicePaired,
                MessageType::Plist,
            ]),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = encode_muxer_frame(version, kind, tag, &payload).unwrap();
            let header = decode_muxer_header(&frame).unwrap();

            prop_assert_eq!(header.version, version);
            prop_assert_eq!(header.tag, tag);
            prop_assert_eq!(header.kind(), Some(kind));
            prop_assert_eq!(header.payload_len().unwrap(), payload.len());
            prop_assert_eq!(&frame[MUXER_HEADER_SIZE..], payload.as_slice());
        }

        #[test]
        fn prop_header_roundtrip(
            length in any::<u32>(),
            version in any::<u32>(),
            message_type in any::<u32>(),
            tag in any::<u32>(),
        ) {
            let header = MuxerHeader { length, version, message_type, tag };
            prop_assert_eq!(decode_muxer_header(&encode_muxer_header(&header)).unwrap(), header);
        }
    }
}
