//! Packet and payload framing.
//!
//! A datagram is a plaintext [`PacketHeader`] followed by the payload region.
//! On secure sessions the payload region is ciphertext and the encoded packet
//! header is its associated data; on the unsecured session it is the encoded
//! [`PayloadHeader`] followed by the application payload.
//!
//! ```text
//! [MsgFlags(1)][SessionId(2 LE)][SecFlags(1)][MessageId(4 LE)][Src(8 LE)?][Dst(8 LE)?][Ext?]
//! [ExFlags(1)][MsgType(1)][ExchangeId(2 LE)][Vendor(2 LE)?][ProtocolId(2 LE)][AckedId(4 LE)?][Payload]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CodecError, NodeId, MESSAGE_VERSION};

const FLAG_SOURCE_NODE_ID: u8 = 0x04;
const DSIZ_MASK: u8 = 0x03;
const DSIZ_NONE: u8 = 0;
const DSIZ_NODE_ID: u8 = 1;

const SEC_FLAG_PRIVACY: u8 = 0x80;
const SEC_FLAG_CONTROL: u8 = 0x40;
const SEC_FLAG_EXTENSIONS: u8 = 0x20;
const SESSION_TYPE_MASK: u8 = 0x03;

const EXCHANGE_FLAG_INITIATOR: u8 = 0x01;
const EXCHANGE_FLAG_ACK: u8 = 0x02;
const EXCHANGE_FLAG_RELIABLE: u8 = 0x04;
const EXCHANGE_FLAG_SECURED_EXTENSIONS: u8 = 0x08;
const EXCHANGE_FLAG_VENDOR: u8 = 0x10;

/// Minimum size of an encoded packet header (no node ids, no extensions).
pub const MIN_PACKET_HEADER_SIZE: usize = 8;
/// Minimum size of an encoded payload header (no vendor id, no ack).
pub const MIN_PAYLOAD_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    #[default]
    Unicast,
    Group,
}

impl SessionType {
    fn bits(self) -> u8 {
        match self {
            SessionType::Unicast => 0,
            SessionType::Group => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub session_id: u16,
    pub session_type: SessionType,
    pub has_privacy_enhancements: bool,
    pub is_control_message: bool,
    /// Raw message extension block, kept so re-encoding reproduces the header.
    pub message_extensions: Option<Bytes>,
    pub message_id: u32,
    pub source_node_id: Option<NodeId>,
    pub dest_node_id: Option<NodeId>,
}

impl PacketHeader {
    /// Header for a unicast message on `session_id`.
    pub fn unicast(
        session_id: u16,
        message_id: u32,
        source_node_id: Option<NodeId>,
        dest_node_id: Option<NodeId>,
    ) -> Self {
        Self {
            session_id,
            message_id,
            source_node_id,
            dest_node_id,
            ..Self::default()
        }
    }

    /// The security flags byte. It is also the first byte of the AEAD nonce.
    pub fn security_flags(&self) -> u8 {
        let mut flags = self.session_type.bits();
        if self.has_privacy_enhancements {
            flags |= SEC_FLAG_PRIVACY;
        }
        if self.is_control_message {
            flags |= SEC_FLAG_CONTROL;
        }
        if self.message_extensions.is_some() {
            flags |= SEC_FLAG_EXTENSIONS;
        }
        flags
    }

    pub fn encoded_len(&self) -> usize {
        MIN_PACKET_HEADER_SIZE
            + self.source_node_id.map_or(0, |_| 8)
            + self.dest_node_id.map_or(0, |_| 8)
            + self.message_extensions.as_ref().map_or(0, |ext| 2 + ext.len())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut flags = MESSAGE_VERSION << 4;
        if self.source_node_id.is_some() {
            flags |= FLAG_SOURCE_NODE_ID;
        }
        if self.dest_node_id.is_some() {
            flags |= DSIZ_NODE_ID;
        }

        buf.put_u8(flags);
        buf.put_u16_le(self.session_id);
        buf.put_u8(self.security_flags());
        buf.put_u32_le(self.message_id);
        if let Some(source) = self.source_node_id {
            buf.put_u64_le(source);
        }
        if let Some(dest) = self.dest_node_id {
            buf.put_u64_le(dest);
        }
        if let Some(ext) = &self.message_extensions {
            buf.put_u16_le(ext.len() as u16);
            buf.put_slice(ext);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode a header from the front of `buf`, leaving the payload region behind.
    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure(buf, MIN_PACKET_HEADER_SIZE)?;

        let flags = buf.get_u8();
        let version = flags >> 4;
        if version != MESSAGE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let session_id = buf.get_u16_le();
        let security_flags = buf.get_u8();
        let session_type = match security_flags & SESSION_TYPE_MASK {
            0 => SessionType::Unicast,
            1 => SessionType::Group,
            other => return Err(CodecError::UnsupportedSessionType(other)),
        };
        let message_id = buf.get_u32_le();

        let source_node_id = if flags & FLAG_SOURCE_NODE_ID != 0 {
            ensure(buf, 8)?;
            Some(buf.get_u64_le())
        } else {
            None
        };
        let dest_node_id = match flags & DSIZ_MASK {
            DSIZ_NONE => None,
            DSIZ_NODE_ID => {
                ensure(buf, 8)?;
                Some(buf.get_u64_le())
            }
            other => return Err(CodecError::UnsupportedDestination(other)),
        };
        let message_extensions = if security_flags & SEC_FLAG_EXTENSIONS != 0 {
            Some(take_length_prefixed(buf)?)
        } else {
            None
        };

        Ok(Self {
            session_id,
            session_type,
            has_privacy_enhancements: security_flags & SEC_FLAG_PRIVACY != 0,
            is_control_message: security_flags & SEC_FLAG_CONTROL != 0,
            message_extensions,
            message_id,
            source_node_id,
            dest_node_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadHeader {
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub message_type: u8,
    pub is_initiator_message: bool,
    pub requires_ack: bool,
    pub acked_message_id: Option<u32>,
}

impl PayloadHeader {
    fn exchange_flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_initiator_message {
            flags |= EXCHANGE_FLAG_INITIATOR;
        }
        if self.acked_message_id.is_some() {
            flags |= EXCHANGE_FLAG_ACK;
        }
        if self.requires_ack {
            flags |= EXCHANGE_FLAG_RELIABLE;
        }
        flags
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.exchange_flags());
        buf.put_u8(self.message_type);
        buf.put_u16_le(self.exchange_id);
        buf.put_u16_le(self.protocol_id);
        if let Some(acked) = self.acked_message_id {
            buf.put_u32_le(acked);
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure(buf, MIN_PAYLOAD_HEADER_SIZE)?;

        let flags = buf.get_u8();
        let message_type = buf.get_u8();
        let exchange_id = buf.get_u16_le();
        if flags & EXCHANGE_FLAG_VENDOR != 0 {
            ensure(buf, 2)?;
            let _vendor_id = buf.get_u16_le();
        }
        ensure(buf, 2)?;
        let protocol_id = buf.get_u16_le();
        let acked_message_id = if flags & EXCHANGE_FLAG_ACK != 0 {
            ensure(buf, 4)?;
            Some(buf.get_u32_le())
        } else {
            None
        };
        if flags & EXCHANGE_FLAG_SECURED_EXTENSIONS != 0 {
            take_length_prefixed(buf)?;
        }

        Ok(Self {
            exchange_id,
            protocol_id,
            message_type,
            is_initiator_message: flags & EXCHANGE_FLAG_INITIATOR != 0,
            requires_ack: flags & EXCHANGE_FLAG_RELIABLE != 0,
            acked_message_id,
        })
    }
}

/// A framed datagram: decoded packet header plus the still-opaque payload region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub bytes: Bytes,
}

/// A fully decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub packet_header: PacketHeader,
    pub payload_header: PayloadHeader,
    pub payload: Bytes,
}

pub fn decode_packet(data: Bytes) -> Result<Packet, CodecError> {
    let mut bytes = data;
    let header = PacketHeader::decode(&mut bytes)?;
    Ok(Packet { header, bytes })
}

pub fn encode_packet(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.header.encoded_len() + packet.bytes.len());
    packet.header.encode_into(&mut buf);
    buf.put_slice(&packet.bytes);
    buf.freeze()
}

/// Split a plaintext payload region into payload header and application payload.
pub fn decode_payload(packet: Packet) -> Result<Message, CodecError> {
    let mut bytes = packet.bytes;
    let payload_header = PayloadHeader::decode(&mut bytes)?;
    Ok(Message {
        packet_header: packet.header,
        payload_header,
        payload: bytes,
    })
}

/// Produce a packet whose payload region is the plaintext payload header and payload.
pub fn encode_payload(message: &Message) -> Packet {
    let mut buf = BytesMut::with_capacity(MIN_PAYLOAD_HEADER_SIZE + 4 + message.payload.len());
    message.payload_header.encode_into(&mut buf);
    buf.put_slice(&message.payload);
    Packet {
        header: message.packet_header.clone(),
        bytes: buf.freeze(),
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::TooShort {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn take_length_prefixed(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    ensure(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            packet_header: PacketHeader::unicast(0x1234, 0xdead_beef, Some(7), Some(9)),
            payload_header: PayloadHeader {
                exchange_id: 0x4242,
                protocol_id: 1,
                message_type: 0x05,
                is_initiator_message: true,
                requires_ack: true,
                acked_message_id: Some(77),
            },
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn test_packet_header_layout() {
        let header = PacketHeader::unicast(0x0102, 0x0a0b0c0d, None, None);
        let encoded = header.encode();
        assert_eq!(encoded.as_ref(), &[0x00, 0x02, 0x01, 0x00, 0x0d, 0x0c, 0x0b, 0x0a]);
    }

    #[test]
    fn test_node_ids_set_flags() {
        let header = PacketHeader::unicast(1, 2, Some(0x1122), Some(0x3344));
        let encoded = header.encode();
        assert_eq!(encoded[0], FLAG_SOURCE_NODE_ID | DSIZ_NODE_ID);
        assert_eq!(encoded.len(), 24);
        assert_eq!(&encoded[8..10], &[0x22, 0x11]);
        assert_eq!(&encoded[16..18], &[0x44, 0x33]);
    }

    #[test]
    fn test_message_roundtrip() {
        let message = sample_message();
        let wire = encode_packet(&encode_payload(&message));
        let decoded = decode_payload(decode_packet(wire).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_payload_header_flags() {
        let message = sample_message();
        let packet = encode_payload(&message);
        assert_eq!(
            packet.bytes[0],
            EXCHANGE_FLAG_INITIATOR | EXCHANGE_FLAG_ACK | EXCHANGE_FLAG_RELIABLE
        );
        assert_eq!(packet.bytes[1], 0x05);
        assert_eq!(&packet.bytes[6..10], &77u32.to_le_bytes());
    }

    #[test]
    fn test_security_flags_extensions_roundtrip() {
        let mut header = PacketHeader::unicast(3, 4, None, None);
        header.is_control_message = true;
        header.message_extensions = Some(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(header.security_flags(), SEC_FLAG_CONTROL | SEC_FLAG_EXTENSIONS);

        let mut encoded = header.encode();
        let decoded = PacketHeader::decode(&mut encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_vendor_prefixed_protocol_is_accepted() {
        let raw = Bytes::from_static(&[
            EXCHANGE_FLAG_VENDOR | EXCHANGE_FLAG_INITIATOR,
            0x02,
            0x01,
            0x00,
            0xf1,
            0xff,
            0x05,
            0x00,
        ]);
        let mut buf = raw;
        let header = PayloadHeader::decode(&mut buf).unwrap();
        assert_eq!(header.protocol_id, 5);
        assert_eq!(header.exchange_id, 1);
        assert!(header.is_initiator_message);
    }

    #[test]
    fn test_rejects_truncated_header() {
        let err = decode_packet(Bytes::from_static(&[0x00, 0x01, 0x00])).unwrap_err();
        assert!(matches!(err, CodecError::TooShort { .. }));

        let err = decode_packet(Bytes::from_static(&[0x04, 0, 0, 0, 1, 0, 0, 0, 1])).unwrap_err();
        assert!(matches!(err, CodecError::TooShort { needed: 8, .. }));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = decode_packet(Bytes::from_static(&[0x10, 0, 0, 0, 1, 0, 0, 0])).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedVersion(1));
    }

    #[test]
    fn test_rejects_group_destination() {
        let err = decode_packet(Bytes::from_static(&[0x02, 0, 0, 0, 1, 0, 0, 0, 0, 0]))
            .unwrap_err();
        assert_eq!(err, CodecError::UnsupportedDestination(2));
    }
}
