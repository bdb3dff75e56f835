mod address;
mod error;

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

pub use address::Addr;
pub use error::{ErrorCode, ErrorKind};

use crate::{Error as CodecError, util};

/// attribute type registry.
#[repr(u16)]
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
    Fingerprint = 0x8028,
    ResponseOrigin = 0x802B,
}

/// A typed STUN/TURN attribute.
///
/// The transaction-id token is threaded through both directions because the
/// XOR address family folds it into IPv6 coding.
pub trait Attribute<'a> {
    type Item;

    const TYPE: AttributeType;

    /// write the attribute body to the buffer.
    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]);

    /// read the attribute body from the buffer.
    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError>;
}

/// The USERNAME attribute identifies the username and password combination
/// used in the message-integrity check. UTF-8, fewer than 509 bytes.
pub struct UserName;

impl<'a> Attribute<'a> for UserName {
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::UserName;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The DATA attribute carries the application payload of Send and Data
/// indications, i.e. the bytes that would follow the UDP header had the
/// datagram travelled directly between client and peer.
pub struct Data;

impl<'a> Attribute<'a> for Data {
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::Data;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(bytes)
    }
}

/// The REALM attribute. Its presence in a request signals long-term
/// credentials; in a 401 response it names the realm the server wants the
/// client to authenticate against.
pub struct Realm;

impl<'a> Attribute<'a> for Realm {
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::Realm;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The NONCE attribute, echoed back by the client on every authenticated
/// request; replaced when the server answers 438 Stale Nonce.
pub struct Nonce;

impl<'a> Attribute<'a> for Nonce {
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::Nonce;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The SOFTWARE attribute, diagnostics only.
pub struct Software;

impl<'a> Attribute<'a> for Software {
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::Software;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The MESSAGE-INTEGRITY attribute: HMAC-SHA1 over the message, 20 bytes.
///
/// The HMAC input is the message up to and including the attribute
/// preceding MESSAGE-INTEGRITY, but with the header length field already
/// adjusted to point past the integrity attribute itself. Writing or
/// verifying without that adjustment produces a digest no compliant peer
/// will accept.
pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::MessageIntegrity;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put(item);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        Ok(bytes)
    }
}

/// The ERROR-CODE attribute.
pub struct Error;

impl<'a> Attribute<'a> for Error {
    type Item = ErrorCode<'a>;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        item.encode(bytes);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        ErrorCode::try_from(bytes)
    }
}

/// The LIFETIME attribute: seconds until the allocation expires without a
/// refresh. A requested lifetime of zero deletes the allocation.
pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Lifetime;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put_u32(item);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::InvalidInput);
        }

        Ok(util::as_u32(bytes))
    }
}

/// The REQUESTED-TRANSPORT attribute. Only codepoint 17 (UDP) is allowed;
/// the three RFFU bytes are zero on the wire.
pub struct RequestedTransport;

impl<'a> Attribute<'a> for RequestedTransport {
    type Item = u8;

    const TYPE: AttributeType = AttributeType::RequestedTransport;

    fn serialize(_: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put_u32(0x1100_0000);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::InvalidInput);
        }

        Ok(bytes[0])
    }
}

/// The FINGERPRINT attribute: CRC-32 of the message up to (but excluding)
/// the attribute itself, XOR'ed with 0x5354554e. Always the last attribute.
pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Fingerprint;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put_u32(item);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::InvalidInput);
        }

        Ok(util::as_u32(bytes))
    }
}

/// The CHANNEL-NUMBER attribute: a 16-bit channel followed by a two-octet
/// RFFU field that is zero on transmission and ignored on reception.
pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    type Item = u16;

    const TYPE: AttributeType = AttributeType::ChannelNumber;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, _: &'a [u8]) {
        bytes.put_u16(item);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, CodecError> {
        if bytes.len() < 2 {
            return Err(CodecError::InvalidInput);
        }

        Ok(util::as_u16(bytes))
    }
}

/// The MAPPED-ADDRESS attribute, kept by servers for RFC 3489 backwards
/// compatibility; the client prefers the XOR variant when both appear.
pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::MappedAddress;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]) {
        Addr::encode(&item, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(bytes, token, false)
    }
}

/// The XOR-MAPPED-ADDRESS attribute: the reflexive transport address,
/// obfuscated through the XOR function.
pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::XorMappedAddress;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]) {
        Addr::encode(&item, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(bytes, token, true)
    }
}

/// The XOR-PEER-ADDRESS attribute: the peer's address and port as seen
/// from the TURN server.
pub struct XorPeerAddress;

impl<'a> Attribute<'a> for XorPeerAddress {
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::XorPeerAddress;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]) {
        Addr::encode(&item, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(bytes, token, true)
    }
}

/// The XOR-RELAYED-ADDRESS attribute, present in Allocate responses: the
/// address the server allocated for the client on the relay.
pub struct XorRelayedAddress;

impl<'a> Attribute<'a> for XorRelayedAddress {
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::XorRelayedAddress;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]) {
        Addr::encode(&item, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(bytes, token, true)
    }
}

/// The RESPONSE-ORIGIN attribute: the source address a Binding response was
/// sent from, useful for spotting double-NAT setups.
pub struct ResponseOrigin;

impl<'a> Attribute<'a> for ResponseOrigin {
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::ResponseOrigin;

    fn serialize(item: Self::Item, bytes: &mut BytesMut, token: &'a [u8]) {
        Addr::encode(&item, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, CodecError> {
        Addr::decode(bytes, token, false)
    }
}
