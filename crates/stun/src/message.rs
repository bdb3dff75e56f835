use std::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::{
    Error,
    attribute::{Attribute, AttributeType, MessageIntegrity},
    util::{self, Auth},
};

const COOKIE: [u8; 4] = 0x2112A442u32.to_be_bytes();
const ZERO_BUF: [u8; 10] = [0u8; 10];

/// STUN method class: the two class bits folded into the message type.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum MethodKind {
    Request,
    Response,
    Error,
}

/// STUN Methods Registry
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
///
/// The methods a TURN client speaks:
///
/// 0x001: Binding
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(MethodKind),
    Allocate(MethodKind),
    Refresh(MethodKind),
    CreatePermission(MethodKind),
    ChannelBind(MethodKind),
    SendIndication,
    DataIndication,
}

impl Method {
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Method::Binding(MethodKind::Error)
                | Method::Allocate(MethodKind::Error)
                | Method::Refresh(MethodKind::Error)
                | Method::CreatePermission(MethodKind::Error)
                | Method::ChannelBind(MethodKind::Error)
        )
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::message::{Method, MethodKind};
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), Method::Binding(MethodKind::Request));
    /// assert_eq!(Method::try_from(0x0101).unwrap(), Method::Binding(MethodKind::Response));
    /// assert_eq!(Method::try_from(0x0113).unwrap(), Method::Allocate(MethodKind::Error));
    /// assert_eq!(Method::try_from(0x0016).unwrap(), Method::SendIndication);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), Method::DataIndication);
    /// assert!(Method::try_from(0x0002).is_err());
    /// ```
    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            0x0001 => Self::Binding(MethodKind::Request),
            0x0101 => Self::Binding(MethodKind::Response),
            0x0111 => Self::Binding(MethodKind::Error),
            0x0003 => Self::Allocate(MethodKind::Request),
            0x0103 => Self::Allocate(MethodKind::Response),
            0x0113 => Self::Allocate(MethodKind::Error),
            0x0004 => Self::Refresh(MethodKind::Request),
            0x0104 => Self::Refresh(MethodKind::Response),
            0x0114 => Self::Refresh(MethodKind::Error),
            0x0008 => Self::CreatePermission(MethodKind::Request),
            0x0108 => Self::CreatePermission(MethodKind::Response),
            0x0118 => Self::CreatePermission(MethodKind::Error),
            0x0009 => Self::ChannelBind(MethodKind::Request),
            0x0109 => Self::ChannelBind(MethodKind::Response),
            0x0119 => Self::ChannelBind(MethodKind::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    fn from(val: Method) -> Self {
        match val {
            Method::Binding(MethodKind::Request) => 0x0001,
            Method::Binding(MethodKind::Response) => 0x0101,
            Method::Binding(MethodKind::Error) => 0x0111,
            Method::Allocate(MethodKind::Request) => 0x0003,
            Method::Allocate(MethodKind::Response) => 0x0103,
            Method::Allocate(MethodKind::Error) => 0x0113,
            Method::Refresh(MethodKind::Request) => 0x0004,
            Method::Refresh(MethodKind::Response) => 0x0104,
            Method::Refresh(MethodKind::Error) => 0x0114,
            Method::CreatePermission(MethodKind::Request) => 0x0008,
            Method::CreatePermission(MethodKind::Response) => 0x0108,
            Method::CreatePermission(MethodKind::Error) => 0x0118,
            Method::ChannelBind(MethodKind::Request) => 0x0009,
            Method::ChannelBind(MethodKind::Response) => 0x0109,
            Method::ChannelBind(MethodKind::Error) => 0x0119,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
        }
    }
}

pub struct MessageEncoder<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    /// start a message with a fresh header.
    pub fn new(method: Method, token: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put(&COOKIE[..]);
        bytes.put(token.as_slice());
        Self { bytes, token }
    }

    /// append attribute to the message attribute list.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_stun::attribute::UserName;
    /// use visor_stun::message::{Method, MethodKind, MessageEncoder};
    ///
    /// let expect = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let token: [u8; 12] = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut message =
    ///     MessageEncoder::new(Method::Binding(MethodKind::Request), &token, &mut buf);
    /// message.append::<UserName>("panda");
    /// assert_eq!(&expect[..], &buf[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // reserve the two length bytes, serialize the body, then come back
        // and write the real body size.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.token);

        let size = self.bytes.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.bytes[os] = size_buf[0];
        self.bytes[os + 1] = size_buf[1];

        // zero padding out to the 4-byte boundary.
        let pad = util::pad_size(size);
        if pad > 0 {
            self.bytes.put(&ZERO_BUF[0..pad]);
        }
    }

    /// finalize the message: write the header length, then the
    /// MESSAGE-INTEGRITY and FINGERPRINT trailer when credentials are given.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_stun::message::{Method, MethodKind, MessageEncoder};
    /// use visor_stun::util;
    ///
    /// let expect = [
    ///     0x00u8, 0x01, 0x00, 0x20, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x08, 0x00,
    ///     0x14, 0x45, 0x0e, 0x6e, 0x44, 0x52, 0x1e, 0xe8, 0xde, 0x2c, 0xf0, 0xfa,
    ///     0xb6, 0x9c, 0x5c, 0x19, 0x17, 0x98, 0xc6, 0xd9, 0xde, 0x80, 0x28, 0x00,
    ///     0x04, 0xed, 0x41, 0xb6, 0xbe,
    /// ];
    ///
    /// let token: [u8; 12] = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// let mut message =
    ///     MessageEncoder::new(Method::Binding(MethodKind::Request), &token, &mut buf);
    /// message
    ///     .flush(Some(&util::long_key("panda", "panda", "raspberry")))
    ///     .unwrap();
    /// assert_eq!(&buf[..], &expect);
    /// ```
    pub fn flush(&mut self, auth: Option<&Auth>) -> Result<(), Error> {
        self.set_len(self.bytes.len() - 20);

        if let Some(auth) = auth {
            self.integrity(auth)?;
        }

        Ok(())
    }

    // append the MESSAGE-INTEGRITY and FINGERPRINT attributes.
    //
    // the digest is computed over the message with the header length
    // pre-updated to include the 24-byte integrity attribute that follows;
    // the fingerprint repeats the dance for its own 8 bytes.
    fn integrity(&mut self, auth: &Auth) -> Result<(), Error> {
        assert!(self.bytes.len() >= 20);
        let len = self.bytes.len();

        self.set_len(len - 20 + 4 + 20);

        let digest = util::hmac_sha1(auth, &[self.bytes])?;
        self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
        self.bytes.put_u16(20);
        self.bytes.put(digest.as_slice());

        self.set_len(len - 20 + 24 + 8);

        let fingerprint = util::fingerprint(self.bytes);
        self.bytes.put_u16(AttributeType::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(fingerprint);

        Ok(())
    }

    // write the attribute-list size into the header.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

#[derive(Debug)]
pub struct Message<'a, 'b> {
    method: Method,
    bytes: &'a [u8],
    /// offset of the first attribute not covered by MESSAGE-INTEGRITY.
    valid_offset: u16,
    attributes: &'b Vec<(AttributeType, Range<usize>)>,
}

impl<'a, 'b> Message<'a, 'b> {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// get attribute from the message attribute list.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == T::TYPE)
            .and_then(|(_, range)| T::deserialize(&self.bytes[range.clone()], self.token()).ok())
    }

    /// verify the MESSAGE-INTEGRITY attribute.
    ///
    /// recomputes the HMAC over the received bytes with the header length
    /// adjusted to cover the integrity attribute, and compares against the
    /// stored digest.
    pub fn integrity(&self, auth: &Auth) -> Result<(), Error> {
        if self.bytes.is_empty() || self.valid_offset < 20 {
            return Err(Error::InvalidInput);
        }

        let integrity = self
            .get::<MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        // submit the message in three pieces so the adjusted length field
        // replaces the one on the wire.
        let size_buf = (self.valid_offset + 4).to_be_bytes();
        let body = [
            &self.bytes[0..2],
            &size_buf,
            &self.bytes[4..self.valid_offset as usize],
        ];

        let digest = util::hmac_sha1(auth, &body)?;
        if integrity != &digest[..] {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// try to decode bytes as a message.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::attribute::UserName;
    /// use visor_stun::message::{Message, Method, MethodKind};
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Vec::new();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// assert_eq!(message.method(), Method::Binding(MethodKind::Request));
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(
        bytes: &'a [u8],
        attributes: &'b mut Vec<(AttributeType, Range<usize>)>,
    ) -> Result<Message<'a, 'b>, Error> {
        let count_size = bytes.len();
        if count_size < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(util::as_u16(&bytes[..2]))?;

        // the length field does not count the 20-byte header; a datagram
        // shorter than it claims is dropped whole.
        let size = util::as_u16(&bytes[2..4]) as usize + 20;
        if count_size < size {
            return Err(Error::InvalidInput);
        }

        if bytes[4..8] != COOKIE[..] {
            return Err(Error::NotFoundCookie);
        }

        let mut find_integrity = false;
        let mut valid_offset = 0;
        let mut offset = 20;

        loop {
            // not enough room left for another TLV header.
            if count_size - offset < 4 {
                break;
            }

            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);

            // everything before MESSAGE-INTEGRITY is covered by the digest;
            // remember where that coverage ends.
            if !find_integrity {
                valid_offset = offset as u16;
            }

            if key == AttributeType::MessageIntegrity as u16 {
                find_integrity = true;
            }

            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            // an attribute body running past the end of the datagram drops
            // the remainder, not the whole message.
            offset += 4;
            if count_size - offset < size {
                break;
            }

            let range = offset..(offset + size);

            if size > 0 {
                offset += size + util::pad_size(size);
            }

            // skip attributes this client does not understand.
            let kind = match AttributeType::try_from(key) {
                Err(_) => continue,
                Ok(kind) => kind,
            };

            attributes.push((kind, range));
        }

        Ok(Self {
            method,
            bytes,
            valid_offset,
            attributes,
        })
    }
}

impl<'a> AsRef<[u8]> for Message<'a, '_> {
    fn as_ref(&self) -> &'a [u8] {
        self.bytes
    }
}
