//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
//! [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
//!
//! Encoder and decoder for the STUN message subset a TURN client needs:
//! Binding, Allocate, Refresh, CreatePermission and ChannelBind
//! request/response pairs, Send/Data indications, and ChannelData framing.
//!
//! ### STUN Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The first two bits of every STUN message are zero, which is what lets a
//! receiver share one socket between STUN messages and ChannelData frames
//! (whose leading channel number is in the `0x4000..=0x7FFF` range).

pub mod attribute;
pub mod channel;
pub mod message;
pub mod util;

use std::{array::TryFromSliceError, str::Utf8Error};

pub use channel::ChannelData;
pub use message::{Message, MessageEncoder, Method, MethodKind};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownMethod,
    NotFoundCookie,
    NotFoundIntegrity,
    IntegrityFailed,
    SummaryFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

#[derive(Debug)]
pub enum Payload<'a, 'b> {
    Message(Message<'a, 'b>),
    ChannelData(ChannelData<'a>),
}

/// Datagram classifier with a reusable attribute cache.
///
/// A single decoder instance is meant to live next to one socket; the
/// attribute list it carries is cleared and refilled on every message so
/// that steady-state decoding does not allocate.
pub struct Decoder {
    attributes: Vec<(attribute::AttributeType, std::ops::Range<usize>)>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            attributes: Vec::with_capacity(10),
        }
    }

    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::attribute::UserName;
    /// use visor_stun::{Decoder, Payload};
    ///
    /// let buffer = [
    ///     0x00, 0x01, 0x00, 0x4c, 0x21, 0x12, 0xa4, 0x42, 0x71, 0x66, 0x46, 0x31,
    ///     0x2b, 0x59, 0x79, 0x65, 0x56, 0x69, 0x32, 0x72, 0x00, 0x06, 0x00, 0x09,
    ///     0x55, 0x43, 0x74, 0x39, 0x3a, 0x56, 0x2f, 0x2b, 0x2f, 0x00, 0x00, 0x00,
    ///     0xc0, 0x57, 0x00, 0x04, 0x00, 0x00, 0x03, 0xe7, 0x80, 0x29, 0x00, 0x08,
    ///     0x22, 0x49, 0xda, 0x28, 0x2c, 0x6f, 0x2e, 0xdb, 0x00, 0x24, 0x00, 0x04,
    ///     0x6e, 0x00, 0x28, 0xff, 0x00, 0x08, 0x00, 0x14, 0x19, 0x58, 0xda, 0x38,
    ///     0xed, 0x1e, 0xdd, 0xc8, 0x6b, 0x8e, 0x22, 0x63, 0x3a, 0x22, 0x63, 0x97,
    ///     0xcf, 0xf5, 0xde, 0x82, 0x80, 0x28, 0x00, 0x04, 0x56, 0xf7, 0xa3, 0xed,
    /// ];
    ///
    /// let mut decoder = Decoder::new();
    /// if let Payload::Message(message) = decoder.decode(&buffer).unwrap() {
    ///     assert!(message.get::<UserName>().is_some())
    /// } else {
    ///     unreachable!()
    /// }
    /// ```
    pub fn decode<'a>(&mut self, bytes: &'a [u8]) -> Result<Payload<'a, '_>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(if bytes[0] >> 6 == 0 {
            self.attributes.clear();
            Payload::Message(Message::decode(bytes, &mut self.attributes)?)
        } else {
            Payload::ChannelData(ChannelData::decode(bytes)?)
        })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
