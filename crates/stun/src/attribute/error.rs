use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error as CodecError;

/// STUN/TURN error codes the client decodes for diagnostics.
///
/// The discriminant packs the on-wire class byte and number byte: the
/// ERROR-CODE attribute body is `reserved(2) | class(1) | number(1)`, so
/// `0x0426` serializes as class 4, number 0x26 = 38, i.e. error 438.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrorKind {
    TryAlternate = 0x0300,
    BadRequest = 0x0400,
    Unauthorized = 0x0401,
    Forbidden = 0x0403,
    RequestTimedout = 0x0408,
    UnknownAttribute = 0x0414,
    AllocationMismatch = 0x0425,
    StaleNonce = 0x0426,
    AddressFamilyNotSupported = 0x0428,
    WrongCredentials = 0x0429,
    UnsupportedTransportAddress = 0x042A,
    AllocationQuotaReached = 0x0456,
    ServerError = 0x0500,
    InsufficientCapacity = 0x0508,
}

impl ErrorKind {
    /// The decimal error code (class × 100 + number), e.g. 438 for
    /// StaleNonce — the form RFC prose and logs use.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::attribute::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::Unauthorized.code(), 401);
    /// assert_eq!(ErrorKind::AllocationMismatch.code(), 437);
    /// assert_eq!(ErrorKind::StaleNonce.code(), 438);
    /// assert_eq!(ErrorKind::WrongCredentials.code(), 441);
    /// assert_eq!(ErrorKind::AllocationQuotaReached.code(), 486);
    /// assert_eq!(ErrorKind::InsufficientCapacity.code(), 508);
    /// ```
    pub const fn code(self) -> u16 {
        let raw = self as u16;
        (raw >> 8) * 100 + (raw & 0xFF)
    }
}

/// The ERROR-CODE attribute: a numeric code in the range 300–699 plus a
/// UTF-8 reason phrase meant for diagnostics only.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Debug)]
pub struct ErrorCode<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl ErrorCode<'_> {
    pub fn from(kind: ErrorKind) -> Self {
        Self {
            code: kind as u16,
            message: kind.into(),
        }
    }

    /// The well-known kind, when the code is one the client understands.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::try_from(self.code).ok()
    }

    /// encode the error into the attribute body.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_stun::attribute::{ErrorCode, ErrorKind};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// ErrorCode::from(ErrorKind::TryAlternate).encode(&mut buf);
    /// assert_eq!(&buf[..], &buffer);
    /// ```
    pub fn encode(self, buf: &mut BytesMut) {
        buf.put_u16(0x0000);
        buf.put_u16(self.code);
        buf.put(self.message.as_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ErrorCode<'a> {
    type Error = CodecError;

    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::attribute::{ErrorCode, ErrorKind};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let error = ErrorCode::try_from(&buffer[..]).unwrap();
    /// assert_eq!(error.kind(), Some(ErrorKind::TryAlternate));
    /// assert_eq!(error.message, "Try Alternate");
    /// ```
    fn try_from(packet: &'a [u8]) -> Result<Self, Self::Error> {
        if packet.len() < 4 || u16::from_be_bytes([packet[0], packet[1]]) != 0x0000 {
            return Err(CodecError::InvalidInput);
        }

        Ok(Self {
            code: u16::from_be_bytes([packet[2], packet[3]]),
            message: std::str::from_utf8(&packet[4..])?,
        })
    }
}

impl From<ErrorKind> for &'static str {
    #[rustfmt::skip]
    fn from(val: ErrorKind) -> Self {
        match val {
            ErrorKind::TryAlternate => "Try Alternate",
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::RequestTimedout => "Request Timed out",
            ErrorKind::UnknownAttribute => "Unknown Attribute",
            ErrorKind::AllocationMismatch => "Allocation Mismatch",
            ErrorKind::StaleNonce => "Stale Nonce",
            ErrorKind::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorKind::WrongCredentials => "Wrong Credentials",
            ErrorKind::UnsupportedTransportAddress => "Unsupported Transport Address",
            ErrorKind::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorKind::ServerError => "Server Error",
            ErrorKind::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}

impl Eq for ErrorCode<'_> {}
impl PartialEq for ErrorCode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
