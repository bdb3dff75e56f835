use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error;

/// fixed packet header size: kind + timestamp + fragment bookkeeping.
pub const HEADER_SIZE: usize = 17;

/// Out-of-band single-byte datagrams sharing the video socket and the
/// control channel. None of these carry the packet header.
pub mod control {
    /// `0xAA <approved>` — host's verdict on the registration.
    pub const AUTH_RESULT: u8 = 0xAA;

    /// `0xFC` — client asks the host to emit a fresh key-frame.
    pub const KEY_FRAME_REQUEST: u8 = 0xFC;

    /// `0xFE <listen_port:u16> <user_id utf8…>` — client registration,
    /// also reused as the periodic heartbeat.
    pub const REGISTRATION: u8 = 0xFE;

    /// `0xFF` — best-effort client disconnect notification.
    pub const DISCONNECT: u8 = 0xFF;

    /// discriminator prefixing the public key inside a handshake payload.
    pub const HANDSHAKE_TAG: u8 = 0xEC;
}

/// Packet kind registry.
///
/// 0x05 is unassigned and 0x07 is reserved for forward-error-correction
/// parity that the host never sends today; both parse, neither is produced.
#[repr(u8)]
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// HEVC video parameter set.
    Vps = 0x00,
    /// sequence parameter set.
    Sps = 0x01,
    /// picture parameter set.
    Pps = 0x02,
    /// P-frame access unit, Annex-B.
    VideoFrame = 0x03,
    /// IDR/CRA access unit.
    KeyFrame = 0x04,
    /// full-resolution still.
    PngFrame = 0x06,
    /// reserved.
    FecParity = 0x07,
    /// host-side telemetry blob.
    Metadata = 0x08,
    /// ECDH key-exchange carrier.
    Handshake = 0x09,
    /// JSON control-plane snapshot.
    OmniscientState = 0x50,
}

impl PacketKind {
    /// parameter sets initialize the decoder and bypass the age check.
    pub const fn is_parameter_set(self) -> bool {
        matches!(self, Self::Vps | Self::Sps | Self::Pps)
    }

    pub const fn is_key_frame(self) -> bool {
        matches!(self, Self::KeyFrame)
    }

    /// kinds whose payload ends up at the video decoder.
    pub const fn is_video(self) -> bool {
        matches!(self, Self::VideoFrame | Self::KeyFrame | Self::PngFrame)
    }
}

/// The fixed application datagram header.
///
/// `timestamp` doubles as the frame id: every fragment of one frame carries
/// the same host-epoch nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub timestamp: u64,
    pub total_fragments: u32,
    pub fragment_index: u32,
}

impl PacketHeader {
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_proto::{PacketHeader, PacketKind};
    ///
    /// let header = PacketHeader {
    ///     kind: PacketKind::KeyFrame,
    ///     timestamp: 1_000_000_000,
    ///     total_fragments: 3,
    ///     fragment_index: 2,
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    /// header.encode(&mut bytes);
    /// assert_eq!(bytes.len(), 17);
    ///
    /// let (parsed, payload) = PacketHeader::split(&bytes).unwrap();
    /// assert_eq!(parsed, header);
    /// assert!(payload.is_empty());
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u8(self.kind as u8);
        bytes.put_u64(self.timestamp);
        bytes.put_u32(self.total_fragments);
        bytes.put_u32(self.fragment_index);
    }

    /// parse the header off the front of a datagram, returning the payload
    /// that follows it.
    pub fn split(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TooShort);
        }

        let kind = PacketKind::try_from(bytes[0]).map_err(|_| Error::UnknownKind(bytes[0]))?;
        let timestamp = u64::from_be_bytes(bytes[1..9].try_into().map_err(|_| Error::TooShort)?);
        let total_fragments =
            u32::from_be_bytes(bytes[9..13].try_into().map_err(|_| Error::TooShort)?);
        let fragment_index =
            u32::from_be_bytes(bytes[13..17].try_into().map_err(|_| Error::TooShort)?);

        Ok((
            Self {
                kind,
                timestamp,
                total_fragments,
                fragment_index,
            },
            &bytes[HEADER_SIZE..],
        ))
    }
}

/// encode the `0xFE` registration datagram, shared by the control channel
/// heartbeat and the input socket.
pub fn encode_registration(listen_port: u16, user_id: &str, bytes: &mut BytesMut) {
    bytes.clear();
    bytes.put_u8(control::REGISTRATION);
    bytes.put_u16(listen_port);
    bytes.put(user_id.as_bytes());
}

/// interpret a datagram as an auth verdict, if it is one.
pub fn parse_auth_result(bytes: &[u8]) -> Option<bool> {
    if bytes.len() >= 2 && bytes[0] == control::AUTH_RESULT {
        Some(bytes[1] == 0x01)
    } else {
        None
    }
}
