use bytes::{BufMut, BytesMut};

use crate::Error;

/// The ChannelData Message.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// /                       Application Data                        /
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The Length field counts the application data only, not the 4-byte
/// header. Over UDP no trailing padding is sent.
#[derive(Debug)]
pub struct ChannelData<'a> {
    pub number: u16,
    pub bytes: &'a [u8],
}

impl<'a> ChannelData<'a> {
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_stun::channel::ChannelData;
    ///
    /// let payload: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4000,
    ///     bytes: &payload,
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0x40, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);
    }

    /// # Unit Test
    ///
    /// ```
    /// use visor_stun::channel::ChannelData;
    ///
    /// let buffer = [0x40u8, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
    ///
    /// let data = ChannelData::decode(&buffer).unwrap();
    /// assert_eq!(data.number, 0x4000);
    /// assert_eq!(data.bytes, &buffer[4..]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes([bytes[0], bytes[1]]);
        if !(0x4000..=0x7FFF).contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            number,
            bytes: &bytes[4..4 + size],
        })
    }
}
