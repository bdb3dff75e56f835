use proto::PacketKind;

use crate::assembler::Frame;

#[derive(Debug)]
pub enum Error {
    /// the platform decoder rejected input; surfaced to observers.
    Decoder(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decoder(detail) => write!(f, "decoder: {}", detail),
        }
    }
}

/// The pluggable platform decoder.
///
/// Its sole obligation is Annex-B H.264/HEVC input: parameter sets are
/// pushed through the `set_*` calls whenever a decoder session is (re)built
/// and access units follow through [`VideoDecoder::decode`]. Decoded
/// pictures are the implementation's to deliver (frame-ready callback,
/// texture upload, whatever the platform wants).
pub trait VideoDecoder: Send {
    fn set_vps(&mut self, bytes: &[u8]);
    fn set_sps(&mut self, bytes: &[u8]);
    fn set_pps(&mut self, bytes: &[u8]);

    /// decode one Annex-B access unit with its presentation timestamp.
    fn decode(&mut self, annex_b: &[u8], pts: u64) -> Result<(), String>;

    /// a full-resolution PNG still outside the codec path.
    fn still(&mut self, _bytes: &[u8], _pts: u64) {}
}

/// split an Annex-B byte stream into NAL units (start codes stripped).
/// Both 3- and 4-byte start codes are recognized.
pub fn split_annex_b(bytes: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;

    while i + 2 < bytes.len() {
        if bytes[i] == 0 && bytes[i + 1] == 0 && bytes[i + 2] == 1 {
            let code_start = if i > 0 && bytes[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                units.push(&bytes[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s <= bytes.len() {
            units.push(&bytes[s..]);
        }
    }

    units.retain(|it| !it.is_empty());
    units
}

fn h264_nal_type(byte: u8) -> u8 {
    byte & 0x1F
}

fn hevc_nal_type(byte: u8) -> u8 {
    (byte >> 1) & 0x3F
}

fn is_parameter_nal(is_hevc: bool, byte: u8) -> bool {
    if is_hevc {
        matches!(hevc_nal_type(byte), 32 | 33 | 34)
    } else {
        matches!(h264_nal_type(byte), 7 | 8)
    }
}

/// IDR for H.264 (type 5); IDR_W_RADL / IDR_N_LP / CRA for HEVC.
fn is_key_nal(is_hevc: bool, byte: u8) -> bool {
    if is_hevc {
        matches!(hevc_nal_type(byte), 19 | 20 | 21)
    } else {
        h264_nal_type(byte) == 5
    }
}

/// Bridges assembled frames to the platform decoder: owns the three
/// parameter-set buffers, detects the codec from the SPS NAL header,
/// rebuilds the decoder session on any parameter change and gates
/// P-frames until a key-frame restarts the stream.
pub struct DecoderAdapter<D> {
    decoder: D,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    is_hevc: bool,
    session_ready: bool,
    key_frame_seen: bool,
}

impl<D: VideoDecoder> DecoderAdapter<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            vps: None,
            sps: None,
            pps: None,
            is_hevc: false,
            session_ready: false,
            key_frame_seen: false,
        }
    }

    pub fn is_hevc(&self) -> bool {
        self.is_hevc
    }

    /// consume one assembled frame: parameter sets feed the session
    /// bookkeeping, access units go through the key-frame gate to the
    /// decoder, stills bypass the codec path.
    pub fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
        match frame.kind {
            PacketKind::Vps => self.on_vps(&frame.bytes),
            PacketKind::Sps => self.on_sps(&frame.bytes),
            PacketKind::Pps => self.on_pps(&frame.bytes),
            PacketKind::VideoFrame | PacketKind::KeyFrame => {
                self.on_access_unit(&frame.bytes, frame.timestamp)?
            }
            PacketKind::PngFrame => self.decoder.still(&frame.bytes, frame.timestamp),
            _ => {}
        }

        Ok(())
    }

    /// a VPS can only come from an HEVC stream; switching codec throws the
    /// session and the now-stale SPS/PPS away.
    fn on_vps(&mut self, bytes: &[u8]) {
        if !self.is_hevc {
            log::info!("vps received, switching to hevc");
            self.is_hevc = true;
            self.sps = None;
            self.pps = None;
            self.teardown_session();
        } else if self.vps.as_deref() != Some(bytes) {
            self.teardown_session();
        }

        self.vps = Some(bytes.to_vec());
        self.try_build_session();
    }

    fn on_sps(&mut self, bytes: &[u8]) {
        let Some(first) = bytes.first() else {
            return;
        };

        // the NAL header names the codec: H.264 SPS is type 7, HEVC SPS
        // is type 33. A transition invalidates everything buffered.
        let hevc = if h264_nal_type(*first) == 7 {
            false
        } else if hevc_nal_type(*first) == 33 {
            true
        } else {
            log::warn!("sps with unrecognized nal header: byte={:#04x}", first);
            self.is_hevc
        };

        if hevc != self.is_hevc {
            log::info!("codec transition: hevc={}", hevc);
            self.is_hevc = hevc;
            self.vps = None;
            self.pps = None;
            self.teardown_session();
        } else if self.sps.as_deref() != Some(bytes) {
            self.teardown_session();
        }

        self.sps = Some(bytes.to_vec());
        self.try_build_session();
    }

    fn on_pps(&mut self, bytes: &[u8]) {
        if self.pps.as_deref() != Some(bytes) && self.pps.is_some() {
            self.teardown_session();
        }

        self.pps = Some(bytes.to_vec());
        self.try_build_session();
    }

    fn on_access_unit(&mut self, bytes: &[u8], pts: u64) -> Result<(), Error> {
        if !self.session_ready {
            self.try_build_session();
            if !self.session_ready {
                log::debug!("access unit before decoder session, skipped: pts={}", pts);
                return Ok(());
            }
        }

        // strip parameter-set NALs (they arrived on their own packets)
        // and note whether this unit can restart decoding.
        let mut has_key = false;
        let units: Vec<&[u8]> = split_annex_b(bytes)
            .into_iter()
            .filter(|unit| {
                let first = unit[0];
                if is_parameter_nal(self.is_hevc, first) {
                    return false;
                }
                if is_key_nal(self.is_hevc, first) {
                    has_key = true;
                }
                true
            })
            .collect();

        if units.is_empty() {
            return Ok(());
        }

        if has_key {
            self.key_frame_seen = true;
        } else if !self.key_frame_seen {
            // nothing can be decoded before the first key-frame after a
            // session (re)build; P-frames reference pictures we never had.
            log::debug!("p-frame before key-frame, skipped: pts={}", pts);
            return Ok(());
        }

        let mut annex_b = Vec::with_capacity(bytes.len());
        for unit in units {
            annex_b.extend_from_slice(&[0, 0, 0, 1]);
            annex_b.extend_from_slice(unit);
        }

        self.decoder.decode(&annex_b, pts).map_err(Error::Decoder)
    }

    fn teardown_session(&mut self) {
        if self.session_ready {
            log::info!("decoder session destroyed");
        }
        self.session_ready = false;
        self.key_frame_seen = false;
    }

    /// (re)build the session once every required parameter set is on hand:
    /// VPS+SPS+PPS for HEVC, SPS+PPS for H.264.
    fn try_build_session(&mut self) {
        if self.session_ready {
            return;
        }

        let ready = if self.is_hevc {
            self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
        } else {
            self.sps.is_some() && self.pps.is_some()
        };

        if !ready {
            return;
        }

        if let Some(vps) = &self.vps {
            self.decoder.set_vps(vps);
        }
        if let Some(sps) = &self.sps {
            self.decoder.set_sps(sps);
        }
        if let Some(pps) = &self.pps {
            self.decoder.set_pps(pps);
        }

        self.session_ready = true;
        self.key_frame_seen = false;
        log::info!("decoder session built: hevc={}", self.is_hevc);
    }
}
