use serde::{Deserialize, Serialize};

/// The omniscient-state document: a JSON snapshot of host, network and
/// client metrics plus the encoder parameters the host is currently
/// targeting. Delivered inside a kind-0x50 packet.
///
/// The mode fields (`engine_mode`, `codec_name`, `profile_name`) stay
/// strings: the host adds values between client releases and an enum here
/// would turn every addition into a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OmniscientState {
    pub engine_mode: String,
    pub codec_name: String,
    pub profile_name: String,
    pub host: HostMetrics,
    pub network: NetworkMetrics,
    pub client: ClientMetrics,
    pub encoder: EncoderTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostMetrics {
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub capture_fps: f64,
    pub encode_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkMetrics {
    pub rtt_ms: f64,
    pub packet_loss: f64,
    pub bitrate_kbps: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientMetrics {
    pub decode_fps: f64,
    pub dropped_frames: u64,
    pub queue_depth: u32,
}

/// The encoder parameters the host currently targets. Reported for
/// observability only; the client never negotiates them back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncoderTarget {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub keyframe_interval: u32,
}

impl OmniscientState {
    /// decode a state snapshot from a packet payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
