use ahash::AHashMap;
use bytes::Bytes;
use tokio::time::Instant;

use proto::{PacketHeader, PacketKind};

use crate::crypto::SessionCipher;

/// key-frame entries survive cleanup this long, regardless of mode.
const KEY_FRAME_TIMEOUT_MS: u64 = 5_000;

/// consecutive timeout drops before the host is asked for a key-frame.
const KEY_FRAME_REQUEST_AFTER: u32 = 5;

/// delivered video frame ids remembered to suppress late duplicates.
const DELIVERED_MEMORY: usize = 32;

/// The transport path shapes the drop policy: relayed paths jitter more,
/// so both the age threshold and the per-frame timeout widen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Direct,
    Relay,
}

impl TransportMode {
    /// fragments older than this (against the newest seen frame) are late
    /// enough to drop. Timestamps are host nanoseconds.
    const fn age_threshold_ns(self) -> u64 {
        match self {
            Self::Direct => 200_000_000,
            Self::Relay => 500_000_000,
        }
    }

    /// wall-clock bound on an incomplete assembly.
    const fn timeout_ms(self) -> u64 {
        match self {
            Self::Direct => 200,
            Self::Relay => 2_000,
        }
    }
}

/// A reassembled, decrypted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: PacketKind,
    pub timestamp: u64,
    pub bytes: Vec<u8>,
}

/// What one datagram produced.
#[derive(Debug, Default)]
pub struct Push {
    pub frame: Option<Frame>,
    /// five consecutive assemblies just timed out; send `0xFC` now.
    pub request_key_frame: bool,
}

struct Entry {
    kind: PacketKind,
    expected: u32,
    received: AHashMap<u32, Bytes>,
    started_at: Instant,
}

impl Entry {
    fn new(kind: PacketKind, expected: u32) -> Self {
        Self {
            kind,
            expected,
            received: AHashMap::with_capacity(expected as usize),
            started_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.expected
    }

    /// concatenation in ascending fragment-index order.
    fn assemble(mut self) -> Vec<u8> {
        let total: usize = self.received.values().map(|it| it.len()).sum();
        let mut bytes = Vec::with_capacity(total);
        for index in 0..self.expected {
            if let Some(fragment) = self.received.remove(&index) {
                bytes.extend_from_slice(&fragment);
            }
        }

        bytes
    }
}

/// Per-frame reassembly with an age-based drop policy, per-frame timeout,
/// key-frame protection and automatic key-frame requests.
///
/// Owned by the listener task; fragments are fed in arrival order and
/// completed frames come back decrypted. Entries are keyed by the packet
/// timestamp, which doubles as the frame id.
pub struct FrameAssembler {
    mode: TransportMode,
    entries: AHashMap<u64, Entry>,
    latest_frame_id: u64,
    consecutive_timeouts: u32,
    delivered: Vec<u64>,
}

impl FrameAssembler {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            entries: AHashMap::new(),
            latest_frame_id: 0,
            consecutive_timeouts: 0,
            delivered: Vec::with_capacity(DELIVERED_MEMORY),
        }
    }

    pub fn latest_frame_id(&self) -> u64 {
        self.latest_frame_id
    }

    /// drop all assembly state, e.g. when the codec parameters change and
    /// in-flight frames belong to a decoder session that no longer exists.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.delivered.clear();
        self.consecutive_timeouts = 0;
        self.latest_frame_id = 0;
    }

    /// feed one datagram.
    pub fn push(
        &mut self,
        header: PacketHeader,
        payload: Bytes,
        cipher: Option<&SessionCipher>,
    ) -> Push {
        let request_key_frame = self.evict_expired();
        let mut push = Push {
            frame: None,
            request_key_frame,
        };

        let PacketHeader {
            kind,
            timestamp,
            total_fragments,
            fragment_index,
        } = header;

        if total_fragments == 0 || fragment_index >= total_fragments {
            log::debug!(
                "inconsistent fragment header dropped: total={}, index={}",
                total_fragments,
                fragment_index
            );
            return push;
        }

        // reserved; parsed and counted only.
        if kind == PacketKind::FecParity {
            return push;
        }

        if kind.is_video() && self.delivered.contains(&timestamp) {
            return push;
        }

        // parameter sets always pass: they initialize the decoder and a
        // stale-looking timestamp must not starve it.
        if !kind.is_parameter_set()
            && self.is_older(timestamp)
            && !kind.is_key_frame()
            && !self.entries.contains_key(&timestamp)
        {
            return push;
        }

        // the newest-frame marker follows video frames only, and holds
        // still while a key-frame assembly is in flight so fresh P-frames
        // cannot age it out.
        if kind.is_video() && timestamp > self.latest_frame_id && !self.key_frame_in_progress() {
            self.latest_frame_id = timestamp;
        }

        // single-packet fast path: no entry, straight to completion.
        if total_fragments == 1 {
            push.frame = self.complete(kind, timestamp, payload.to_vec(), cipher);
            return push;
        }

        let entry = self
            .entries
            .entry(timestamp)
            .or_insert_with(|| Entry::new(kind, total_fragments));

        if fragment_index >= entry.expected {
            return push;
        }

        // duplicates overwrite; they never re-emit a finished frame
        // because completion removes the entry.
        entry.received.insert(fragment_index, payload);

        if entry.is_complete() {
            if let Some(entry) = self.entries.remove(&timestamp) {
                push.frame = self.complete(entry.kind, timestamp, entry.assemble(), cipher);
            }
        }

        push
    }

    fn is_older(&self, timestamp: u64) -> bool {
        timestamp < self.latest_frame_id
            && self.latest_frame_id - timestamp > self.mode.age_threshold_ns()
    }

    fn key_frame_in_progress(&self) -> bool {
        self.entries.values().any(|it| it.kind.is_key_frame())
    }

    /// evict entries past their deadline; returns whether the timeout
    /// counter just hit the key-frame-request threshold.
    fn evict_expired(&mut self) -> bool {
        let now = Instant::now();
        let timeout_ms = self.mode.timeout_ms();

        let mut evicted = 0u32;
        self.entries.retain(|timestamp, entry| {
            let bound = if entry.kind.is_key_frame() {
                KEY_FRAME_TIMEOUT_MS
            } else {
                timeout_ms
            };

            if now.duration_since(entry.started_at).as_millis() as u64 > bound {
                log::debug!(
                    "assembly timed out: frame={}, kind={:?}, got={}/{}",
                    timestamp,
                    entry.kind,
                    entry.received.len(),
                    entry.expected
                );
                evicted += 1;
                false
            } else {
                true
            }
        });

        let mut request = false;
        for _ in 0..evicted {
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= KEY_FRAME_REQUEST_AFTER {
                self.consecutive_timeouts = 0;
                request = true;
            }
        }

        request
    }

    /// decrypt and hand the finished frame up; a decryption failure
    /// discards the frame without propagating (the resulting gap drives
    /// the key-frame request path instead).
    fn complete(
        &mut self,
        kind: PacketKind,
        timestamp: u64,
        bytes: Vec<u8>,
        cipher: Option<&SessionCipher>,
    ) -> Option<Frame> {
        let bytes = if kind == PacketKind::Handshake {
            bytes
        } else {
            match cipher {
                Some(cipher) => match cipher.decrypt(&bytes) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        log::warn!("frame dropped, decryption failed: frame={}", timestamp);
                        return None;
                    }
                },
                None => {
                    log::debug!("frame dropped, no session key yet: frame={}", timestamp);
                    return None;
                }
            }
        };

        self.consecutive_timeouts = 0;

        if kind.is_video() {
            if self.delivered.len() >= DELIVERED_MEMORY {
                self.delivered.remove(0);
            }
            self.delivered.push(timestamp);
        }

        Some(Frame {
            kind,
            timestamp,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyExchange;
    use std::time::Duration;

    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        (
            SessionCipher::new(&a.derive(&b.public_key()).unwrap()),
            SessionCipher::new(&b.derive(&a.public_key()).unwrap()),
        )
    }

    fn header(kind: PacketKind, timestamp: u64, total: u32, index: u32) -> PacketHeader {
        PacketHeader {
            kind,
            timestamp,
            total_fragments: total,
            fragment_index: index,
        }
    }

    /// encrypt a frame and split the ciphertext into `parts` fragments.
    fn fragments(cipher: &SessionCipher, plaintext: &[u8], parts: usize) -> Vec<Bytes> {
        let sealed = cipher.encrypt(plaintext).unwrap();
        let size = sealed.len().div_ceil(parts);
        sealed
            .chunks(size)
            .map(Bytes::copy_from_slice)
            .collect()
    }

    #[tokio::test]
    async fn key_frame_reassembles_out_of_order() {
        // fragments arrive [2, 0, 1]; one frame comes out, equal to
        // the original bytes, and the timeout counter is untouched.
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let plaintext = vec![0xABu8; 1800];
        let parts = fragments(&host, &plaintext, 3);

        for index in [2u32, 0, 1] {
            let push = assembler.push(
                header(PacketKind::KeyFrame, 1_000_000_000, 3, index),
                parts[index as usize].clone(),
                Some(&client),
            );

            if index == 1 {
                let frame = push.frame.expect("complete on the last fragment");
                assert_eq!(frame.kind, PacketKind::KeyFrame);
                assert_eq!(frame.timestamp, 1_000_000_000);
                assert_eq!(frame.bytes, plaintext);
            } else {
                assert!(push.frame.is_none());
            }
            assert!(!push.request_key_frame);
        }

        assert_eq!(assembler.consecutive_timeouts, 0);
        assert!(assembler.entries.is_empty());
    }

    #[tokio::test]
    async fn single_fragment_bypasses_the_map() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let sealed = Bytes::from(host.encrypt(b"frame").unwrap());
        let push = assembler.push(
            header(PacketKind::VideoFrame, 42, 1, 0),
            sealed,
            Some(&client),
        );

        assert!(push.frame.is_some());
        assert!(assembler.entries.is_empty());
    }

    #[tokio::test]
    async fn age_policy_drops_stale_p_frames_but_not_key_frames() {
        // stale fragments are dropped unless protected, with the
        // threshold checked to the millisecond.
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        // establish latest_frame_id = 1s.
        let sealed = Bytes::from(host.encrypt(b"frame").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );
        assert_eq!(assembler.latest_frame_id(), 1_000_000_000);

        // 300 ms older P-frame fragment, no entry: dropped, no entry made.
        assembler.push(
            header(PacketKind::VideoFrame, 700_000_000, 3, 0),
            Bytes::from_static(b"late"),
            Some(&client),
        );
        assert!(assembler.entries.is_empty());

        // the same fragment as a key-frame is protected.
        assembler.push(
            header(PacketKind::KeyFrame, 700_000_000, 3, 0),
            Bytes::from_static(b"late"),
            Some(&client),
        );
        assert_eq!(assembler.entries.len(), 1);
        assembler.clear();

        // boundary: 199 ms old is accepted, 201 ms old is not.
        let sealed = Bytes::from(host.encrypt(b"frame").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );

        assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000 - 199_000_000, 2, 0),
            Bytes::from_static(b"x"),
            Some(&client),
        );
        assert_eq!(assembler.entries.len(), 1);

        assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000 - 201_000_000, 2, 0),
            Bytes::from_static(b"x"),
            Some(&client),
        );
        assert_eq!(assembler.entries.len(), 1);
    }

    #[tokio::test]
    async fn late_fragments_of_inflight_frames_are_accepted() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let plaintext = vec![7u8; 600];
        let parts = fragments(&host, &plaintext, 2);

        // first fragment while the frame is fresh.
        assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000, 2, 0),
            parts[0].clone(),
            Some(&client),
        );

        // a much newer frame advances the marker past the threshold.
        let sealed = Bytes::from(host.encrypt(b"newer").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 2_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );

        // the straggler still lands because its entry exists.
        let push = assembler.push(
            header(PacketKind::VideoFrame, 1_000_000_000, 2, 1),
            parts[1].clone(),
            Some(&client),
        );
        assert_eq!(push.frame.expect("completes").bytes, plaintext);
    }

    #[tokio::test]
    async fn parameter_sets_bypass_the_age_check() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let sealed = Bytes::from(host.encrypt(b"frame").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 10_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );

        // an SPS stamped far in the past still comes through.
        let sealed = Bytes::from(host.encrypt(&[0x67, 0x64]).unwrap());
        let push = assembler.push(header(PacketKind::Sps, 1, 1, 0), sealed, Some(&client));
        assert_eq!(push.frame.expect("delivered").kind, PacketKind::Sps);
    }

    #[tokio::test(start_paused = true)]
    async fn key_frame_assembly_blocks_latest_advance_and_survives_cleanup() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let plaintext = vec![1u8; 1200];
        let parts = fragments(&host, &plaintext, 2);

        assembler.push(
            header(PacketKind::KeyFrame, 1_000_000_000, 2, 0),
            parts[0].clone(),
            Some(&client),
        );

        assert_eq!(assembler.latest_frame_id(), 1_000_000_000);

        // fresh P-frames arrive while the key-frame is partial: the
        // marker must not move past it.
        let sealed = Bytes::from(host.encrypt(b"p").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 5_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );
        assert_eq!(assembler.latest_frame_id(), 1_000_000_000);

        // 300 ms later a normal entry would be gone; the key-frame holds.
        tokio::time::advance(Duration::from_millis(300)).await;
        let push = assembler.push(
            header(PacketKind::KeyFrame, 1_000_000_000, 2, 1),
            parts[1].clone(),
            Some(&client),
        );
        assert_eq!(push.frame.expect("still alive").bytes, plaintext);

        // once no key-frame is in flight the marker advances again.
        let sealed = Bytes::from(host.encrypt(b"p").unwrap());
        assembler.push(
            header(PacketKind::VideoFrame, 6_000_000_000, 1, 0),
            sealed,
            Some(&client),
        );
        assert_eq!(assembler.latest_frame_id(), 6_000_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn key_frame_entries_age_out_after_five_seconds() {
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        assembler.push(
            header(PacketKind::KeyFrame, 1, 2, 0),
            Bytes::from_static(b"half"),
            None,
        );
        assert_eq!(assembler.entries.len(), 1);

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assembler.push(
            header(PacketKind::Metadata, 2, 2, 0),
            Bytes::from_static(b"m"),
            None,
        );
        assert!(assembler.entries.contains_key(&1));

        tokio::time::advance(Duration::from_millis(200)).await;
        assembler.push(
            header(PacketKind::Metadata, 3, 2, 0),
            Bytes::from_static(b"m"),
            None,
        );
        assert!(!assembler.entries.contains_key(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn five_timeouts_request_one_key_frame() {
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        // five incomplete P-frame assemblies.
        for i in 0..5u64 {
            assembler.push(
                header(PacketKind::VideoFrame, 1_000_000 * i, 2, 0),
                Bytes::from_static(b"half"),
                None,
            );
        }
        assert_eq!(assembler.entries.len(), 5);

        tokio::time::advance(Duration::from_millis(300)).await;

        // the next arrival evicts all five and fires exactly one request.
        let push = assembler.push(
            header(PacketKind::VideoFrame, 10_000_000, 2, 0),
            Bytes::from_static(b"half"),
            None,
        );
        assert!(push.request_key_frame);
        assert_eq!(assembler.consecutive_timeouts, 0);

        // and the one after does not fire again.
        let push = assembler.push(
            header(PacketKind::VideoFrame, 11_000_000, 2, 1),
            Bytes::from_static(b"half"),
            None,
        );
        assert!(!push.request_key_frame);
    }

    #[tokio::test]
    async fn duplicates_never_re_emit_a_delivered_frame() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let plaintext = vec![9u8; 100];
        let parts = fragments(&host, &plaintext, 2);

        assembler.push(
            header(PacketKind::VideoFrame, 77, 2, 0),
            parts[0].clone(),
            Some(&client),
        );
        let push = assembler.push(
            header(PacketKind::VideoFrame, 77, 2, 1),
            parts[1].clone(),
            Some(&client),
        );
        assert!(push.frame.is_some());

        // a duplicate of fragment 1 afterwards: no new entry, no re-emit.
        let push = assembler.push(
            header(PacketKind::VideoFrame, 77, 2, 1),
            parts[1].clone(),
            Some(&client),
        );
        assert!(push.frame.is_none());
        assert!(assembler.entries.is_empty());
    }

    #[tokio::test]
    async fn decryption_failure_discards_silently() {
        let (host, client) = cipher_pair();
        let mut assembler = FrameAssembler::new(TransportMode::Direct);

        let mut sealed = host.encrypt(b"frame").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let push = assembler.push(
            header(PacketKind::VideoFrame, 5, 1, 0),
            Bytes::from(sealed),
            Some(&client),
        );
        assert!(push.frame.is_none());
        assert!(!push.request_key_frame);
    }
}
