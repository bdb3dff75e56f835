//! ## Visor application datagram protocol
//!
//! The host streams video as fragmented, encrypted UDP datagrams and
//! accepts a small set of single-byte control datagrams plus an input-event
//! stream in the opposite direction. This crate owns every byte layout on
//! that path: the 17-byte packet header, the packet-kind registry, the
//! out-of-band control bytes, the input-event encodings and the
//! omniscient-state JSON document.
//!
//! ### Packet layout
//!
//! ```text
//! 0        1                 9                13               17
//! +--------+-----------------+----------------+----------------+----
//! |  kind  |  timestamp(ns)  | total_fragments| fragment_index | payload
//! +--------+-----------------+----------------+----------------+----
//! ```
//!
//! All multi-byte integers and float bit patterns are big-endian.

pub mod input;
pub mod packet;
pub mod state;

pub use packet::{HEADER_SIZE, PacketHeader, PacketKind, control};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// datagram shorter than the fixed header.
    TooShort,
    /// packet kind byte outside the registry.
    UnknownKind(u8),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
