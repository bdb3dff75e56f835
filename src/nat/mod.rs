//! NAT-traversal engine: reflexive-address discovery, priority-ordered
//! candidate trials with UDP hole punching, and the TURN relay fallback.

pub mod ice;
pub mod stun;
pub mod turn;

pub use ice::{Candidate, CandidateKind, IceAgent, IceState, Path};
pub use stun::{NatType, Reflexive, StunClient};
pub use turn::{TurnClient, TurnConfig};
