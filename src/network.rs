//! Peer-to-peer networking: wire messages and the peer manager.
//!
//! Peers exchange newline-delimited JSON frames over plain TCP. The
//! [`PeerManager`] owns the connections and hands every inbound frame to the
//! callback registered for its [`MessageType`].

pub mod message;
pub mod peer;

pub use message::*;
pub use peer::*;
