//! burrow-core: shared library for the burrow tunnel.
//!
//! Provides the control-plane message types and CBOR framing, the 4-digit
//! pairing token, and the splice engine (bidirectional copy with throughput
//! sampling) used on both the server and the agent side.

pub mod codec;
pub mod error;
pub mod messages;
pub mod pair;
pub mod pool;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{read_frame, write_frame, FrameDecoder};
pub use error::{BurrowError, BurrowResult};
pub use messages::{ClientEvent, ControlRequest, ControlResponse, ErrorCode};
pub use pair::{ConnPair, PairHandle};
pub use token::{Token, TokenCounter, TOKEN_LEN};
