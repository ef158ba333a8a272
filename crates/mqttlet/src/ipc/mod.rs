//! Worker IPC: line framing and the JSON envelope contract.
//!
//! - **codec**: newline framing over AsyncRead/AsyncWrite ([`FrameReader`])
//! - **protocol**: [`Envelope`] parsing, canonical re-encoding, topic rewriting

pub mod codec;
pub mod protocol;

pub use codec::{FrameReader, LineCodec, frame_reader};
pub use protocol::{Envelope, FrameParseError};
