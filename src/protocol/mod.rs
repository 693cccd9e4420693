//! Wire codec for the scene protocol.
//!
//! Clients send length-prefixed request frames over a Unix stream socket and
//! receive one fixed 8-byte reply per frame, in order. See [`messages`] for
//! the payload layouts and [`framing`] for stream reassembly and descriptor
//! association.

pub mod framing;
pub mod messages;
pub mod types;

pub use framing::{Frame, FrameDecoder};
pub use messages::{
    decode_request, encode_frame, message_type, DecodeError, EncodeError, Reply, Request,
};
pub use types::{
    Binding, ElementType, ErrorCode, Matrix, MatrixKind, RenderEntry, TextureFormat, TextureKind,
    UpdateMode, IDENTITY,
};
