//! Envelope framing, CBOR headers and frame buffers for mesh sessions.
//!
//! The session layer treats this crate as an opaque, ordered buffer of frames:
//! raw chunks go into a [`FramedBuffer`], whole [`Envelope`]s come out, and
//! encoded frames destined for a remote wait in a [`FrameQueue`].
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 header_len       | CBOR header length         |
//! | u32 payload_len      | payload length             |
//! | u32 crc32            | over header and payload    |
//! | header (CBOR)        | id, kind, recipient, attrs |
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod envelope;
pub mod error;
pub mod frame;

// Re-export main types
pub use buffer::{FrameQueue, FramedBuffer, Queue};
pub use envelope::{Envelope, Header, MessageKind};
pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, FRAME_PREFIX_SIZE, MAX_HEADER_SIZE};
