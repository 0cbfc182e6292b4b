//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Frame checksum mismatch
    #[error("frame checksum mismatch")]
    Checksum,

    /// Header could not be encoded as CBOR
    #[error("cbor header encode failed: {0}")]
    HeaderEncode(String),

    /// Header could not be decoded from CBOR
    #[error("cbor header invalid: {0}")]
    HeaderDecode(String),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
