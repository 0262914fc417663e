use thiserror::Error;

/// Error taxonomy for codestream parsing and decoding.
///
/// Errors are propagated outward with `?`; the variants that are
/// recovered locally (unknown markers, per-block Tier-1 failures) are
/// logged with their codestream byte position and do not normally
/// surface to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The stream ended in the middle of a marker or payload.
    #[error("codestream truncated at offset {0}")]
    Truncated(u64),

    /// Seek requested on a transport that cannot seek.
    #[error("stream does not support seeking")]
    Unseekable,

    /// Marker length out of range or body inconsistent with its length.
    #[error("malformed {marker} marker segment at offset {offset}: {reason}")]
    MalformedMarker {
        marker: &'static str,
        offset: u64,
        reason: String,
    },

    /// Marker encountered in a state where it is not legal.
    #[error("marker 0x{marker:04X} is not compliant with its expected position (offset {offset})")]
    MarkerOutOfPlace { marker: u16, offset: u64 },

    /// Capability or style bit that this decoder does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A parameter violates a bound imposed by the standard.
    #[error("parameter out of range: {0}")]
    ParameterOutOfRange(String),

    /// Main or tile QCD step-size count inconsistent with the
    /// decomposition count.
    #[error("quantization scope violation: {0}")]
    QuantizationScopeViolation(String),

    /// Segment-level failure inside the arithmetic decoder. The block
    /// is delivered partially decoded.
    #[error("tier-1 decode failure: {0}")]
    T1DecodeFailure(String),

    /// Buffer allocation refused (size would exceed the sanity cap).
    #[error("allocation failure: {0}")]
    AllocationFailure(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub(crate) fn malformed(marker: &'static str, offset: u64, reason: impl Into<String>) -> Self {
        CodecError::MalformedMarker {
            marker,
            offset,
            reason: reason.into(),
        }
    }
}
