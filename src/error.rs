use thiserror::Error;

/// Error taxonomy for the transcoding service.
///
/// Packet-layer failures are recovered locally and never surfaced through
/// this type; negotiation-layer failures are returned to the client; codec
/// initialization failures are fatal to their pipeline only.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Requested or received MIME type is not in the codec registry.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A depayloader or SDP attribute failed to parse.
    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("decoder init failed: {0}")]
    DecoderInit(String),

    #[error("encoder init failed: {0}")]
    EncoderInit(String),

    /// The jitter buffer was full and the oldest packet was evicted.
    #[error("jitter buffer full, oldest packet dropped")]
    Backpressure,

    /// The 32-to-64-bit timestamp mapping reached an illegal state.
    #[error("illegal RTP timestamp jump")]
    TimestampDiscontinuity,

    /// Invalid SDP or ICE candidate. The session stays open.
    #[error("signalling failed: {0}")]
    Signalling(String),

    #[error("cancelled")]
    Cancelled,

    /// The pipeline no longer accepts input.
    #[error("pipeline closed")]
    Closed,
}

impl From<TranscodeError> for tonic::Status {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::UnsupportedCodec(_) | TranscodeError::Signalling(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            TranscodeError::Cancelled => tonic::Status::cancelled(err.to_string()),
            TranscodeError::Closed => tonic::Status::failed_precondition(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
