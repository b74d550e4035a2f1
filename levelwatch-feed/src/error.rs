use levelwatch_integration::error::SocketError;
use thiserror::Error;

/// All errors generated in `levelwatch-feed`.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("SocketError: {0}")]
    Socket(#[from] SocketError),

    #[error("broker rejected authentication: {0}")]
    AuthRejected(String),

    #[error("no broker credentials available to authenticate the upstream socket")]
    CredentialsUnavailable,

    #[error("upstream read deadline elapsed")]
    ReadDeadline,

    #[error("decode error run exceeded threshold ({0} consecutive failures)")]
    DecodeErrorRun(u32),

    #[error("upstream transport closed")]
    TransportClosed,
}

/// Frame-level decode failures. A single bad frame is logged and dropped; only a
/// run of them tears the connection down.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CodecError {
    #[error("binary frame truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("unknown exchange segment code: {0}")]
    UnknownSegment(u8),

    #[error("packet count {count} inconsistent with frame length {len}")]
    CountMismatch { count: u16, len: usize },

    #[error("price out of range: {0} paise")]
    PriceOutOfRange(i64),

    #[error("timestamp out of range: {0} ms")]
    TimestampOutOfRange(i64),
}
