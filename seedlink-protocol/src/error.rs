#[derive(Debug, thiserror::Error)]
pub enum SeedlinkError {
    #[error("frame too short: expected {expected}, actual {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("invalid signature: expected {expected:?}, actual {actual:?}")]
    InvalidSignature {
        expected: &'static str,
        actual: [u8; 2],
    },

    #[error("invalid message number: {0}")]
    InvalidMessageNumber(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("payload length mismatch: expected {expected}, actual {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },

    #[error("miniseed error: {0}")]
    Miniseed(#[from] miniseed_rs::MseedError),
}

pub type Result<T> = std::result::Result<T, SeedlinkError>;
