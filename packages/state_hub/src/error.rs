/// Errors produced while framing or parsing control messages
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload of {0} bytes does not fit a hex4 length prefix")]
    PayloadTooLarge(usize),

    #[error("invalid hex4 length prefix: {0:?}")]
    InvalidLength(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
