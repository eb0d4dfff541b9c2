#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] seedlink_hub_protocol::SeedlinkError),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("invalid payload length: expected 512, got {0}")]
    InvalidPayloadLength(usize),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(
            ServerError::InvalidPayloadLength(100).to_string(),
            "invalid payload length: expected 512, got 100"
        );
        let bind = ServerError::Bind(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "in use",
        ));
        assert_eq!(bind.to_string(), "bind failed: in use");
    }
}
