use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport closed")]
    Closed,
    #[error("channel closed before the connection opened")]
    ManuallyClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_errors_convert_and_render() {
        let err: ChannelError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, ChannelError::WebSocket(_)));
        assert!(err.to_string().starts_with("websocket error:"));

        let err = ChannelError::ConnectTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "connect timed out after 10s");
    }
}
