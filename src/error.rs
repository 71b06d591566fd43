use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarlinError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("event handler fault: {0}")]
    Handler(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("stale connection: {0}s since last frame")]
    StaleConnection(u64),
}

pub type Result<T> = std::result::Result<T, MarlinError>;
