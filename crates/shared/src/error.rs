use thiserror::Error;

/// A single inbound frame that could not be turned into an event.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is a JSON {found}, expected an object")]
    NotAnObject { found: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown message status '{0}'")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("websocket receive failed: {0}")]
    Receive(String),
}
