use thiserror::Error;

/// Reasons a `connect` call is abandoned before any network activity.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("chat address is empty")]
    MissingAddress,
    #[error("user id is empty")]
    MissingUserId,
    #[error("invalid chat address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("chat address must use ws://, wss://, http:// or https://, got '{0}'")]
    UnsupportedScheme(String),
}
