use std::future;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use shared::{domain::UserId, error::TransportError};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ConnectError;

/// Raw inbound frames, in arrival order. The stream ends when the peer closes.
pub type InboundFrames = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// An established bidirectional link to the chat backend.
///
/// Dropping `outbound` asks the transport to close the connection.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: InboundFrames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn open(&self, request: HandshakeRequest) -> Result<TransportLink>;
}

/// Builds the handshake URL: the caller's address with the user id appended
/// as a query parameter. http(s) addresses are upgraded to ws(s).
pub fn handshake_url(
    address: &str,
    user_id: &UserId,
    user_id_param: &str,
) -> std::result::Result<Url, ConnectError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ConnectError::MissingAddress);
    }
    if user_id.is_blank() {
        return Err(ConnectError::MissingUserId);
    }

    let mut url = Url::parse(address).map_err(|source| ConnectError::InvalidAddress {
        address: address.to_string(),
        source,
    })?;
    let upgraded = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    };
    if let Some(scheme) = upgraded {
        url.set_scheme(scheme)
            .map_err(|()| ConnectError::UnsupportedScheme(url.scheme().to_string()))?;
    }

    url.query_pairs_mut()
        .append_pair(user_id_param, user_id.as_str());
    Ok(url)
}

pub struct WebSocketConnector;

#[async_trait]
impl ChatConnector for WebSocketConnector {
    async fn open(&self, request: HandshakeRequest) -> Result<TransportLink> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket request: {}", request.url))?;
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid handshake header name: {name}"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid handshake header value for {name}"))?;
            ws_request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", request.url))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "chat: websocket send failed");
                    return;
                }
            }
            if let Err(err) = ws_writer.close().await {
                debug!(error = %err, "chat: websocket close handshake failed");
            }
        });

        let inbound = ws_reader
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                    Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
                })
            })
            .boxed();

        Ok(TransportLink { outbound, inbound })
    }
}
