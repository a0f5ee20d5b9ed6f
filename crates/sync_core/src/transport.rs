use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};

use crate::error::{AuthError, ConnectError, TransportError};

#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, request: &ClientRequest) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// One live connection, split so reads and writes can proceed concurrently.
pub struct TransportConnection {
    pub sink: Box<dyn TransportSink>,
    pub events: BoxStream<'static, Result<ServerEvent, TransportError>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, credential: &str)
        -> Result<TransportConnection, ConnectError>;
}

pub struct WsTransport;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct WsSink {
    inner: futures::stream::SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, request: &ClientRequest) -> Result<(), TransportError> {
        let text = serde_json::to_string(request)
            .map_err(|err| TransportError::Send(format!("encode {}: {err}", request.method_name())))?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = self.inner.close().await {
            debug!("websocket close failed: {err}");
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
    ) -> Result<TransportConnection, ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}")).map_err(|_| {
            AuthError {
                reason: "credential contains invalid header characters".into(),
            }
        })?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _) = connect_async(request).await.map_err(map_handshake_error)?;
        let (sink, reader) = stream.split();

        let events = reader
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => Some(Ok(event)),
                        Err(err) => {
                            warn!("dropping undecodable hub frame: {err}");
                            None
                        }
                    },
                    Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Stream(err.to_string()))),
                }
            })
            .boxed();

        Ok(TransportConnection {
            sink: Box::new(WsSink { inner: sink }),
            events,
        })
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == 401 || response.status() == 403 =>
        {
            AuthError {
                reason: format!("hub handshake returned {}", response.status()),
            }
            .into()
        }
        tungstenite::Error::Url(err) => TransportError::InvalidUrl(err.to_string()).into(),
        other => TransportError::Connect(other.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_rejections_map_to_auth_errors() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .expect("response");
        let err = map_handshake_error(tungstenite::Error::Http(response));
        assert!(matches!(err, ConnectError::Auth(_)), "unexpected: {err:?}");

        let err = map_handshake_error(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, ConnectError::Transport(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn unreachable_hub_is_a_transport_error() {
        let err = WsTransport
            .connect("ws://127.0.0.1:1/hubs/chat", "token")
            .await
            .err()
            .expect("connect must fail");
        assert!(matches!(err, ConnectError::Transport(_)), "unexpected: {err:?}");
    }
}
