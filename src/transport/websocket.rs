// MIT License - Copyright (c) 2026 Peter Wright
// WebSocket transport (ws://host:port/KseniaWsock, subprotocol KS_WSOCK)

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ABNORMAL_CLOSE, Connector, Inbound, Transport};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};

/// Opens websocket connections to the panel.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    subprotocol: String,
    timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, subprotocol: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            subprotocol: subprotocol.into(),
            timeout,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.url(), config.subprotocol.clone(), config.connect_timeout)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let mut request = self.url.as_str().into_client_request()?;
        if !self.subprotocol.is_empty() {
            let value = HeaderValue::from_str(&self.subprotocol).map_err(|e| {
                BridgeError::InvalidArgument {
                    details: format!("bad subprotocol {:?}: {}", self.subprotocol, e),
                }
            })?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        debug!("connecting to {}", self.url);
        let (stream, _response) =
            match tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
                .await
            {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(BridgeError::Transport {
                        details: format!("connect to {} timed out after {:?}", self.url, self.timeout),
                    });
                }
            };
        info!("websocket connected to {}", self.url);

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// A connected panel websocket.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Inbound> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text.to_string())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Inbound::Text(text)),
                    Err(_) => warn!("dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Pong(_))) => return Ok(Inbound::Pong),
                // tungstenite queues the pong reply itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (ABNORMAL_CLOSE, String::new()),
                    };
                    return Ok(Inbound::Closed { code, reason });
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(Inbound::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) => Ok(()),
            // Closing an already closed socket is fine
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
