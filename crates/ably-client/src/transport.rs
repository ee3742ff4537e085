//! Realtime transport seam: a [`Dialer`] opens a framed bidirectional stream
//! to a realtime endpoint. The default dialer speaks WebSocket; tests and
//! embedders may substitute their own.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::Error;

/// A framed, bidirectional, already-connected transport.
pub trait Transport: Send {
    /// Send one frame. `binary` selects the binary/text framing where the
    /// underlying transport distinguishes them.
    fn send(&mut self, data: Vec<u8>, binary: bool) -> BoxFuture<'_, Result<(), Error>>;

    /// Receive the next frame. `None` means the transport closed.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>, Error>>>;

    /// Close the transport, best effort.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens transports. Dial failures must surface within `timeout`.
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        url: &str,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, Error>>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// The default WebSocket dialer.
pub(crate) struct WebsocketDialer;

impl Dialer for WebsocketDialer {
    fn dial(
        &self,
        url: &str,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, Error>> {
        let url = url.to_string();
        Box::pin(async move {
            let connect = tokio_tungstenite::connect_async(url);
            let (ws, _resp) = tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::Timeout)??;
            Ok(Box::new(WebsocketTransport { ws }) as Box<dyn Transport>)
        })
    }
}

struct WebsocketTransport {
    ws: WsStream,
}

impl Transport for WebsocketTransport {
    fn send(&mut self, data: Vec<u8>, binary: bool) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let frame = if binary {
                tungstenite::Message::Binary(data.into())
            } else {
                tungstenite::Message::Text(
                    String::from_utf8_lossy(&data).into_owned().into(),
                )
            };
            self.ws.send(frame).await?;
            Ok(())
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>, Error>>> {
        Box::pin(async move {
            loop {
                match self.ws.next().await? {
                    Ok(tungstenite::Message::Binary(data)) => return Some(Ok(data.to_vec())),
                    Ok(tungstenite::Message::Text(text)) => {
                        return Some(Ok(text.as_bytes().to_vec()))
                    }
                    Ok(tungstenite::Message::Close(_)) => return None,
                    // Pings and pongs are transport liveness, not frames.
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.ws.close(None).await;
        })
    }
}
