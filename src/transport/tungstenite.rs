use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};

use super::{Transport, TransportFactory, TransportParams};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Default [`TransportFactory`] built directly on `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct TungsteniteTransportFactory;

#[async_trait]
impl TransportFactory for TungsteniteTransportFactory {
    #[instrument(skip(self, params), fields(uri = %params.uri))]
    async fn open(&self, params: TransportParams) -> Result<Box<dyn Transport>> {
        if params.proxy.is_some() {
            warn!("proxy configured but the default transport does not support proxying; ignoring");
        }

        let request = build_request(&params.uri)?;
        let connect = tokio_tungstenite::connect_async(request);

        let (stream, _) = tokio::time::timeout(params.timeout, connect)
            .await
            .map_err(|_| Error::cant_connect(format!("timed out connecting to {}", params.uri)))?
            .map_err(|err| Error::cant_connect(err.to_string()))?;

        info!(uri = %params.uri, "transport connected");

        let (write, read) = stream.split();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(TungsteniteTransport {
            id,
            write: Mutex::new(write),
            read: Mutex::new(read),
        }))
    }
}

struct TungsteniteTransport {
    id: u64,
    write: Mutex<WsSink>,
    read: Mutex<WsRead>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    fn id(&self) -> u64 {
        self.id
    }

    #[instrument(skip(self, message))]
    async fn send(&self, message: Vec<u8>) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(message))
            .await
            .context("failed to send websocket message")?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Ping(Vec::new()))
            .await
            .context("failed to send ping frame")?;
        Ok(())
    }

    async fn next_message(&self) -> Option<Result<Vec<u8>>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                None => return None,
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(bytes)),
                Some(Ok(Message::Text(text))) => return Some(Ok(text.into_bytes())),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return None,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(err)) => return Some(Err(Error::from(anyhow::Error::new(err)))),
            }
        }
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Close(None))
            .await
            .context("failed to send close frame")?;
        Ok(())
    }
}

fn build_request(uri: &str) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
    use tokio_tungstenite::tungstenite::http::{Request, Uri};

    let parsed: Uri = uri.parse().map_err(|err| Error::cant_connect(format!("invalid uri: {err}")))?;
    let host = parsed
        .host()
        .ok_or_else(|| Error::cant_connect("uri missing host"))?;
    let host_header = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Request::builder()
        .uri(uri)
        .header("Host", host_header)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|err| Error::cant_connect(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_rejects_invalid_uri() {
        let result = build_request("not a uri");
        assert!(result.is_err());
    }

    #[test]
    fn build_request_accepts_websocket_uri() {
        let result = build_request("wss://example.com/ws");
        assert!(result.is_ok());
    }
}
