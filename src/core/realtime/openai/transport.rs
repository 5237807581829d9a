//! WebSocket transport for the OpenAI Realtime API.
//!
//! Binary writes carry raw caller audio and go out as
//! `input_audio_buffer.append` events, since the service only accepts JSON
//! text frames. Reads are passed through untouched; the dispatcher decides
//! what they mean.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::ClientEvent;
use crate::core::realtime::base::EndpointConfig;
use crate::core::realtime::transport::{
    BoxedTransport, Transport, TransportError, TransportFactory, TransportFrame, TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `User-Agent` sent on the upgrade request.
pub const USER_AGENT: &str = concat!("nyra-realtime/", env!("CARGO_PKG_VERSION"));

/// Upper bound for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A single WebSocket connection to the OpenAI Realtime API.
pub struct OpenAIRealtimeTransport {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    closed: AtomicBool,
}

impl Default for OpenAIRealtimeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAIRealtimeTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn build_request(
        endpoint: &EndpointConfig,
        auth_token: &str,
    ) -> TransportResult<http::Request<()>> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("invalid endpoint url: {e}")))?;

        let mut bearer = http::HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|_| {
                TransportError::Unauthorized("API key is not a valid header value".to_string())
            })?;
        bearer.set_sensitive(true);

        let headers = request.headers_mut();
        headers.insert(http::header::AUTHORIZATION, bearer);
        headers.insert("OpenAI-Beta", http::HeaderValue::from_static("realtime=v1"));
        headers.insert(
            http::header::USER_AGENT,
            http::HeaderValue::from_static(USER_AGENT),
        );

        Ok(request)
    }

    async fn write(&self, message: Message) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(TransportError::Closed);
        };

        sink.send(message).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            map_ws_error(e)
        })
    }
}

/// Map a connect-time error, singling out rejected credentials.
fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403) {
                TransportError::Unauthorized(format!("upgrade rejected with {status}"))
            } else {
                TransportError::Handshake(format!("upgrade rejected with {status}"))
            }
        }
        other => map_ws_error(other),
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}

#[async_trait]
impl Transport for OpenAIRealtimeTransport {
    async fn open(&self, endpoint: &EndpointConfig, auth_token: &str) -> TransportResult<()> {
        let request = Self::build_request(endpoint, auth_token)?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_connect_error)?;

        info!("Connected to OpenAI Realtime API");

        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        let event = ClientEvent::audio_append(&data);
        let json = serde_json::to_string(&event)
            .map_err(|e| TransportError::Io(format!("failed to serialize audio event: {e}")))?;
        self.write(Message::Text(json.into())).await
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        self.write(Message::Text(text.into())).await
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<TransportFrame> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stream = self.stream.lock().await;
        let Some(stream) = stream.as_mut() else {
            return Err(TransportError::Closed);
        };

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(TransportError::Timeout),
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return Ok(TransportFrame::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => return Ok(TransportFrame::Binary(data)),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.write(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "WebSocket closed by server");
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(map_ws_error(e));
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("OpenAI transport already closed");
        }

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => debug!("WebSocket close handshake sent"),
                Ok(Err(e)) => debug!("WebSocket close failed: {}", e),
                Err(_) => debug!("WebSocket close timed out"),
            }
        }
        Ok(())
    }
}

/// Hands out a fresh [`OpenAIRealtimeTransport`] per connection attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAIRealtimeTransportFactory;

impl TransportFactory for OpenAIRealtimeTransportFactory {
    fn create(&self) -> BoxedTransport {
        Arc::new(OpenAIRealtimeTransport::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_auth_headers() {
        let endpoint =
            EndpointConfig::new("wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview");
        let request = OpenAIRealtimeTransport::build_request(&endpoint, "sk-test").unwrap();

        let headers = request.headers();
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert!(headers["authorization"].is_sensitive());
        assert!(!format!("{:?}", headers["authorization"]).contains("sk-test"));
        assert_eq!(headers["openai-beta"], "realtime=v1");
        assert!(headers["user-agent"].to_str().unwrap().starts_with("nyra-realtime/"));
    }

    #[test]
    fn test_invalid_url_is_handshake_error() {
        let endpoint = EndpointConfig::new("not a url");
        let result = OpenAIRealtimeTransport::build_request(&endpoint, "sk-test");
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_unopened_transport_is_closed() {
        let transport = OpenAIRealtimeTransport::new();
        assert_eq!(
            transport.send_text("{}".to_string()).await,
            Err(TransportError::Closed)
        );
        assert_eq!(
            transport.receive(Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        );
        assert!(transport.close().await.is_ok());
    }
}
