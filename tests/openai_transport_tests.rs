//! Integration tests for the OpenAI Realtime WebSocket transport
//!
//! A local tokio-tungstenite server on 127.0.0.1 stands in for the OpenAI
//! endpoint, so these tests exercise the real upgrade request, framing and
//! close handling without network access or an API key.

use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use nyra_realtime::core::realtime::openai::{
    OpenAIRealtimeOptions, OpenAIRealtimeTransport, OpenAIRealtimeTransportFactory,
};
use nyra_realtime::core::realtime::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, RealtimeSessionManager,
    SessionError, SessionState, Transport, TransportError, TransportFrame,
};

const WAIT: Duration = Duration::from_secs(2);

/// One accepted client connection on the local upstream
struct Upstream {
    url: String,
    headers: oneshot::Receiver<http::HeaderMap>,
    received: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Upstream {
    async fn next_text(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .expect("upstream received nothing")
                .expect("client went away");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    fn send(&self, message: Message) {
        self.outgoing.send(message).unwrap();
    }
}

/// Accept a single WebSocket client and relay its traffic through channels.
async fn spawn_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (headers_tx, headers) = oneshot::channel();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            let _ = headers_tx.send(request.headers().clone());
            Ok::<Response, ErrorResponse>(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(message)) => {
                        let _ = received_tx.send(message);
                    }
                    _ => break,
                },
                outgoing = outgoing_rx.recv() => match outgoing {
                    Some(message) => {
                        if write.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    Upstream {
        url: format!("ws://{addr}/v1/realtime"),
        headers,
        received,
        outgoing,
    }
}

/// Reject every upgrade with `status`.
async fn spawn_rejecting_upstream(status: http::StatusCode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |_request: &Request, _response: Response| {
            let rejection: ErrorResponse = http::Response::builder()
                .status(status)
                .body(None)
                .unwrap();
            Err(rejection)
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    });

    format!("ws://{addr}/v1/realtime")
}

async fn open_transport(upstream: &Upstream) -> OpenAIRealtimeTransport {
    let transport = OpenAIRealtimeTransport::new();
    transport
        .open(&EndpointConfig::new(upstream.url.clone()), "sk-test")
        .await
        .unwrap();
    transport
}

// =============================================================================
// Upgrade request
// =============================================================================

#[tokio::test]
async fn test_upgrade_request_carries_bearer_token() {
    let mut upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    let headers = tokio::time::timeout(WAIT, &mut upstream.headers)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert_eq!(headers["openai-beta"], "realtime=v1");
    assert!(
        headers["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("nyra-realtime/")
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_upgrade_is_unauthorized() {
    for status in [http::StatusCode::UNAUTHORIZED, http::StatusCode::FORBIDDEN] {
        let url = spawn_rejecting_upstream(status).await;
        let transport = OpenAIRealtimeTransport::new();
        let result = transport.open(&EndpointConfig::new(url), "sk-bad").await;

        match result {
            Err(TransportError::Unauthorized(msg)) => assert!(msg.contains(status.as_str())),
            other => panic!("Expected Unauthorized for {status}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_error_on_upgrade_is_handshake_failure() {
    let url = spawn_rejecting_upstream(http::StatusCode::SERVICE_UNAVAILABLE).await;
    let transport = OpenAIRealtimeTransport::new();
    let result = transport.open(&EndpointConfig::new(url), "sk-test").await;

    assert!(matches!(result, Err(TransportError::Handshake(_))));
    assert!(result.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_refused_connection_is_retryable_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = OpenAIRealtimeTransport::new();
    let result = transport
        .open(&EndpointConfig::new(format!("ws://{addr}/")), "sk-test")
        .await;

    assert!(matches!(result, Err(TransportError::Io(_))));
}

// =============================================================================
// Framing
// =============================================================================

#[tokio::test]
async fn test_binary_audio_is_sent_as_append_event() {
    let mut upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    transport
        .send_binary(Bytes::from_static(b"pcm"))
        .await
        .unwrap();

    let event = upstream.next_text().await;
    assert_eq!(event["type"], "input_audio_buffer.append");
    assert_eq!(event["audio"], BASE64_STANDARD.encode(b"pcm"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_text_is_sent_verbatim() {
    let mut upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    let control = json!({"type": "response.create"});
    transport.send_text(control.to_string()).await.unwrap();

    assert_eq!(upstream.next_text().await, control);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_inbound_frames_pass_through() {
    let upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    upstream.send(Message::Binary(Bytes::from_static(b"\x01\x02")));
    upstream.send(Message::Text(r#"{"type":"session.created"}"#.to_string().into()));

    assert_eq!(
        transport.receive(WAIT).await,
        Ok(TransportFrame::Binary(Bytes::from_static(b"\x01\x02")))
    );
    assert_eq!(
        transport.receive(WAIT).await,
        Ok(TransportFrame::Text(r#"{"type":"session.created"}"#.to_string()))
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_receive_times_out_when_idle() {
    let upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    let result = transport.receive(Duration::from_millis(30)).await;
    assert_eq!(result, Err(TransportError::Timeout));

    // ping in between does not surface as a frame
    upstream.send(Message::Ping(Bytes::from_static(b"hb")));
    upstream.send(Message::Text("{}".to_string().into()));
    assert_eq!(
        transport.receive(WAIT).await,
        Ok(TransportFrame::Text("{}".to_string()))
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_server_close_marks_transport_closed() {
    let upstream = spawn_upstream().await;
    let transport = open_transport(&upstream).await;

    upstream.send(Message::Close(None));

    assert_eq!(transport.receive(WAIT).await, Err(TransportError::Closed));
    assert_eq!(
        transport.send_text("{}".to_string()).await,
        Err(TransportError::Closed)
    );
}

// =============================================================================
// Manager over the real transport
// =============================================================================

#[tokio::test]
async fn test_manager_session_over_websocket() {
    let mut upstream = spawn_upstream().await;

    let options = OpenAIRealtimeOptions {
        url: upstream.url.clone(),
        ..Default::default()
    };
    let config = ManagerConfig {
        receive_poll_ms: 20,
        ..Default::default()
    };
    let manager =
        RealtimeSessionManager::new(Arc::new(OpenAIRealtimeTransportFactory), config).unwrap();
    manager
        .connect(Credentials::new("sk-test"), options.endpoint())
        .await
        .unwrap();
    assert_eq!(manager.state(), SessionState::Open);

    let handshake = upstream.next_text().await;
    assert_eq!(handshake["type"], "session.update");
    assert_eq!(handshake["session"]["voice"], options.voice.as_str());

    manager.send_audio(&b"caller"[..]).await.unwrap();
    let append = upstream.next_text().await;
    assert_eq!(append["type"], "input_audio_buffer.append");
    assert_eq!(append["audio"], BASE64_STANDARD.encode(b"caller"));

    let delta = json!({
        "type": "response.audio.delta",
        "delta": BASE64_STANDARD.encode(b"assistant"),
    });
    upstream.send(Message::Text(delta.to_string().into()));

    let event = manager.receive_voice(WAIT).await.unwrap();
    assert_eq!(
        event,
        InboundEvent::VoiceAudio(Bytes::from_static(b"assistant"))
    );

    manager.disconnect().await;
    assert_eq!(manager.state(), SessionState::Closed);
    assert!(matches!(
        manager.receive_voice(Duration::from_millis(20)).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn test_manager_reports_rejected_key() {
    let url = spawn_rejecting_upstream(http::StatusCode::UNAUTHORIZED).await;
    let manager = RealtimeSessionManager::new(
        Arc::new(OpenAIRealtimeTransportFactory),
        ManagerConfig::default(),
    )
    .unwrap();

    let result = manager
        .connect(Credentials::new("sk-bad"), EndpointConfig::new(url))
        .await;

    assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
    assert_eq!(manager.state(), SessionState::Failed);
}
