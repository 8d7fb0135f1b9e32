//! WebSocket signaling channel tests against a local echo relay

use futures::{SinkExt, StreamExt};
use gridlink_signaling::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Relay that sends every text frame back to its sender
async fn start_echo_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Text(_) = frame {
                        if ws.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    addr
}

fn envelope(to: &str, message: SignalingMessage) -> SignalingEnvelope {
    SignalingEnvelope {
        channel_id: "g1".to_string(),
        from_user_id: "bob".to_string(),
        to_user_id: to.to_string(),
        message,
    }
}

#[tokio::test]
async fn test_channel_delivers_only_envelopes_for_local_user() {
    let addr = start_echo_relay().await;
    let url = format!("ws://{}", addr);

    let (channel, mut incoming) = timeout(
        Duration::from_secs(5),
        WebSocketSignalingChannel::connect(&url, "alice"),
    )
    .await
    .expect("connect timed out")
    .unwrap();
    assert_eq!(channel.local_user_id(), "alice");

    channel
        .send(envelope(
            "carol",
            SignalingMessage::Offer {
                sdp: "not-for-alice".to_string(),
            },
        ))
        .await
        .unwrap();
    channel
        .send(envelope(
            "alice",
            SignalingMessage::IceCandidate {
                candidate: IceCandidate::new("candidate:1"),
            },
        ))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("no envelope received")
        .unwrap();
    assert_eq!(received.to_user_id, "alice");
    assert_eq!(
        received.message,
        SignalingMessage::IceCandidate {
            candidate: IceCandidate::new("candidate:1")
        }
    );

    channel.close();
}

#[tokio::test]
async fn test_connect_to_missing_relay_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WebSocketSignalingChannel::connect(&format!("ws://{}", addr), "alice")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "TRANSPORT_ERROR");
}
