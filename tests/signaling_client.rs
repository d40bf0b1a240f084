//! SignalingClient gegen einen lokalen WebSocket-Server

use callmatch::signaling::{ClientMessage, ServerMessage, SignalSink, SignalingError};
use callmatch::{CallConfig, SignalingClient, SignalingEvent};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn config(url: String) -> CallConfig {
    CallConfig {
        signaling_url: url,
        reconnect_initial_backoff: Duration::from_millis(50),
        reconnect_max_backoff: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(60),
        ..CallConfig::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event in time")
        .expect("event stream open")
}

#[tokio::test]
async fn exchanges_frames_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Erste Verbindung: find_partner beantworten, dann schließen
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let first = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        ws.send(Message::Text(
            r#"{"type":"partner_found","partnerId":"peer-1","startTime":1700000000000,"shouldInitiate":true}"#
                .to_string(),
        ))
        .await
        .unwrap();
        ws.close(None).await.unwrap();

        // Zweite Verbindung nach dem Reconnect
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"type":"user_count","count":3}"#.to_string()))
            .await
            .unwrap();
        let _ = ws.next().await;
        first
    });

    let (client, mut events) = SignalingClient::start(&config(format!("ws://{addr}")));

    assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
    assert!(client.is_connected());
    client.send(ClientMessage::FindPartner).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::Message(ServerMessage::PartnerFound {
            partner_id: "peer-1".into(),
            start_time: 1_700_000_000_000,
            should_initiate: true,
        })
    );
    assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);

    assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::Message(ServerMessage::UserCount { count: 3 })
    );
    assert_eq!(client.connection_count(), 2);

    client.close();
    let first = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    let sent: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(sent["type"], "find_partner");
}

#[tokio::test]
async fn send_without_connection_fails() {
    // Freien Port reservieren und sofort wieder freigeben
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (client, mut events) = SignalingClient::start(&config(format!("ws://{addr}")));

    assert!(matches!(
        next_event(&mut events).await,
        SignalingEvent::ConnectError(_)
    ));
    assert_eq!(
        client.send(ClientMessage::FindPartner),
        Err(SignalingError::NotConnected)
    );
    assert!(!client.is_connected());
    client.close();
}
