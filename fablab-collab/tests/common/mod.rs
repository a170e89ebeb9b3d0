//! Shared fixtures: an in-process WebSocket broker and wait helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fablab_collab::{CollabConfig, ConnectionState, EventStreamClient};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub enum Outbound {
    Text(String),
    Close,
}

/// Minimal broker: records request paths and inbound frames, and lets the
/// test push frames to (or close) the most recent connection.
pub struct MockBroker {
    pub url: String,
    accepts: Arc<AtomicUsize>,
    pub paths: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedReceiver<Value>,
    conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>> = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let (a, p, c) = (accepts.clone(), paths.clone(), conns.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                a.fetch_add(1, Ordering::SeqCst);
                let (paths, conns, inbound_tx) = (p.clone(), c.clone(), inbound_tx.clone());
                tokio::spawn(async move {
                    let record_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        paths.lock().unwrap().push(req.uri().path().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record_path).await else {
                        return;
                    };
                    let (mut tx, mut rx) = ws.split();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
                    conns.lock().unwrap().push(out_tx);
                    loop {
                        tokio::select! {
                            frame = rx.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                                    let _ = inbound_tx.send(value);
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            out = out_rx.recv() => match out {
                                Some(Outbound::Text(text)) => {
                                    let _ = tx.send(Message::Text(text.into())).await;
                                }
                                Some(Outbound::Close) | None => {
                                    let _ = tx.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self { url: format!("ws://127.0.0.1:{port}"), accepts, paths, inbound, conns }
    }

    pub fn latest(&self) -> mpsc::UnboundedSender<Outbound> {
        self.conns.lock().unwrap().last().cloned().expect("no connection yet")
    }

    pub fn push(&self, frame: Value) {
        self.latest().send(Outbound::Text(frame.to_string())).unwrap();
    }

    pub fn push_raw(&self, text: &str) {
        self.latest().send(Outbound::Text(text.to_string())).unwrap();
    }

    pub fn close_latest(&self) {
        self.latest().send(Outbound::Close).unwrap();
    }

    pub async fn next_frame(&mut self) -> Value {
        timeout(Duration::from_secs(2), self.inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("broker stopped")
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// A port that accepts TCP and drops it before the WebSocket handshake.
pub async fn start_refusing_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let a = accepts.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            a.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (format!("ws://127.0.0.1:{port}"), accepts)
}

pub fn test_config(url: &str, max_attempts: u32) -> CollabConfig {
    CollabConfig {
        broker_url: url.to_string(),
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_attempts: max_attempts,
        ..CollabConfig::default()
    }
}

pub async fn wait_for_state(client: &EventStreamClient, target: ConnectionState) {
    let mut rx = client.watch_state();
    timeout(Duration::from_secs(3), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target:?}, state is {:?}", client.state()))
        .unwrap();
}

pub fn event_frame(event_type: &str, id: &str, payload: Value) -> Value {
    json!({
        "type": "event",
        "event_type": event_type,
        "event_id": id,
        "source": "test-broker",
        "payload": payload,
        "timestamp": "2024-05-01T12:00:00Z"
    })
}
