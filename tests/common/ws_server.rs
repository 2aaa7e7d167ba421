//! Local WebSocket synthesis server.
//!
//! Answers every text command with `start`, one binary frame of `audio:<text>` and
//! `end`. Text containing `fail` gets an `error` message instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

#[derive(Default)]
pub struct WsServerState {
    pub connections: AtomicUsize,
    pub commands: Mutex<Vec<Value>>,
    /// `(authorization, x-user-id)` headers of each handshake.
    pub handshakes: Mutex<Vec<(String, String)>>,
}

impl WsServerState {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().clone()
    }
}

pub struct WsServer {
    pub addr: SocketAddr,
    pub state: Arc<WsServerState>,
}

impl WsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(WsServerState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/tts", self.addr)
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<WsServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let headers = state.clone();
    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        headers
            .handshakes
            .lock()
            .push((header("authorization"), header("x-user-id")));
        Ok(resp)
    })
    .await?;
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let command: Value = serde_json::from_str(text.as_str())?;
        state.commands.lock().push(command.clone());

        let request_id = command["request_id"].as_str().unwrap_or_default().to_string();
        let body = command["text"].as_str().unwrap_or_default().to_string();

        if body.contains("fail") {
            let error = json!({"type": "error", "message": "voice not found", "request_id": request_id});
            write.send(Message::Text(error.to_string().into())).await?;
            continue;
        }

        let start = json!({"type": "start", "request_id": request_id});
        write.send(Message::Text(start.to_string().into())).await?;
        write
            .send(Message::Binary(format!("audio:{body}").into_bytes().into()))
            .await?;
        let end = json!({"type": "end", "request_id": request_id});
        write.send(Message::Text(end.to_string().into())).await?;
    }
    Ok(())
}
