//! WebSocket adapter.
//!
//! A connection carries one session at a time. Each text fragment is sent as a JSON
//! command tagged with its own request id; audio comes back as binary frames, and the
//! server brackets every command with `start` and `end` control messages. A session
//! completes once its input is closed and every command it sent has ended.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use super::{
    AdapterChannel, AdapterSettings, ChunkSender, Endpoint, ProtocolAdapter, StreamHandle,
    SynthesisRequest,
};
use crate::core::chunk::AudioChunk;
use crate::core::lease::Lease;
use crate::core::messages::{SynthesisParams, WsCommand, WsServerMessage};
use crate::core::protocol::Protocol;
use crate::errors::{TtsError, TtsResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One open WebSocket, checked out by a single session at a time.
pub struct WsConnection {
    stream: Mutex<Option<WsStream>>,
    open: AtomicBool,
}

impl WsConnection {
    fn new(stream: WsStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            open: AtomicBool::new(true),
        }
    }

    /// Whether the socket is parked and usable for another session. A socket checked
    /// out by a running session reports `false`.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.stream.lock().is_some()
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn take(&self) -> Option<WsStream> {
        self.stream.lock().take()
    }

    fn put_back(&self, stream: WsStream) {
        *self.stream.lock() = Some(stream);
    }
}

pub struct WebSocketAdapter {
    settings: AdapterSettings,
}

impl WebSocketAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProtocolAdapter for WebSocketAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    async fn open(&self, endpoint: &Endpoint, lease: &Lease) -> TtsResult<AdapterChannel> {
        let mut request = endpoint.address.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Lease {}", lease.to_base64()))
            .map_err(|e| TtsError::Authorization(format!("Lease is not a valid header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        if let Ok(user) = HeaderValue::from_str(&self.settings.user_id) {
            request.headers_mut().insert("X-User-Id", user);
        }

        let connect_timeout = self.settings.connect_timeout;
        let (stream, response) = match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TtsError::timeout("WebSocket connect", connect_timeout)),
        };

        info!(endpoint = %endpoint, status = %response.status(), "Connected WebSocket");
        Ok(AdapterChannel::WebSocket(Arc::new(WsConnection::new(stream))))
    }

    async fn send(
        &self,
        channel: &AdapterChannel,
        request: SynthesisRequest,
        _lease: Arc<Lease>,
    ) -> TtsResult<StreamHandle> {
        let AdapterChannel::WebSocket(conn) = channel else {
            return Err(TtsError::Configuration(
                "WebSocket adapter was handed a non-WebSocket channel".to_string(),
            ));
        };
        let Some(ws) = conn.take() else {
            conn.mark_closed();
            return Err(TtsError::Transport(
                "WebSocket connection is closed or already in use".to_string(),
            ));
        };

        let (tx, handle) = StreamHandle::channel(self.settings.chunk_buffer, &request.cancel);
        let session = Session {
            conn: conn.clone(),
            params: SynthesisParams::from_options(&request.options, request.engine),
            request_id: request.request_id,
            pending: VecDeque::new(),
            commands_sent: 0,
            sequence: 0,
            read_timeout: self.settings.read_timeout,
        };
        let text = request.text;
        let follow_up = request.follow_up;

        tokio::spawn(async move {
            let request_id = session.request_id.clone();
            debug!(request_id = %request_id, "Starting WebSocket session");
            session.run(ws, text, follow_up, tx).await;
            debug!(request_id = %request_id, "WebSocket session finished");
        });

        Ok(handle)
    }
}

/// How a session loop ended.
enum Exit {
    /// Every command ended; the socket can serve another session.
    Reusable,
    /// The socket must not be reused.
    Closed,
}

struct Session {
    conn: Arc<WsConnection>,
    params: SynthesisParams,
    request_id: String,
    /// Command ids sent and not yet ended, oldest first.
    pending: VecDeque<String>,
    commands_sent: usize,
    sequence: u64,
    read_timeout: Duration,
}

impl Session {
    async fn run(
        mut self,
        mut ws: WsStream,
        text: Vec<String>,
        follow_up: Option<mpsc::Receiver<String>>,
        tx: ChunkSender,
    ) {
        let exit = self.drive(&mut ws, text, follow_up, &tx).await;
        match exit {
            Exit::Reusable => {
                self.conn.put_back(ws);
                tx.send(Ok(AudioChunk::complete(self.sequence))).await;
            }
            Exit::Closed => {
                self.conn.mark_closed();
                let _ = timeout(Duration::from_millis(250), ws.close(None)).await;
            }
        }
    }

    async fn drive(
        &mut self,
        ws: &mut WsStream,
        text: Vec<String>,
        mut follow_up: Option<mpsc::Receiver<String>>,
        tx: &ChunkSender,
    ) -> Exit {
        let cancel = tx.cancel_token().clone();

        for fragment in text {
            if let Err(e) = self.send_command(ws, fragment).await {
                tx.send(Err(e)).await;
                return Exit::Closed;
            }
        }

        let mut input_open = follow_up.is_some();
        if !input_open && self.pending.is_empty() {
            return Exit::Reusable;
        }

        loop {
            // Idle duplex sessions wait for more text without a read deadline.
            let read_limit = (!self.pending.is_empty()).then_some(self.read_timeout);

            tokio::select! {
                biased;
                // Frames for the abandoned commands may still arrive, so the socket
                // is not handed to another session.
                _ = cancel.cancelled() => {
                    debug!(request_id = %self.request_id, "WebSocket session canceled");
                    return Exit::Closed;
                }
                fragment = next_fragment(&mut follow_up), if input_open => match fragment {
                    Some(fragment) => {
                        if let Err(e) = self.send_command(ws, fragment).await {
                            tx.send(Err(e)).await;
                            return Exit::Closed;
                        }
                    }
                    None => {
                        input_open = false;
                        if self.pending.is_empty() {
                            return Exit::Reusable;
                        }
                    }
                },
                frame = read_frame(ws, read_limit) => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            tx.send(Err(e)).await;
                            return Exit::Closed;
                        }
                    };
                    match self.handle_frame(ws, frame, tx).await {
                        Step::Continue => {
                            if !input_open && self.pending.is_empty() {
                                return Exit::Reusable;
                            }
                        }
                        Step::Stop(exit) => return exit,
                    }
                }
            }
        }
    }

    async fn send_command(&mut self, ws: &mut WsStream, text: String) -> TtsResult<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let command_id = format!("{}-{}", self.request_id, self.commands_sent);
        let command = WsCommand {
            text,
            request_id: command_id.clone(),
            params: self.params.clone(),
        };
        let json = serde_json::to_string(&command)
            .map_err(|e| TtsError::Validation(format!("Failed to encode command: {e}")))?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|e| TtsError::Transport(format!("WebSocket send failed: {e}")))?;
        trace!(command_id = %command_id, "Sent WebSocket command");
        self.commands_sent += 1;
        self.pending.push_back(command_id);
        Ok(())
    }

    async fn handle_frame(&mut self, ws: &mut WsStream, frame: Message, tx: &ChunkSender) -> Step {
        match frame {
            Message::Binary(data) => {
                if data.is_empty() {
                    return Step::Continue;
                }
                if !tx.send(Ok(AudioChunk::audio(self.sequence, data))).await {
                    return Step::Stop(Exit::Closed);
                }
                self.sequence += 1;
                Step::Continue
            }
            Message::Text(text) => match serde_json::from_str::<WsServerMessage>(text.as_str()) {
                Ok(WsServerMessage::Start { request_id }) => {
                    trace!(command_id = ?request_id, "Command started");
                    Step::Continue
                }
                Ok(WsServerMessage::End { request_id }) => {
                    self.finish_command(request_id.as_deref());
                    Step::Continue
                }
                Ok(WsServerMessage::Error { message, .. }) => {
                    let message = message.unwrap_or_else(|| "synthesis failed".to_string());
                    warn!(request_id = %self.request_id, error = %message, "WebSocket server error");
                    tx.send(Ok(AudioChunk::error(self.sequence, None, vec![message])))
                        .await;
                    Step::Stop(Exit::Closed)
                }
                Ok(WsServerMessage::Unknown) => Step::Continue,
                Err(e) => {
                    tx.send(Err(e.into())).await;
                    Step::Stop(Exit::Closed)
                }
            },
            Message::Ping(data) => {
                if ws.send(Message::Pong(data)).await.is_err() {
                    tx.send(Err(TtsError::Transport("WebSocket pong failed".to_string())))
                        .await;
                    return Step::Stop(Exit::Closed);
                }
                Step::Continue
            }
            Message::Close(frame) => {
                let normal = frame
                    .as_ref()
                    .is_none_or(|f| f.code == CloseCode::Normal);
                info!(request_id = %self.request_id, ?frame, "WebSocket closed by server");
                if normal && self.pending.is_empty() {
                    tx.send(Ok(AudioChunk::complete(self.sequence))).await;
                } else {
                    let reason = frame
                        .map(|f| format!("{}: {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".to_string());
                    tx.send(Err(TtsError::Transport(format!(
                        "WebSocket closed mid-session ({reason})"
                    ))))
                    .await;
                }
                Step::Stop(Exit::Closed)
            }
            Message::Pong(_) | Message::Frame(_) => Step::Continue,
        }
    }

    fn finish_command(&mut self, command_id: Option<&str>) {
        match command_id {
            Some(id) => {
                if let Some(pos) = self.pending.iter().position(|p| p == id) {
                    self.pending.remove(pos);
                } else {
                    warn!(command_id = id, "End received for unknown command");
                }
            }
            None => {
                self.pending.pop_front();
            }
        }
    }
}

enum Step {
    Continue,
    Stop(Exit),
}

async fn next_fragment(follow_up: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match follow_up.as_mut() {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

async fn read_frame(ws: &mut WsStream, limit: Option<Duration>) -> TtsResult<Message> {
    let next = match limit {
        Some(limit) => timeout(limit, ws.next())
            .await
            .map_err(|_| TtsError::timeout("WebSocket read", limit))?,
        None => ws.next().await,
    };
    match next {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(tungstenite::Error::ConnectionClosed)) | None => Err(TtsError::Transport(
            "WebSocket connection closed".to_string(),
        )),
        Some(Err(e)) => Err(TtsError::Transport(format!("WebSocket read failed: {e}"))),
    }
}
