//! The kernel channels WebSocket.
//!
//! One socket carries every Jupyter channel. A connection owns two tasks:
//! the receiver decodes frames and enqueues them (stdin frames into their own
//! queue), the writer drains an outbound queue into the socket. Neither task
//! touches session state, and sending never waits on the network.

use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

use crate::error::{KernelError, Result};
use crate::message::OutgoingMessage;

pub struct KernelChannels {
    outbound: mpsc::UnboundedSender<String>,
    iopub: mpsc::UnboundedReceiver<Value>,
    stdin: mpsc::UnboundedReceiver<Value>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for KernelChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelChannels")
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

impl KernelChannels {
    /// Open the socket at `url`, sending `token` as an `Authorization` header.
    pub async fn connect(url: &Url, token: Option<&str>) -> Result<Self> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("token {}", token))
                .map_err(|e| KernelError::Connection(format!("invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        log::info!("[channels] Connecting to {}", url);
        let (ws_stream, _) = connect_async(request).await?;
        Ok(Self::from_stream(ws_stream))
    }

    /// Spawn the receiver and writer over an already-open socket.
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_tx, ws_rx) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_frames(ws_rx, iopub_tx, stdin_tx));
        let writer = tokio::spawn(async move {
            let mut ws_tx = ws_tx;
            let mut outbound_rx = outbound_rx;
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    log::warn!("[channels] Write failed, stopping writer: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        Self {
            outbound: outbound_tx,
            iopub: iopub_rx,
            stdin: stdin_rx,
            tasks: vec![receiver, writer],
        }
    }

    /// Queue a message for the writer task.
    pub fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let text = message.to_json()?;
        self.outbound
            .send(text)
            .map_err(|_| KernelError::Connection("channels writer has stopped".into()))
    }

    /// Non-blocking dequeue. `Ok(None)` means nothing is waiting right now;
    /// once the receiver has stopped and the queue is drained this errors.
    pub fn try_recv_iopub(&mut self) -> Result<Option<Value>> {
        try_dequeue(&mut self.iopub)
    }

    pub fn try_recv_stdin(&mut self) -> Result<Option<Value>> {
        try_dequeue(&mut self.stdin)
    }

    /// Discard everything currently queued on both queues.
    pub fn drain(&mut self) -> usize {
        let mut discarded = 0;
        while let Ok(Some(_)) = self.try_recv_iopub() {
            discarded += 1;
        }
        while let Ok(Some(_)) = self.try_recv_stdin() {
            discarded += 1;
        }
        discarded
    }

    /// Stop both tasks. Queued inbound messages are dropped.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.iopub.close();
        self.stdin.close();
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> (Self, ChannelHarness) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                iopub: iopub_rx,
                stdin: stdin_rx,
                tasks: Vec::new(),
            },
            ChannelHarness {
                iopub: Some(iopub_tx),
                stdin: Some(stdin_tx),
                sent: outbound_rx,
            },
        )
    }
}

impl Drop for KernelChannels {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn try_dequeue(queue: &mut mpsc::UnboundedReceiver<Value>) -> Result<Option<Value>> {
    match queue.try_recv() {
        Ok(value) => Ok(Some(value)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => Err(KernelError::KernelDead(
            "channels receiver has stopped".into(),
        )),
    }
}

/// Route one decoded frame to its queue. Returns false once both queues are gone.
fn enqueue(
    frame: Value,
    iopub: &mpsc::UnboundedSender<Value>,
    stdin: &mpsc::UnboundedSender<Value>,
) -> bool {
    let queue = if frame.get("channel").and_then(Value::as_str) == Some("stdin") {
        stdin
    } else {
        iopub
    };
    queue.send(frame).is_ok() || !(iopub.is_closed() && stdin.is_closed())
}

async fn receive_frames<R, E>(
    mut ws_rx: R,
    iopub: mpsc::UnboundedSender<Value>,
    stdin: mpsc::UnboundedSender<Value>,
) where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                log::debug!("[channels] Skipping binary frame");
                continue;
            }
            Ok(Message::Close(_)) => {
                log::info!("[channels] Server closed the channels socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                log::warn!("[channels] Receive failed, stopping receiver: {}", e);
                break;
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => {
                if !enqueue(value, &iopub, &stdin) {
                    break;
                }
            }
            Err(e) => log::warn!("[channels] Dropping undecodable frame: {}", e),
        }
    }
    log::debug!("[channels] Receiver exiting");
}

/// Test double for the far side of an in-memory channel pair.
#[cfg(test)]
pub(crate) struct ChannelHarness {
    iopub: Option<mpsc::UnboundedSender<Value>>,
    stdin: Option<mpsc::UnboundedSender<Value>>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

#[cfg(test)]
impl ChannelHarness {
    /// Deliver a frame as the receiver task would.
    pub fn push(&self, frame: Value) {
        if let (Some(iopub), Some(stdin)) = (&self.iopub, &self.stdin) {
            enqueue(frame, iopub, stdin);
        }
    }

    /// Simulate the receiver task stopping.
    pub fn disconnect(&mut self) {
        self.iopub = None;
        self.stdin = None;
    }

    /// Next message the client queued for the writer, parsed.
    pub fn next_sent(&mut self) -> Option<Value> {
        self.sent
            .try_recv()
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
    }
}
