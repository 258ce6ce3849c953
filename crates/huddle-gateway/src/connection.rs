use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::bus::{Outbound, SessionHandle};
use crate::registry::Rejection;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// How long a requested close frame may take to flush before the writer is
/// abandoned.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the reader should do after handling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(u16),
}

/// Transport-independent half of a socket: reacts to inbound text and to the
/// socket going away. Replies and broadcasts flow through the session's
/// [`SessionHandle`], never through return values.
#[async_trait]
pub trait SocketSession: Send {
    fn handle(&self) -> &SessionHandle;

    /// Label used in logs.
    fn describe(&self) -> String;

    /// Runs once the socket is live, before any inbound frame.
    async fn on_open(&mut self);

    async fn on_text(&mut self, text: &str) -> Flow;

    /// Runs exactly once on every exit path.
    async fn on_close(&mut self);
}

/// Drives one accepted socket: a writer task drains the session's outbound
/// queue and keeps the heartbeat, while this task feeds inbound frames to the
/// session in receipt order.
pub async fn run_socket<S: SocketSession>(
    socket: WebSocket,
    mut session: S,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    heartbeat_interval: Duration,
) {
    let (sender, mut receiver) = socket.split();
    let label = session.describe();
    info!("{} connected", label);

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(write_loop(
        sender,
        outbound,
        pong_received.clone(),
        heartbeat_interval,
    ));

    session.on_open().await;

    let mut writer_done = false;
    let mut closing = false;
    loop {
        tokio::select! {
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Flow::Close(code) = session.on_text(text.as_str()).await {
                        closing = true;
                        trace!("{} closing with {}", label, code);
                        session.handle().close(code, close_reason(code));
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    trace!("{} sent a binary frame, ignoring", label);
                }
                Some(Ok(Message::Pong(_))) => {
                    pong_received.store(true, Ordering::Release);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("{} read error: {}", label, e);
                    break;
                }
                Some(Ok(Message::Ping(_))) => {}
            }
        }
    }

    session.on_close().await;

    if !writer_done {
        if closing {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
        } else {
            send_task.abort();
        }
    }
    info!("{} disconnected", label);
}

fn close_reason(code: u16) -> &'static str {
    match code {
        CLOSE_MESSAGE_TOO_BIG => "message too big",
        CLOSE_NORMAL => "bye",
        _ => "closing",
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    pong_received: Arc<AtomicBool>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Event(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", event.kind(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!(
                            "Heartbeat timeout (missed {} pongs), dropping connection",
                            missed_heartbeats
                        );
                        break;
                    }
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Refuses an upgraded socket that failed admission.
pub async fn reject(mut socket: WebSocket, rejection: Rejection) {
    debug!("Rejecting socket: {} ({})", rejection, rejection.close_code());
    let frame = CloseFrame {
        code: rejection.close_code(),
        reason: rejection.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
