use agenda_protocol::{ConnCode, ErrorReply, ServerMessage};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use libagenda::router::{self, Flow};
use libagenda::{SessionHandle, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::server::AppState;

/// Drive one upgraded connection until either side gives up.
pub async fn run_session(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let manager = Arc::clone(&state.manager);
    let (session, outbound) = manager.new_session(addr);
    manager.add(Arc::clone(&session)).await;

    let (sink, stream) = socket.split();
    tokio::join!(
        inbound_loop(stream, &manager, &session, state.config.keepalive()),
        outbound_loop(sink, outbound, &manager, &session, state.config.ping_interval()),
    );
    tracing::debug!(session_id = %session.id(), "connection finished");
}

async fn inbound_loop(
    mut stream: SplitStream<WebSocket>,
    manager: &Arc<SessionManager>,
    session: &Arc<SessionHandle>,
    keepalive: Duration,
) {
    let cancel = session.cancel_token();
    let mut deadline = Instant::now() + keepalive;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(session_id = %session.id(), "read deadline expired");
                break;
            }
            next = stream.next() => {
                let Some(msg) = next else {
                    break;
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(session_id = %session.id(), error = %e, "read failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        if router::dispatch(manager, session, text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let reply = ErrorReply::new(ConnCode::UnsupportedData, "binary frames are not supported");
                        if session.send(ServerMessage::Error(reply)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => deadline = Instant::now() + keepalive,
                    Message::Ping(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    manager.remove(session.id()).await;
}

async fn outbound_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    manager: &Arc<SessionManager>,
    session: &Arc<SessionHandle>,
    ping_every: Duration,
) {
    let cancel = session.cancel_token();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // queued replies go out before a close
            biased;
            next = outbound.recv() => {
                let Some(msg) = next else {
                    send_close(&mut sink).await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(encode(&msg).into())).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "write failed");
                    break;
                }
            }
            _ = cancel.cancelled() => {
                send_close(&mut sink).await;
                break;
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "ping failed");
                    break;
                }
            }
        }
    }

    manager.remove(session.id()).await;
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

fn encode(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        tracing::warn!(tag = msg.tag(), error = %e, "failed to encode outbound message");
        let reply = ServerMessage::Error(ErrorReply::new(
            ConnCode::JsonEncodeError,
            "could not encode reply",
        ));
        serde_json::to_string(&reply).unwrap_or_default()
    })
}
