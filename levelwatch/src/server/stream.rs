use crate::{
    channel::{
        manager::ChannelCloser,
        protocol::{ClientMessage, ServerMessage, close_code},
    },
    server::AppState,
    session::{
        SessionId, UserId,
        command::{Command, CommandError},
        registry::{ResolveError, SessionHandle},
    },
};
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Stable identity enabling rehydrate when the `session_id` is gone.
    pub user_id: Option<String>,
}

/// `GET /stream/{session_id}?user_id=` - the long-lived duplex channel.
///
/// Rebind within the session TTL never requires re-login: the path id finds a
/// live session, the query parameter rebuilds one from its snapshot.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_socket(
            state,
            SessionId(session_id),
            params.user_id.map(UserId::new),
            socket,
        )
    })
}

async fn handle_socket(
    state: AppState,
    session_id: SessionId,
    user_id: Option<UserId>,
    mut socket: WebSocket,
) {
    let handle = match state.registry.resolve(session_id, user_id.as_ref()).await {
        Ok(handle) => handle,
        Err(error) => {
            debug!(%session_id, %error, "rejecting channel: no session");
            let frame = ServerMessage::Error {
                code: "session_unknown".to_string(),
                detail: reject_reason(&error).to_string(),
            };
            if let Ok(payload) = frame.to_frame() {
                let _ = socket.send(Message::Text(payload.into())).await;
            }
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::SESSION_UNKNOWN,
                    reason: reject_reason(&error).into(),
                })))
                .await;
            return;
        }
    };

    let (channel, frames_rx) = state.manager.open(state.config.server.channel_send_queue);
    let channel_id = channel.id;
    let closer = channel.closer();

    // The writer runs before the bind attempt so channel-originated failures
    // can still reach the client as frames
    let (sink, mut inbound) = socket.split();
    let writer = tokio::spawn(writer_loop(
        sink,
        frames_rx,
        closer.clone(),
        state.config.server.send_deadline(),
    ));

    let bound = handle
        .request(|reply| Command::BindChannel {
            channel: channel.clone(),
            reply,
        })
        .await;
    if !matches!(bound, Ok(Ok(_))) {
        // A full command queue on a channel-originated command surfaces as a
        // status frame and a retriable close; a quarantined session is final
        let code = match &bound {
            Err(CommandError::QueueFull) => {
                let _ = channel.send(ServerMessage::Status {
                    message: "session busy, retry shortly".to_string(),
                });
                close_code::TRY_AGAIN
            }
            _ => close_code::QUARANTINED,
        };
        warn!(%session_id, %channel_id, code, "channel bind refused");
        closer.close(code);
        let _ = writer.await;
        state.manager.remove(channel_id);
        return;
    }

    // Reader half: client pings and the close handshake
    let mut close: (u16, bool) = (1006, false);
    loop {
        tokio::select! {
            _ = closer.closed() => break,
            message = inbound.next() => match message {
                None => break,
                Some(Ok(Message::Text(payload))) => {
                    handle_client_frame(&channel, &handle, payload.as_str());
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(close_code::NORMAL, |frame| frame.code);
                    close = (code, close_code::is_clean(code));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%session_id, %channel_id, %error, "channel transport error");
                    break;
                }
            }
        }
    }

    // A server-side close (slow consumer, deadline) outranks what the
    // transport reported
    if let Some(code) = closer.code() {
        close = (code, close_code::is_clean(code));
    }
    let (code, clean) = close;

    closer.close(code);
    let _ = writer.await;
    state.manager.remove(channel_id);
    let _ = handle.try_send(Command::UnbindChannel { channel_id, clean });
    debug!(%session_id, %channel_id, code, clean, "channel torn down");
}

/// Client `ping` elicits `pong` straight through the send queue; everything
/// else inbound is reserved and ignored.
fn handle_client_frame(
    channel: &crate::channel::manager::ChannelHandle,
    handle: &SessionHandle,
    payload: &str,
) {
    match ClientMessage::parse(payload) {
        Some(ClientMessage::Ping { .. }) => {
            let pong = ServerMessage::Pong {
                ts: chrono::Utc::now(),
            };
            if channel.send(pong).is_err() {
                // Queue full on a pong: the consumer is not draining at all
                channel.close(close_code::SLOW_CONSUMER);
            }
        }
        None => {
            debug!(session = %handle.session_id, "ignoring reserved client frame");
        }
    }
}

/// Writer half: FIFO frames with a per-send deadline, then the close frame.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerMessage>,
    closer: ChannelCloser,
    send_deadline: Duration,
) {
    let code = loop {
        tokio::select! {
            code = closer.closed() => break code,
            frame = frames.recv() => match frame {
                None => break close_code::GOING_AWAY,
                Some(message) => match write_frame(&mut sink, message, send_deadline).await {
                    WriteOutcome::Sent | WriteOutcome::Skipped => {}
                    WriteOutcome::TransportGone => break close_code::GOING_AWAY,
                    WriteOutcome::DeadlineMissed => {
                        warn!("downstream send missed its deadline, closing channel");
                        closer.close(close_code::SEND_DEADLINE);
                        break close_code::SEND_DEADLINE;
                    }
                }
            }
        }
    };

    // Frames queued ahead of the close signal (final status notices) still go
    // out before the close frame
    while let Ok(message) = frames.try_recv() {
        if !matches!(
            write_frame(&mut sink, message, send_deadline).await,
            WriteOutcome::Sent | WriteOutcome::Skipped
        ) {
            break;
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
    let _ = sink.close().await;
}

enum WriteOutcome {
    Sent,
    /// Frame could not be serialised and was dropped.
    Skipped,
    TransportGone,
    DeadlineMissed,
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: ServerMessage,
    send_deadline: Duration,
) -> WriteOutcome {
    let payload = match message.to_frame() {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "dropping unserialisable frame");
            return WriteOutcome::Skipped;
        }
    };
    match tokio::time::timeout(send_deadline, sink.send(Message::Text(payload.into()))).await {
        Ok(Ok(())) => WriteOutcome::Sent,
        Ok(Err(_)) => WriteOutcome::TransportGone,
        Err(_elapsed) => WriteOutcome::DeadlineMissed,
    }
}

fn reject_reason(error: &ResolveError) -> &'static str {
    match error {
        ResolveError::NotFound => "unknown session",
        ResolveError::Snapshot(_) => "snapshot rejected",
    }
}
