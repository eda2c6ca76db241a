//! Manages the WebSocket connection lifecycle for a streamed generation.

use super::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use labguide_core::{ErrorKind, SessionId, WorkflowError, session::SessionEvent};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first client message decides which session the connection follows: `generate`
/// creates and starts a new one, `subscribe` attaches to an existing one. From then on
/// the session's events are forwarded until a terminal message has been sent.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting first message...");
    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx = Arc::new(Mutex::new(socket_tx));

    let first = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => attach(text.as_str(), &state),
        Some(Ok(_)) => Err(ServerMessage::rejected(
            "First message must be a JSON `generate` or `subscribe` message",
        )),
        Some(Err(e)) => {
            warn!("Error receiving first message: {:?}", e);
            return;
        }
        None => {
            info!("Client disconnected before sending a message.");
            return;
        }
    };

    let (session_id, events) = match first {
        Ok(attached) => attached,
        Err(rejection) => {
            if let Err(e) = send_msg(&mut *socket_tx.lock().await, rejection).await {
                debug!("Failed to send rejection: {:?}", e);
            }
            close(&socket_tx).await;
            return;
        }
    };
    tracing::Span::current().record("session_id", tracing::field::display(session_id));
    info!("Streaming session events");

    if let Err(e) = stream_session(&state, session_id, &socket_tx, socket_rx, events).await {
        error!(error = ?e, "WebSocket session terminated with error.");
    }
    close(&socket_tx).await;
    info!("WebSocket connection closed.");
}

/// Resolves the first client message to a session and its event stream.
fn attach(
    text: &str,
    state: &AppState,
) -> Result<(SessionId, mpsc::UnboundedReceiver<SessionEvent>), ServerMessage> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| ServerMessage::rejected(format!("Invalid message: {e}")))?;

    match message {
        ClientMessage::Generate(payload) => {
            let id = state
                .sessions
                .create(payload.into_request())
                .map_err(|e| workflow_error(None, e))?;
            // Subscribe before the run starts so no event is missed.
            let events = state
                .sessions
                .subscribe(id)
                .map_err(|e| workflow_error(Some(id), e))?;
            state.orchestrator.spawn(id);
            Ok((id, events))
        }
        ClientMessage::Subscribe { session_id } => {
            let events = state
                .sessions
                .subscribe(session_id)
                .map_err(|e| workflow_error(Some(session_id), e))?;
            Ok((session_id, events))
        }
        ClientMessage::Cancel => Err(ServerMessage::rejected(
            "`cancel` requires an attached session; send `generate` or `subscribe` first",
        )),
    }
}

fn workflow_error(session_id: Option<SessionId>, err: WorkflowError) -> ServerMessage {
    ServerMessage::Error {
        session_id,
        kind: Some(err.kind()),
        message: err.to_string(),
    }
}

/// Forwards session events to the client while listening for `cancel`.
async fn stream_session(
    state: &AppState,
    session_id: SessionId,
    socket_tx: &SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    let gone = ServerMessage::Error {
                        session_id: Some(session_id),
                        kind: Some(ErrorKind::NotFound),
                        message: "Session is no longer available".to_string(),
                    };
                    send_msg(&mut *socket_tx.lock().await, gone).await?;
                    return Err(anyhow!("event stream closed before a terminal event"));
                };
                let message = ServerMessage::from_event(session_id, event);
                let terminal = message.is_terminal();
                send_msg(&mut *socket_tx.lock().await, message).await?;
                if terminal {
                    return Ok(());
                }
            },
            incoming = socket_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Cancel) => cancel(state, session_id),
                        Ok(_) => warn!("Ignoring unexpected message after attach."),
                        Err(e) => warn!("Ignoring malformed client message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        // Generation keeps running; the session can be re-subscribed.
                        info!("Client closed the connection.");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        return Ok(());
                    }
                }
            },
        }
    }
}

fn cancel(state: &AppState, session_id: SessionId) {
    match state.sessions.cancel(session_id) {
        Ok(()) => info!("Session cancelled by client."),
        Err(e) if e.kind() == ErrorKind::InvalidTransition => {
            debug!("Cancel ignored: {}", e);
        }
        Err(e) => warn!("Cancel failed: {}", e),
    }
}

async fn close(socket_tx: &SocketSink) {
    let mut sink = socket_tx.lock().await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
