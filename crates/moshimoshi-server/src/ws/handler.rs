use crate::auth::authenticate;
use crate::error::{AppError, Result};
use crate::rooms::PeerSession;
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use moshimoshi_protocol::{
    ClientMessage, ErrorCode, ErrorPayload, Request, ResponseBody, ServerMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long a new socket may stay silent before it must have authenticated
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            return false;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// First frame must be `authenticate` with a valid token
async fn authenticate_socket(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> std::result::Result<Uuid, &'static str> {
    let first = match tokio::time::timeout(AUTH_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return Err("First message must be authentication"),
        Err(_) => return Err("Authentication timed out"),
    };

    match serde_json::from_str::<ClientMessage>(first.as_str()) {
        Ok(ClientMessage::Authenticate { token }) => {
            authenticate(&token, &state.config.jwt_secret).map_err(|_| "Invalid token")
        }
        Ok(_) => Err("First message must be authentication"),
        Err(e) => {
            tracing::warn!("Invalid auth message: {}", e);
            Err("Invalid message format")
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match authenticate_socket(&mut receiver, &state).await {
        Ok(user_id) => user_id,
        Err(reason) => {
            tracing::debug!("Refusing WebSocket: {}", reason);
            let refusal = ErrorPayload {
                code: ErrorCode::Unauthenticated,
                message: reason.to_string(),
            };
            send_direct(&mut sender, &ServerMessage::Error(refusal)).await;
            let _ = sender.close().await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    if !send_direct(
        &mut sender,
        &ServerMessage::Authenticated {
            connection_id,
            user_id,
        },
    )
    .await
    {
        return;
    }

    tracing::info!("User {} authenticated on WebSocket {}", user_id, connection_id);

    // Outbound frames: responses and pushes share one ordered channel
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = state.rooms.register(connection_id, user_id, tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests of one connection run one after another on the worker
    let (work_tx, work_rx) = mpsc::unbounded_channel::<(u64, Request)>();
    tokio::spawn(run_worker(state.clone(), session.clone(), work_rx));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Request { id, request }) => {
                    if work_tx.send((id, request)).is_err() {
                        break;
                    }
                }
                Ok(ClientMessage::Ping) => session.send(&ServerMessage::Pong),
                Ok(ClientMessage::Authenticate { .. }) => {
                    let error = AppError::BadRequest("Already authenticated".to_string());
                    session.send(&ServerMessage::Error(error.to_payload()));
                }
                Err(e) => {
                    tracing::warn!("Invalid message from {}: {}", user_id, e);
                    let error = AppError::BadRequest("Invalid message format".to_string());
                    session.send(&ServerMessage::Error(error.to_payload()));
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
            _ => {}
        }
    }

    // The worker finishes the request it is on; anything it creates from
    // here on is closed by the coordinator and its response goes nowhere
    drop(work_tx);
    state.rooms.disconnect(connection_id).await;
    send_task.abort();

    tracing::info!("User {} disconnected from WebSocket {}", user_id, connection_id);
}

async fn run_worker(
    state: AppState,
    session: Arc<PeerSession>,
    mut requests: mpsc::UnboundedReceiver<(u64, Request)>,
) {
    while let Some((id, request)) = requests.recv().await {
        if !state.rooms.registry().is_connected(session.connection_id).await {
            break;
        }

        let body = match dispatch(&state, &session, request).await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!("Request {} from {} failed: {}", id, session.connection_id, e);
                ResponseBody::Error(e.to_payload())
            }
        };

        session.send(&ServerMessage::Response { id, body });
    }
}

async fn dispatch(state: &AppState, session: &PeerSession, request: Request) -> Result<ResponseBody> {
    let rooms = &state.rooms;
    let conn = session.connection_id;

    match request {
        Request::GetCapabilities => Ok(ResponseBody::Capabilities {
            rtp_capabilities: rooms.capabilities(),
        }),
        Request::CreateTransport { direction } => rooms
            .create_transport(conn, direction)
            .await
            .map(ResponseBody::TransportCreated),
        Request::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            rooms
                .connect_transport(conn, &transport_id, dtls_parameters)
                .await?;
            Ok(ResponseBody::TransportConnected { transport_id })
        }
        Request::Attend { meeting_id } => {
            let outcome = rooms.attend(meeting_id, session.user_id, Some(conn)).await?;
            Ok(ResponseBody::Attended {
                already: outcome.already,
                message: outcome.message().to_string(),
            })
        }
        Request::Produce {
            meeting_id,
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let producer_id = rooms
                .produce(conn, meeting_id, &transport_id, kind, rtp_parameters)
                .await?;
            Ok(ResponseBody::Produced { producer_id })
        }
        Request::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => rooms
            .consume(conn, &transport_id, &producer_id, rtp_capabilities)
            .await
            .map(ResponseBody::ConsumerCreated),
        Request::CloseProducer { producer_id } => {
            rooms.close_producer(conn, &producer_id).await?;
            Ok(ResponseBody::ProducerClosed { producer_id })
        }
        Request::GetParticipants { meeting_id } => Ok(ResponseBody::Participants {
            participants: rooms.participants(meeting_id).await?,
        }),
        Request::Leave { meeting_id } => {
            rooms.leave(meeting_id, session.user_id).await?;
            Ok(ResponseBody::Left {
                success: true,
                message: "left".to_string(),
            })
        }
    }
}
