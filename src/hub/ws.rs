use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::model::HubConfig;

use super::{ClientId, ControlAction, ControlFrame, HubHandle, Outbound};

#[derive(Clone)]
pub struct WsState {
    pub hub: HubHandle,
    pub config: HubConfig,
}

pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.hub, state.config))
}

/// Serve one subscriber until either direction fails.
///
/// Reads and writes run as separate tasks so a stalled peer on one side never
/// holds up the other.
async fn handle_socket(socket: WebSocket, hub: HubHandle, config: HubConfig) {
    let (id, outbound) = hub.register();
    let (sink, stream) = socket.split();
    let done = CancellationToken::new();

    let writer = tokio::spawn(write_loop(sink, outbound, config.clone(), done.clone()));
    let reader = tokio::spawn(read_loop(stream, hub.clone(), id, config, done.clone()));

    let _ = reader.await;
    done.cancel();
    let _ = writer.await;
    hub.unregister(id);
    debug!(client = id, "websocket closed");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: HubHandle,
    id: ClientId,
    config: HubConfig,
    done: CancellationToken,
) {
    let pong_wait = config.pong_wait();
    loop {
        let next = tokio::select! {
            _ = done.cancelled() => break,
            next = timeout(pong_wait, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                debug!(client = id, "no traffic within {:?}, closing", pong_wait);
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(client = id, "websocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let Message::Text(text) = msg else {
            // pongs only refresh the deadline
            continue;
        };
        match serde_json::from_str::<ControlFrame>(text.as_str()) {
            Ok(frame) => match frame.action {
                ControlAction::Subscribe => hub.subscribe(id, &frame.channel),
                ControlAction::Unsubscribe => hub.unsubscribe(id, &frame.channel),
                ControlAction::Chat => hub.chat(&frame.channel, frame.data),
            },
            Err(e) => debug!(client = id, "ignoring malformed control frame: {}", e),
        }
    }
    done.cancel();
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    config: HubConfig,
    done: CancellationToken,
) {
    let write_wait = config.write_wait();
    let period = config.ping_period().max(std::time::Duration::from_millis(1));
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        let msg = tokio::select! {
            _ = done.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload.as_ref().into()),
                None => {
                    // dropped by the hub
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(write_wait, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("websocket write error: {}", e);
                break;
            }
            Err(_) => {
                debug!("websocket write timed out after {:?}", write_wait);
                break;
            }
        }
    }
    done.cancel();
}
