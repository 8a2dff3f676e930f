use std::sync::Arc;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{future, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    engine::{errors_to_json, guard_panics, process_guarded, ProcessOptions},
    subscriptions::{
        drive, ConnectionId, EventKind, SubscriptionEvent, SubscriptionHandle,
        SubscriptionRegistry,
    },
    types::{ClientMessage, OperationRequest, ServerMessage, TRANSPORT_WS_PROTOCOL},
    AppState,
};

pub const CLOSE_INVALID_MESSAGE: u16 = 4400;
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_INIT_TIMEOUT: u16 = 4408;
pub const CLOSE_SUBSCRIBER_EXISTS: u16 = 4409;
pub const CLOSE_TOO_MANY_INITS: u16 = 4429;

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("Invalid message received")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Too many initialisation requests")]
    TooManyInits,
    #[error(transparent)]
    Registry(#[from] crate::subscriptions::RegistryError),
}

impl GatewayError {
    fn close_code(&self) -> u16 {
        match self {
            GatewayError::InvalidMessage(_) => CLOSE_INVALID_MESSAGE,
            GatewayError::Unauthorized => CLOSE_UNAUTHORIZED,
            GatewayError::TooManyInits => CLOSE_TOO_MANY_INITS,
            GatewayError::Registry(_) => CLOSE_SUBSCRIBER_EXISTS,
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Event(SubscriptionEvent),
    Close(u16, String),
}

impl From<SubscriptionEvent> for Outbound {
    fn from(event: SubscriptionEvent) -> Self {
        Outbound::Event(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Close(u16, String),
}

pub fn render(outbound: Outbound) -> Option<WireFrame> {
    let message = match outbound {
        Outbound::Message(message) => message,
        Outbound::Close(code, reason) => return Some(WireFrame::Close(code, reason)),
        Outbound::Event(event) if event.is_stale() => {
            debug!(id = event.handle.id(), "dropping event of cancelled subscription");
            return None;
        }
        Outbound::Event(SubscriptionEvent { handle, kind }) => {
            let id = handle.id().to_string();
            match kind {
                EventKind::Next(payload) => ServerMessage::Next { id, payload },
                EventKind::Error(payload) => ServerMessage::Error { id, payload },
                EventKind::Complete => ServerMessage::Complete { id },
            }
        }
    };
    Some(WireFrame::Text(serialize_server_msg(&message)))
}

pub fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>) -> Response {
    ws.protocols([TRANSPORT_WS_PROTOCOL])
        .on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sink, ws_stream) = socket.split();
    let connection_id: ConnectionId = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.ws_send_buffer);

    info!(%connection_id, "ws connected");

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let Some(frame) = render(outbound) else {
                continue;
            };
            let (message, closing) = match frame {
                WireFrame::Text(text) => (Message::Text(text), false),
                WireFrame::Close(code, reason) => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if ws_sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let inbound = ws_stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        })
        .boxed();

    let closed_by_server = Connection::new(connection_id, state, tx).run(inbound).await;

    if closed_by_server {
        let _ = send_task.await;
    } else {
        send_task.abort();
    }
    info!(%connection_id, "ws disconnected");
}

pub struct Connection {
    id: ConnectionId,
    state: Arc<AppState>,
    registry: SubscriptionRegistry,
    outbound: mpsc::Sender<Outbound>,
    acknowledged: bool,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    pub fn new(id: ConnectionId, state: Arc<AppState>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            registry: SubscriptionRegistry::new(id),
            state,
            outbound,
            acknowledged: false,
        }
    }

    pub async fn run<S>(mut self, mut inbound: S) -> bool
    where
        S: Stream<Item = String> + Unpin,
    {
        let init_timeout = tokio::time::sleep(self.state.ws_init_timeout);
        tokio::pin!(init_timeout);

        let closed_by_server = loop {
            tokio::select! {
                _ = &mut init_timeout, if !self.acknowledged => {
                    warn!(connection_id = %self.id, "connection init timed out");
                    self.close(CLOSE_INIT_TIMEOUT, "Connection initialisation timeout").await;
                    break true;
                }
                text = inbound.next() => {
                    let Some(text) = text else {
                        break false;
                    };
                    match self.handle(&text).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break false,
                        Err(e) => {
                            warn!(connection_id = %self.id, error = %e, "closing connection");
                            self.close(e.close_code(), &e.to_string()).await;
                            break true;
                        }
                    }
                }
            }
        };

        let cancelled = self.registry.cancel_all();
        debug!(connection_id = %self.id, cancelled, "connection subscriptions cancelled");
        closed_by_server
    }

    async fn handle(&mut self, text: &str) -> Result<Flow, GatewayError> {
        let message: ClientMessage = serde_json::from_str(text)?;

        let reply = match message {
            ClientMessage::ConnectionInit { .. } => {
                if self.acknowledged {
                    return Err(GatewayError::TooManyInits);
                }
                self.acknowledged = true;
                Some(ServerMessage::ConnectionAck)
            }
            ClientMessage::Ping { .. } => Some(ServerMessage::Pong { payload: None }),
            ClientMessage::Pong { .. } => None,
            ClientMessage::Subscribe { id, payload } => {
                if !self.acknowledged {
                    return Err(GatewayError::Unauthorized);
                }
                let handle = self.registry.register(&id)?;
                self.spawn_subscription(handle, payload);
                None
            }
            ClientMessage::Complete { id } => {
                self.registry.cancel(&id);
                None
            }
        };

        match reply {
            Some(message) => Ok(self.send(Outbound::Message(message)).await),
            None => Ok(Flow::Continue),
        }
    }

    fn spawn_subscription(&self, handle: SubscriptionHandle, request: OperationRequest) {
        let state = self.state.clone();
        let registry = self.registry.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let options = ProcessOptions {
                rules: &state.rules,
                allow_mutations: true,
            };
            let processed = tokio::select! {
                _ = handle.cancelled() => return,
                processed = process_guarded(
                    state.executor.as_ref(),
                    request,
                    state.contexts.build(),
                    options,
                ) => processed,
            };

            match processed {
                Ok(delivery) => {
                    debug!(id = handle.id(), mode = ?delivery.mode(), "subscription started");
                    drive(registry, handle, guard_panics(delivery.into_values()), outbound).await;
                }
                Err(rejection) => {
                    debug!(id = handle.id(), error = %rejection, "subscription rejected");
                    registry.finish(&handle);
                    let event = SubscriptionEvent {
                        handle,
                        kind: EventKind::Error(errors_to_json(&rejection.errors())),
                    };
                    let _ = outbound.send(event.into()).await;
                }
            }
        });
    }

    async fn send(&self, outbound: Outbound) -> Flow {
        match self.outbound.send(outbound).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!(connection_id = %self.id, "writer gone");
                Flow::Close
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self.send(Outbound::Close(code, reason.to_string())).await;
    }
}

fn serialize_server_msg(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        error!("failed to serialize server msg: {e}");
        serde_json::json!({ "type": "error", "payload": [{ "message": e.to_string() }] })
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;
    use uuid::Uuid;

    use super::*;
    use crate::context::GREETINGS_KEY;
    use crate::test_support;

    struct Client {
        state: Arc<AppState>,
        to_server: mpsc::Sender<String>,
        from_server: mpsc::Receiver<Outbound>,
        task: JoinHandle<bool>,
    }

    impl Client {
        fn connect() -> Self {
            Self::connect_with(test_support::state())
        }

        fn connect_with(state: Arc<AppState>) -> Self {
            let (to_server, inbound) = mpsc::channel(16);
            let (outbound, from_server) = mpsc::channel(64);
            let connection = Connection::new(Uuid::new_v4(), state.clone(), outbound);
            let task = tokio::spawn(connection.run(ReceiverStream::new(inbound)));
            Self {
                state,
                to_server,
                from_server,
                task,
            }
        }

        async fn send(&self, message: Value) {
            self.to_server.send(message.to_string()).await.unwrap();
        }

        async fn recv(&mut self) -> Option<WireFrame> {
            loop {
                let outbound = self.from_server.recv().await?;
                if let Some(frame) = render(outbound) {
                    return Some(frame);
                }
            }
        }

        async fn recv_json(&mut self) -> Value {
            match self.recv().await {
                Some(WireFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        async fn init(&mut self) {
            self.send(json!({ "type": "connection_init" })).await;
            assert_eq!(self.recv_json().await, json!({ "type": "connection_ack" }));
        }
    }

    #[tokio::test]
    async fn count_subscription_completes() {
        let mut client = Client::connect();
        client.init().await;
        client
            .send(json!({
                "type": "subscribe",
                "id": "1",
                "payload": { "query": "subscription { count(to: 3) }" }
            }))
            .await;

        for n in ["1", "2", "3"] {
            assert_eq!(
                client.recv_json().await,
                json!({ "type": "next", "id": "1", "payload": { "data": { "count": n } } })
            );
        }
        assert_eq!(
            client.recv_json().await,
            json!({ "type": "complete", "id": "1" })
        );
    }

    #[tokio::test]
    async fn query_is_one_next_then_complete() {
        let mut client = Client::connect();
        client.init().await;
        client
            .send(json!({ "type": "subscribe", "id": "q", "payload": { "query": "{ ping }" } }))
            .await;
        assert_eq!(
            client.recv_json().await,
            json!({ "type": "next", "id": "q", "payload": { "data": { "ping": true } } })
        );
        assert_eq!(client.recv_json().await["type"], "complete");
    }

    #[tokio::test]
    async fn validation_error_keeps_connection_open() {
        let mut client = Client::connect();
        client.init().await;
        client
            .send(json!({
                "type": "subscribe",
                "id": "1",
                "payload": { "query": "query @live { ... @defer { greetings } }" }
            }))
            .await;

        let error = client.recv_json().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["id"], "1");
        assert_eq!(
            error["payload"][0]["message"],
            "Cannot mix \"@defer\" with \"@live\"."
        );

        client.send(json!({ "type": "ping" })).await;
        assert_eq!(client.recv_json().await, json!({ "type": "pong" }));
    }

    #[tokio::test]
    async fn subscribe_before_init_is_unauthorized() {
        let mut client = Client::connect();
        client
            .send(json!({ "type": "subscribe", "id": "1", "payload": { "query": "{ ping }" } }))
            .await;
        assert_eq!(
            client.recv().await,
            Some(WireFrame::Close(CLOSE_UNAUTHORIZED, "Unauthorized".into()))
        );
        assert!(client.task.await.unwrap());
    }

    #[tokio::test]
    async fn second_init_closes_with_4429() {
        let mut client = Client::connect();
        client.init().await;
        client.send(json!({ "type": "connection_init" })).await;
        assert_eq!(
            client.recv().await,
            Some(WireFrame::Close(
                CLOSE_TOO_MANY_INITS,
                "Too many initialisation requests".into()
            ))
        );
    }

    #[tokio::test]
    async fn garbage_closes_with_4400() {
        let mut client = Client::connect();
        client.to_server.send("{nope".into()).await.unwrap();
        assert!(matches!(
            client.recv().await,
            Some(WireFrame::Close(CLOSE_INVALID_MESSAGE, _))
        ));
    }

    #[tokio::test]
    async fn duplicate_id_closes_with_4409() {
        let mut client = Client::connect();
        client.init().await;
        let subscribe = json!({
            "type": "subscribe",
            "id": "dup",
            "payload": { "query": "subscription { randomHash }" }
        });
        client.send(subscribe.clone()).await;
        client.send(subscribe).await;
        assert_eq!(
            client.recv().await,
            Some(WireFrame::Close(
                CLOSE_SUBSCRIBER_EXISTS,
                "Subscriber for dup already exists".into()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_init_times_out() {
        let mut client = Client::connect();
        assert!(matches!(
            client.recv().await,
            Some(WireFrame::Close(CLOSE_INIT_TIMEOUT, _))
        ));
    }

    #[tokio::test]
    async fn client_complete_stops_further_nexts() {
        let mut client = Client::connect();
        client.init().await;
        client
            .send(json!({
                "type": "subscribe",
                "id": "c",
                "payload": { "query": "subscription { count(to: 10000) }" }
            }))
            .await;
        assert_eq!(client.recv_json().await["type"], "next");

        client.send(json!({ "type": "complete", "id": "c" })).await;
        client.send(json!({ "type": "ping" })).await;

        // Anything queued before the cancel is filtered; the pong is next.
        assert_eq!(client.recv_json().await, json!({ "type": "pong" }));
        wait_for_idle(&client.state).await;

        drop(client.to_server);
        let mut leftovers = Vec::new();
        while let Some(outbound) = client.from_server.recv().await {
            if let Some(frame) = render(outbound) {
                leftovers.push(frame);
            }
        }
        assert!(leftovers.is_empty(), "unexpected frames: {leftovers:?}");
    }

    #[tokio::test]
    async fn disconnect_mid_stream_releases_work() {
        let state = test_support::state();
        let mut client = Client::connect_with(state.clone());
        client.init().await;
        client
            .send(json!({
                "type": "subscribe",
                "id": "1",
                "payload": { "query": "subscription { count(to: 10) }" }
            }))
            .await;
        assert_eq!(client.recv_json().await["payload"]["data"]["count"], "1");

        drop(client.to_server);
        assert!(!client.task.await.unwrap());
        wait_for_idle(&state).await;
    }

    #[tokio::test]
    async fn live_invalidation_is_pushed_as_next() {
        let mut client = Client::connect();
        client.init().await;
        client
            .send(json!({
                "type": "subscribe",
                "id": "live",
                "payload": { "query": "query @live { greetings ping }" }
            }))
            .await;
        let first = client.recv_json().await;
        assert_eq!(first["payload"]["data"]["ping"], true);

        client.state.contexts.state().rotate_greetings();
        assert_eq!(client.state.live.invalidate(GREETINGS_KEY), 1);
        assert_eq!(
            client.recv_json().await,
            json!({
                "type": "next",
                "id": "live",
                "payload": { "data": { "greetings": ["Sup", "Hello", "Hi", "Ay"] } }
            })
        );

        client.send(json!({ "type": "complete", "id": "live" })).await;
        wait_for_idle(&client.state).await;
        assert_eq!(client.state.live.registration_count(), 0);
    }

    async fn wait_for_idle(state: &AppState) {
        for _ in 0..200 {
            if state.active.count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine work still active: {}", state.active.count());
    }
}
