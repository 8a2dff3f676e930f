use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{future, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    context::RequestContext,
    engine::{errors_to_json, guard_panics, process_guarded, Executor, ProcessOptions, ValidationRules},
    subscriptions::{drive, ConnectionId, EventKind, SubscriptionEvent, SubscriptionRegistry},
    types::{result_frame, EventFrame, ExecutePayload},
};

#[derive(Clone)]
pub struct SocketParameter {
    pub executor: Arc<dyn Executor>,
    pub rules: ValidationRules,
    pub context: RequestContext,
    pub send_buffer: usize,
}

type GetParameter = Arc<dyn Fn(ConnectionId) -> SocketParameter + Send + Sync>;

pub fn router<F>(get_parameter: F) -> Router
where
    F: Fn(ConnectionId) -> SocketParameter + Send + Sync + 'static,
{
    let get_parameter: GetParameter = Arc::new(get_parameter);
    Router::new()
        .route("/", get(socket_handler))
        .with_state(get_parameter)
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(get_parameter): State<GetParameter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, get_parameter))
}

fn outbound_channel(
    parameter: &SocketParameter,
) -> (mpsc::Sender<SubscriptionEvent>, mpsc::Receiver<SubscriptionEvent>) {
    mpsc::channel(parameter.send_buffer.max(1))
}

async fn handle_socket(socket: WebSocket, get_parameter: GetParameter) {
    let (mut ws_sink, ws_stream) = socket.split();
    let connection_id: ConnectionId = Uuid::new_v4();
    let parameter = get_parameter(connection_id);
    let (tx, mut rx) = outbound_channel(&parameter);

    info!(%connection_id, "event socket connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(text) = render(event) else {
                continue;
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
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

    EventConnection::new(connection_id, parameter, tx)
        .run(inbound)
        .await;

    send_task.abort();
    info!(%connection_id, "event socket disconnected");
}

pub fn render(event: SubscriptionEvent) -> Option<String> {
    if event.is_stale() {
        return None;
    }
    let id: Value = serde_json::from_str(event.handle.id()).unwrap_or(Value::Null);
    let payload = match event.kind {
        EventKind::Next(payload) => payload,
        EventKind::Error(errors) => json!({ "errors": errors, "isFinal": true }),
        EventKind::Complete => json!({ "isFinal": true }),
    };
    Some(result_frame(&id, payload).to_string())
}

fn registry_key(id: &Value) -> String {
    id.to_string()
}

pub struct EventConnection {
    id: ConnectionId,
    parameter: SocketParameter,
    registry: SubscriptionRegistry,
    outbound: mpsc::Sender<SubscriptionEvent>,
}

impl EventConnection {
    pub fn new(
        id: ConnectionId,
        parameter: SocketParameter,
        outbound: mpsc::Sender<SubscriptionEvent>,
    ) -> Self {
        Self {
            id,
            parameter,
            registry: SubscriptionRegistry::new(id),
            outbound,
        }
    }

    pub async fn run<S>(self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(text) = inbound.next().await {
            match EventFrame::parse(&text) {
                Ok(EventFrame::Execute(payload)) => self.execute(payload),
                Ok(EventFrame::Unsubscribe(payload)) => {
                    self.registry.cancel(&registry_key(&payload.id));
                }
                Err(e) => warn!(connection_id = %self.id, error = %e, "ignoring frame"),
            }
        }

        let cancelled = self.registry.cancel_all();
        debug!(connection_id = %self.id, cancelled, "event socket operations cancelled");
    }

    fn execute(&self, payload: ExecutePayload) {
        let (id, request) = payload.into_request();
        let key = registry_key(&id);
        // A repeated id replaces the operation running under it.
        if self.registry.cancel(&key) {
            debug!(connection_id = %self.id, id = %key, "replacing operation");
        }
        let handle = match self.registry.register(&key) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "operation not started");
                return;
            }
        };

        let parameter = self.parameter.clone();
        let registry = self.registry.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let options = ProcessOptions {
                rules: &parameter.rules,
                allow_mutations: true,
            };
            let processed = tokio::select! {
                _ = handle.cancelled() => return,
                processed = process_guarded(
                    parameter.executor.as_ref(),
                    request,
                    parameter.context.clone(),
                    options,
                ) => processed,
            };

            match processed {
                Ok(delivery) => {
                    drive(registry, handle, guard_panics(delivery.into_values()), outbound).await
                }
                Err(rejection) => {
                    registry.finish(&handle);
                    let event = SubscriptionEvent {
                        handle,
                        kind: EventKind::Error(errors_to_json(&rejection.errors())),
                    };
                    let _ = outbound.send(event).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use uuid::Uuid;

    use super::*;
    use crate::context::GREETINGS_KEY;
    use crate::test_support;
    use crate::AppState;

    struct Client {
        to_server: mpsc::Sender<String>,
        from_server: mpsc::Receiver<SubscriptionEvent>,
    }

    impl Client {
        fn connect(state: &AppState, rules: ValidationRules) -> Self {
            Self::with_buffer(state, rules, state.ws_send_buffer)
        }

        fn with_buffer(state: &AppState, rules: ValidationRules, send_buffer: usize) -> Self {
            let parameter = SocketParameter {
                executor: state.executor.clone(),
                rules,
                context: state.contexts.build(),
                send_buffer,
            };
            let (to_server, inbound) = mpsc::channel(16);
            let (outbound, from_server) = outbound_channel(&parameter);
            let connection = EventConnection::new(Uuid::new_v4(), parameter, outbound);
            tokio::spawn(connection.run(ReceiverStream::new(inbound)));
            Self {
                to_server,
                from_server,
            }
        }

        async fn send(&self, frame: Value) {
            self.to_server.send(frame.to_string()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            loop {
                let event = self.from_server.recv().await.unwrap();
                if let Some(text) = render(event) {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }
    }

    fn execute(id: Value, operation: &str) -> Value {
        json!(["@graphql/execute", { "id": id, "operation": operation }])
    }

    #[tokio::test]
    async fn query_result_then_final() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client.send(execute(json!(1), "{ ping }")).await;

        assert_eq!(
            client.recv().await,
            json!(["@graphql/result", { "id": 1, "data": { "ping": true } }])
        );
        assert_eq!(
            client.recv().await,
            json!(["@graphql/result", { "id": 1, "isFinal": true }])
        );
    }

    #[tokio::test]
    async fn subscription_streams_results() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client
            .send(execute(json!("s"), "subscription { count(to: 2) }"))
            .await;

        assert_eq!(client.recv().await[1]["data"]["count"], "1");
        assert_eq!(client.recv().await[1]["data"]["count"], "2");
        assert_eq!(client.recv().await[1], json!({ "id": "s", "isFinal": true }));
    }

    #[tokio::test]
    async fn zero_send_buffer_still_delivers_every_result() {
        let state = test_support::state();
        let mut client = Client::with_buffer(&state, ValidationRules::default(), 0);
        client
            .send(execute(json!("s"), "subscription { count(to: 3) }"))
            .await;

        assert_eq!(client.recv().await[1]["data"]["count"], "1");
        assert_eq!(client.recv().await[1]["data"]["count"], "2");
        assert_eq!(client.recv().await[1]["data"]["count"], "3");
        assert_eq!(client.recv().await[1], json!({ "id": "s", "isFinal": true }));
    }

    #[tokio::test]
    async fn rejected_operation_reports_errors_as_final() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client
            .send(execute(json!(2), "query @live { ... @defer { greetings } }"))
            .await;

        let result = client.recv().await;
        assert_eq!(result[1]["id"], 2);
        assert_eq!(result[1]["isFinal"], true);
        assert_eq!(
            result[1]["errors"][0]["message"],
            "Cannot mix \"@defer\" with \"@live\"."
        );
    }

    #[tokio::test]
    async fn live_defer_rule_can_be_disabled() {
        let state = test_support::state();
        let rules = ValidationRules {
            no_live_mixed_with_defer_stream: false,
            ..ValidationRules::default()
        };
        let mut client = Client::connect(&state, rules);
        client
            .send(execute(json!(3), "query @live { ... @defer { greetings } }"))
            .await;

        let result = client.recv().await;
        assert_eq!(result[1]["id"], 3);
        assert!(result[1]["data"]["greetings"].is_array());
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client.to_server.send("garbage".into()).await.unwrap();
        client.send(json!(["@graphql/nope", {}])).await;
        client.send(execute(json!(4), "{ ping }")).await;
        assert_eq!(client.recv().await[1]["data"]["ping"], true);
    }

    #[tokio::test]
    async fn live_invalidation_sends_another_result() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client
            .send(execute(json!(7), "query @live { greetings }"))
            .await;
        assert_eq!(
            client.recv().await[1]["data"]["greetings"],
            json!(["Hello", "Hi", "Ay", "Sup"])
        );

        state.contexts.state().rotate_greetings();
        assert_eq!(state.live.invalidate(GREETINGS_KEY), 1);
        assert_eq!(
            client.recv().await,
            json!(["@graphql/result", { "id": 7, "data": { "greetings": ["Sup", "Hello", "Hi", "Ay"] } }])
        );
    }

    #[tokio::test]
    async fn unsubscribe_stops_results() {
        let state = test_support::state();
        let mut client = Client::connect(&state, ValidationRules::default());
        client
            .send(execute(json!(5), "subscription { count(to: 10000) }"))
            .await;
        assert_eq!(client.recv().await[1]["data"]["count"], "1");

        client
            .send(json!(["@graphql/unsubscribe", { "id": 5 }]))
            .await;
        client.send(execute(json!(6), "{ ping }")).await;

        // Results for 5 queued before the unsubscribe are filtered out.
        let next = client.recv().await;
        assert_eq!(next[1]["id"], 6);

        for _ in 0..200 {
            if state.active.count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine work still active");
    }
}
