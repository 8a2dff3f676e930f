use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocketUpgrade, Query, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::engine::{
    guard_panics, process_guarded, Delivery, Patch, PatchStream, ProcessOptions, Rejection,
    SingleResult, ValueStream,
};
use crate::types::OperationRequest;
use crate::{ws_gateway, AppState};

const MULTIPART_CONTENT_TYPE: &str = "multipart/mixed; boundary=\"-\"";
const PART_CONTENT_TYPE: &str = "Content-Type: application/json; charset=utf-8";
const MULTIPART_END: &[u8] = b"\r\n-----\r\n";

pub fn router(state: Arc<AppState>, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/graphql", get(graphql_get).post(graphql_post))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    if cors_enabled {
        router.layer(middleware::from_fn(cors))
    } else {
        router
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
    query: Option<String>,
    operation_name: Option<String>,
    variables: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostBody {
    query: Option<String>,
    #[serde(default)]
    operation_name: Option<String>,
    #[serde(default)]
    variables: Option<Value>,
}

pub async fn graphql_get(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<GetParams>,
) -> Response {
    if let Some(ws) = ws {
        return ws_gateway::upgrade(ws, state);
    }

    let Some(query) = params.query else {
        return bad_request("Must provide query string.");
    };
    let variables = match params.variables.as_deref() {
        None | Some("") => None,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(variables) => Some(variables),
            Err(_) => return bad_request("Variables are invalid JSON."),
        },
    };

    let request = OperationRequest {
        query,
        operation_name: params.operation_name.filter(|n| !n.is_empty()),
        variables,
    };
    run(&state, request, false).await
}

pub async fn graphql_post(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body: PostBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "rejecting malformed body");
            return bad_request("POST body sent invalid JSON.");
        }
    };
    let Some(query) = body.query else {
        return bad_request("Must provide query string.");
    };

    let request = OperationRequest {
        query,
        operation_name: body.operation_name,
        variables: body.variables,
    };
    run(&state, request, true).await
}

async fn run(state: &AppState, request: OperationRequest, allow_mutations: bool) -> Response {
    let options = ProcessOptions {
        rules: &state.rules,
        allow_mutations,
    };
    let delivery = process_guarded(
        state.executor.as_ref(),
        request,
        state.contexts.build(),
        options,
    )
    .await;

    match delivery {
        Ok(delivery) => {
            debug!(mode = ?delivery.mode(), "delivering http response");
            deliver(delivery)
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

fn deliver(delivery: Delivery) -> Response {
    match delivery {
        Delivery::Single(result) => single_response(result),
        Delivery::Multipart(patches) => multipart_response(patches),
        Delivery::EventStream(values) => event_stream_response(values),
    }
}

fn single_response(result: SingleResult) -> Response {
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::OK);
    let mut response = (status, axum::Json(result.payload)).into_response();
    for (name, value) in result.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!(header = %name, "dropping invalid result header"),
        }
    }
    response
}

fn rejection_response(rejection: &Rejection) -> Response {
    let status = StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::BAD_REQUEST);
    (status, axum::Json(rejection.to_payload())).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({ "errors": [{ "message": message }] })),
    )
        .into_response()
}

pub fn multipart_part(patch: &Patch) -> String {
    let json = serde_json::to_string(&patch.payload).unwrap_or_else(|_| "{}".to_string());
    let mut lines = vec!["", PART_CONTENT_TYPE, "", json.as_str()];
    if patch.has_next {
        lines.push("---");
    }
    lines.join("\r\n")
}

pub fn multipart_body(patches: PatchStream) -> BoxStream<'static, Bytes> {
    let parts = AssertUnwindSafe(patches)
        .catch_unwind()
        .map(|patch| match patch {
            Ok(patch) => multipart_part(&patch),
            Err(_) => {
                error!("engine panicked during multipart delivery");
                let mut payload = Rejection::Internal("incremental delivery failed".into()).to_payload();
                payload["hasNext"] = Value::Bool(false);
                multipart_part(&Patch::new(payload, false))
            }
        })
        .map(Bytes::from);

    stream::once(async { Bytes::from_static(b"---") })
        .chain(parts)
        .chain(stream::once(async { Bytes::from_static(MULTIPART_END) }))
        .boxed()
}

fn multipart_response(patches: PatchStream) -> Response {
    let body = multipart_body(patches).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "keep-alive")
        .header(header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE)
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub fn event_stream_body(values: ValueStream) -> BoxStream<'static, Bytes> {
    guard_panics(values)
        .map(|value| {
            let json = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
            Bytes::from(format!("data: {json}\n\n"))
        })
        .boxed()
}

fn event_stream_response(values: ValueStream) -> Response {
    let body = event_stream_body(values).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CONNECTION, "keep-alive")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight_response();
    }
    let mut response = next.run(request).await;
    allow_any_origin(&mut response);
    response
}

fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    allow_any_origin(&mut response);
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

fn allow_any_origin(response: &mut Response) {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}
