use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

impl OperationRequest {
    #[cfg(test)]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn variables_map(&self) -> Map<String, Value> {
        match &self.variables {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

pub const TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: OperationRequest,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Vec<Value>,
    },
    Complete {
        id: String,
    },
}

pub const EXECUTE_EVENT: &str = "@graphql/execute";
pub const UNSUBSCRIBE_EVENT: &str = "@graphql/unsubscribe";
pub const RESULT_EVENT: &str = "@graphql/result";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub id: Value,
    pub operation: String,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: Option<Value>,
}

impl ExecutePayload {
    pub fn into_request(self) -> (Value, OperationRequest) {
        let request = OperationRequest {
            query: self.operation,
            operation_name: self.operation_name,
            variables: self.variables,
        };
        (self.id, request)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnsubscribePayload {
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventFrame {
    Execute(ExecutePayload),
    Unsubscribe(UnsubscribePayload),
}

impl EventFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let (event, payload): (String, Value) = serde_json::from_str(text)?;
        match event.as_str() {
            EXECUTE_EVENT => Ok(EventFrame::Execute(serde_json::from_value(payload)?)),
            UNSUBSCRIBE_EVENT => Ok(EventFrame::Unsubscribe(serde_json::from_value(payload)?)),
            _ => Err(FrameError::UnknownEvent(event)),
        }
    }
}

pub fn result_frame(id: &Value, payload: Value) -> Value {
    let mut body = Map::new();
    body.insert("id".into(), id.clone());
    if let Value::Object(fields) = payload {
        body.extend(fields);
    }
    json!([RESULT_EVENT, body])
}
