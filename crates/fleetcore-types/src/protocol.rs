use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A client→server control-surface frame (`spec.md` §4.6/§6): a `type` tag,
/// an optional `reqId` the response must echo, and a type-specific body.
///
/// Individual handlers deserialize `body` into their own request struct via
/// `serde_json::from_value` — this mirrors the handler registry's "each
/// message `type` maps to one handler" design: the envelope only knows how
/// to find the tag and the correlation ID, never the payload shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub req_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ClientEnvelope {
    pub fn parse_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }
}

/// A server→client control-surface frame. Responses always echo the
/// request's `reqId` (`spec.md` §4.6); server-pushed frames (e.g.
/// `ask-user`, `session.title`) carry `req_id: None`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ServerEnvelope {
    pub fn new(kind: impl Into<String>, req_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            req_id,
            body: Map::new(),
        }
    }

    pub fn with_body<T: Serialize>(
        kind: impl Into<String>,
        req_id: Option<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(body)?;
        let body = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self {
            kind: kind.into(),
            req_id,
            body,
        })
    }

    pub fn error(req_id: Option<String>, message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(message.into()));
        Self {
            kind: "error".to_string(),
            req_id,
            body: map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_body_by_type() {
        let raw = serde_json::json!({"type": "ping", "reqId": "r1"});
        let env: ClientEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(env.req_id.as_deref(), Some("r1"));
    }

    #[test]
    fn echoes_req_id_on_response() {
        let resp = ServerEnvelope::new("pong", Some("r1".to_string()));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["reqId"], "r1");
        assert_eq!(value["type"], "pong");
    }
}
