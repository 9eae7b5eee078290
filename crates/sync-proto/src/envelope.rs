use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DataKind, ProtoError, ProtoResult, Topic};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Request = 1,
    Reply = 2,
    Exception = 3,
    Data = 4,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Exception),
            4 => Ok(MessageType::Data),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }
}

/// `{ "<verb>": "subscribe", "data"?: params }`
pub fn subscribe_payload(topic: Topic, params: Option<&Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(topic.verb().to_string(), Value::from("subscribe"));
    if let Some(params) = params {
        payload.insert("data".to_string(), params.clone());
    }
    Value::Object(payload)
}

/// One unit on the wire, encoded as the order-significant array
/// `[protocolVersion, messageType, correlationId, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub protocol_version: u32,
    pub message_type: MessageType,
    pub correlation_id: u64,
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope(u32, MessageType, u64, Value);

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        Envelope {
            protocol_version: raw.0,
            message_type: raw.1,
            correlation_id: raw.2,
            payload: raw.3,
        }
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        RawEnvelope(
            envelope.protocol_version,
            envelope.message_type,
            envelope.correlation_id,
            envelope.payload,
        )
    }
}

impl Envelope {
    pub fn new(message_type: MessageType, correlation_id: u64, payload: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_type,
            correlation_id,
            payload,
        }
    }

    /// REQUEST envelope carrying [`subscribe_payload`].
    pub fn subscribe(correlation_id: u64, topic: Topic, params: Option<&Value>) -> Self {
        Self::new(
            MessageType::Request,
            correlation_id,
            subscribe_payload(topic, params),
        )
    }

    pub fn reply(correlation_id: u64, data: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("data".to_string(), data);
        Self::new(MessageType::Reply, correlation_id, Value::Object(payload))
    }

    pub fn exception(correlation_id: u64, error_type: &str, message: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("et".to_string(), Value::from(error_type));
        payload.insert("msg".to_string(), Value::from(message));
        Self::new(MessageType::Exception, correlation_id, Value::Object(payload))
    }

    pub fn data(kind: DataKind, data: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("dt".to_string(), Value::from(kind.as_wire()));
        payload.insert("data".to_string(), data);
        Self::new(MessageType::Data, 0, Value::Object(payload))
    }

    pub fn to_text(&self) -> ProtoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> ProtoResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.protocol_version != PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(envelope.protocol_version));
        }
        Ok(envelope)
    }

    /// Decodes a server-originated envelope into its typed form.
    pub fn into_frame(self) -> ProtoResult<ServerFrame> {
        let correlation_id = self.correlation_id;
        match self.message_type {
            MessageType::Request => Err(ProtoError::UnexpectedMessageType(MessageType::Request)),
            MessageType::Reply => {
                let data = match self.payload {
                    Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
                    Value::Null => Value::Null,
                    _ => return Err(ProtoError::MalformedPayload("reply payload is not an object")),
                };
                Ok(ServerFrame::Reply {
                    correlation_id,
                    data,
                })
            }
            MessageType::Exception => {
                let exception: ExceptionPayload = serde_json::from_value(self.payload)
                    .map_err(|_| ProtoError::MalformedPayload("exception payload lacks et/msg"))?;
                Ok(ServerFrame::Exception {
                    correlation_id,
                    exception,
                })
            }
            MessageType::Data => {
                let Value::Object(mut map) = self.payload else {
                    return Err(ProtoError::MalformedPayload("data payload is not an object"));
                };
                let dt = map
                    .get("dt")
                    .and_then(Value::as_str)
                    .ok_or(ProtoError::MalformedPayload("data payload lacks dt"))?;
                let kind = DataKind::from_wire(dt)?;
                let data = map.remove("data").unwrap_or(Value::Null);
                let subscription_id = data.get("subscriptionId").and_then(Value::as_u64);
                Ok(ServerFrame::Data(DataFrame {
                    kind,
                    subscription_id,
                    data,
                }))
            }
        }
    }
}

/// Typed view of a server-originated envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Reply {
        correlation_id: u64,
        data: Value,
    },
    Exception {
        correlation_id: u64,
        exception: ExceptionPayload,
    },
    Data(DataFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub kind: DataKind,
    pub subscription_id: Option<u64>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub et: String,
    pub msg: String,
}

impl ExceptionPayload {
    pub fn kind(&self) -> ExceptionKind {
        ExceptionKind::from_wire(&self.et)
    }
}

/// Error type (`et`) carried by an EXCEPTION envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    InvalidIdentification,
    InvalidMessage,
    InvalidRequest,
    ForbiddenRequest,
    Other(String),
}

impl ExceptionKind {
    pub fn from_wire(et: &str) -> Self {
        match et {
            "InvalidIdentification" => ExceptionKind::InvalidIdentification,
            "InvalidMessage" => ExceptionKind::InvalidMessage,
            "InvalidRequest" => ExceptionKind::InvalidRequest,
            "ForbiddenRequest" => ExceptionKind::ForbiddenRequest,
            other => ExceptionKind::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            ExceptionKind::InvalidIdentification => "InvalidIdentification",
            ExceptionKind::InvalidMessage => "InvalidMessage",
            ExceptionKind::InvalidRequest => "InvalidRequest",
            ExceptionKind::ForbiddenRequest => "ForbiddenRequest",
            ExceptionKind::Other(et) => et,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_request_is_encoded_as_array() {
        let envelope = Envelope::subscribe(7, Topic::Parameter, Some(&json!({"id": ["/a"]})));
        let text = envelope.to_text().expect("encode");
        assert_eq!(
            text,
            r#"[1,1,7,{"data":{"id":["/a"]},"parameter":"subscribe"}]"#
        );
    }

    #[test]
    fn subscribe_without_params_omits_data() {
        let envelope = Envelope::subscribe(1, Topic::CommandQueues, None);
        assert_eq!(envelope.payload, json!({"cqueues": "subscribe"}));
    }

    #[test]
    fn decodes_parameter_data_with_subscription_id() {
        let text = r#"[1,4,0,{"dt":"PARAMETER","data":{"subscriptionId":3,"parameter":[]}}]"#;
        let frame = Envelope::from_text(text).unwrap().into_frame().unwrap();
        match frame {
            ServerFrame::Data(data) => {
                assert_eq!(data.kind, DataKind::Parameter);
                assert_eq!(data.subscription_id, Some(3));
                assert_eq!(data.data["parameter"], json!([]));
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_reply_and_exception() {
        let reply = Envelope::from_text(r#"[1,2,5,{"data":{"subscriptionId":9}}]"#)
            .unwrap()
            .into_frame()
            .unwrap();
        assert_eq!(
            reply,
            ServerFrame::Reply {
                correlation_id: 5,
                data: json!({"subscriptionId": 9}),
            }
        );

        let exception = Envelope::from_text(r#"[1,3,6,{"et":"InvalidRequest","msg":"nope"}]"#)
            .unwrap()
            .into_frame()
            .unwrap();
        let ServerFrame::Exception {
            correlation_id,
            exception,
        } = exception
        else {
            panic!("expected exception frame");
        };
        assert_eq!(correlation_id, 6);
        assert_eq!(exception.kind(), ExceptionKind::InvalidRequest);
        assert_eq!(exception.msg, "nope");
    }

    #[test]
    fn rejects_foreign_versions_and_types() {
        assert!(matches!(
            Envelope::from_text(r#"[2,4,0,{}]"#),
            Err(ProtoError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            Envelope::from_text(r#"[1,9,0,{}]"#),
            Err(ProtoError::Json(_))
        ));
        let request = Envelope::subscribe(1, Topic::Time, None);
        assert!(matches!(
            request.into_frame(),
            Err(ProtoError::UnexpectedMessageType(MessageType::Request))
        ));
    }

    #[test]
    fn unknown_exception_types_are_preserved() {
        let kind = ExceptionKind::from_wire("QuotaExceeded");
        assert_eq!(kind, ExceptionKind::Other("QuotaExceeded".into()));
        assert_eq!(kind.as_wire(), "QuotaExceeded");
    }
}
