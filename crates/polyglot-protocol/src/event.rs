//! Events: outcomes and progress notifications produced while handling a command.
//!
//! Every command ends with exactly one terminal event, `CommandSucceeded` or
//! `CommandFailed`; any number of intermediate events may precede it.
//!
//! Forward-compatible: an unknown `eventType` on the wire decodes into
//! `KernelEventKind::Custom { event_type, data }` instead of failing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::KernelCommand;
use crate::envelope::KernelEventEnvelope;
use crate::error::{KernelError, KernelResult};
use crate::ids::CommandToken;
use crate::kernel_info::KernelInfo;
use crate::routing::{KernelUri, RoutingSlip};
use crate::value::{CompletionItem, Diagnostic, FormattedValue, KernelValueInfo, LinePositionSpan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "event")]
#[serde(rename_all_fields = "camelCase")]
pub enum KernelEventKind {
    CodeSubmissionReceived {
        code: String,
    },
    CompleteCodeSubmissionReceived {
        code: String,
    },
    ReturnValueProduced {
        value: Value,
        #[serde(default)]
        formatted_values: Vec<FormattedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_id: Option<String>,
    },
    DisplayedValueProduced {
        #[serde(default)]
        formatted_values: Vec<FormattedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_id: Option<String>,
    },
    StandardOutputValueProduced {
        #[serde(default)]
        formatted_values: Vec<FormattedValue>,
    },
    StandardErrorValueProduced {
        #[serde(default)]
        formatted_values: Vec<FormattedValue>,
    },
    CompletionsProduced {
        #[serde(default)]
        completions: Vec<CompletionItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_position_span: Option<LinePositionSpan>,
    },
    HoverTextProduced {
        #[serde(default)]
        content: Vec<FormattedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_position_span: Option<LinePositionSpan>,
    },
    DiagnosticsProduced {
        #[serde(default)]
        diagnostics: Vec<Diagnostic>,
    },
    ValueInfosProduced {
        #[serde(default)]
        value_infos: Vec<KernelValueInfo>,
    },
    ValueProduced {
        name: String,
        formatted_value: FormattedValue,
    },
    KernelInfoProduced {
        kernel_info: KernelInfo,
    },
    KernelReady {
        #[serde(default)]
        kernel_infos: Vec<KernelInfo>,
    },
    CommandSucceeded {},
    CommandFailed {
        message: String,
    },
    /// Event type this build does not know; payload kept verbatim.
    #[serde(skip)]
    Custom {
        event_type: String,
        data: Value,
    },
}

impl KernelEventKind {
    pub fn event_type(&self) -> &str {
        match self {
            KernelEventKind::CodeSubmissionReceived { .. } => "CodeSubmissionReceived",
            KernelEventKind::CompleteCodeSubmissionReceived { .. } => {
                "CompleteCodeSubmissionReceived"
            }
            KernelEventKind::ReturnValueProduced { .. } => "ReturnValueProduced",
            KernelEventKind::DisplayedValueProduced { .. } => "DisplayedValueProduced",
            KernelEventKind::StandardOutputValueProduced { .. } => "StandardOutputValueProduced",
            KernelEventKind::StandardErrorValueProduced { .. } => "StandardErrorValueProduced",
            KernelEventKind::CompletionsProduced { .. } => "CompletionsProduced",
            KernelEventKind::HoverTextProduced { .. } => "HoverTextProduced",
            KernelEventKind::DiagnosticsProduced { .. } => "DiagnosticsProduced",
            KernelEventKind::ValueInfosProduced { .. } => "ValueInfosProduced",
            KernelEventKind::ValueProduced { .. } => "ValueProduced",
            KernelEventKind::KernelInfoProduced { .. } => "KernelInfoProduced",
            KernelEventKind::KernelReady { .. } => "KernelReady",
            KernelEventKind::CommandSucceeded {} => "CommandSucceeded",
            KernelEventKind::CommandFailed { .. } => "CommandFailed",
            KernelEventKind::Custom { event_type, .. } => event_type.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KernelEventKind::CommandSucceeded {} | KernelEventKind::CommandFailed { .. }
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        KernelEventKind::CommandFailed {
            message: message.into(),
        }
    }

    pub fn return_value(value: Value) -> Self {
        let text = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        KernelEventKind::ReturnValueProduced {
            value,
            formatted_values: vec![FormattedValue::plain_text(text)],
            value_id: None,
        }
    }

    pub fn display_text(text: impl Into<String>) -> Self {
        KernelEventKind::DisplayedValueProduced {
            formatted_values: vec![FormattedValue::plain_text(text)],
            value_id: None,
        }
    }

    fn to_wire(&self) -> KernelResult<(String, Value)> {
        if let KernelEventKind::Custom { event_type, data } = self {
            return Ok((event_type.clone(), data.clone()));
        }
        let Value::Object(mut tagged) = serde_json::to_value(self)? else {
            return Err(KernelError::Serialization(
                "event kind did not serialize to an object".to_owned(),
            ));
        };
        let payload = tagged
            .remove("event")
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok((self.event_type().to_owned(), payload))
    }

    fn from_wire(event_type: &str, payload: &Value) -> Self {
        let mut tagged = Map::new();
        tagged.insert("eventType".into(), Value::String(event_type.to_owned()));
        tagged.insert("event".into(), payload.clone());
        match serde_json::from_value::<KernelEventKind>(Value::Object(tagged)) {
            Ok(known) => known,
            Err(_) => KernelEventKind::Custom {
                event_type: event_type.to_owned(),
                data: payload.clone(),
            },
        }
    }
}

/// An event together with the command that caused it and the kernels it has
/// passed through.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    kind: KernelEventKind,
    command: Option<Arc<KernelCommand>>,
    routing_slip: RoutingSlip,
}

impl KernelEvent {
    pub fn new(kind: KernelEventKind, command: &Arc<KernelCommand>) -> Self {
        Self {
            kind,
            command: Some(Arc::clone(command)),
            routing_slip: RoutingSlip::new(),
        }
    }

    /// An event not caused by any command, such as `KernelReady`.
    pub fn unsolicited(kind: KernelEventKind) -> Self {
        Self {
            kind,
            command: None,
            routing_slip: RoutingSlip::new(),
        }
    }

    pub fn kind(&self) -> &KernelEventKind {
        &self.kind
    }

    pub fn into_kind(self) -> KernelEventKind {
        self.kind
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn command(&self) -> Option<&Arc<KernelCommand>> {
        self.command.as_ref()
    }

    pub fn token(&self) -> Option<&CommandToken> {
        self.command.as_ref().map(|command| command.token())
    }

    pub fn routing_slip(&self) -> &RoutingSlip {
        &self.routing_slip
    }

    pub fn stamp(&mut self, uri: &KernelUri) -> KernelResult<bool> {
        self.routing_slip.stamp(uri.as_str())
    }

    /// Point the event at a different instance of its command, e.g. the
    /// local original of a command that was rebuilt from the wire.
    pub fn with_command(mut self, command: Arc<KernelCommand>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn to_envelope(&self) -> KernelResult<KernelEventEnvelope> {
        let (event_type, event) = self.kind.to_wire()?;
        let command = self
            .command
            .as_ref()
            .map(|command| command.to_envelope())
            .transpose()?;
        Ok(KernelEventEnvelope {
            event_type,
            event,
            command,
            routing_slip: self.routing_slip.clone(),
        })
    }

    pub fn from_envelope(envelope: &KernelEventEnvelope) -> KernelResult<Self> {
        let command = envelope
            .command
            .as_ref()
            .map(|command| KernelCommand::from_envelope(command).map(Arc::new))
            .transpose()?;
        Ok(Self {
            kind: KernelEventKind::from_wire(&envelope.event_type, &envelope.event),
            command,
            routing_slip: envelope.routing_slip.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command() -> Arc<KernelCommand> {
        Arc::new(KernelCommand::submit_code("1+1"))
    }

    #[test]
    fn failure_roundtrip() {
        let event = KernelEvent::new(KernelEventKind::failed("boom"), &command());
        let envelope = event.to_envelope().unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["eventType"], "CommandFailed");
        assert_eq!(json["event"]["message"], "boom");
        assert_eq!(json["command"]["commandType"], "SubmitCode");

        let back = KernelEvent::from_envelope(&envelope).unwrap();
        assert!(matches!(back.kind(), KernelEventKind::CommandFailed { message } if message == "boom"));
        assert_eq!(back.token(), event.token());
        assert!(back.is_terminal());
    }

    #[test]
    fn return_value_uses_camel_case_fields() {
        let kind = KernelEventKind::return_value(json!(2));
        let event = KernelEvent::new(kind, &command());
        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.event["value"], 2);
        assert_eq!(envelope.event["formattedValues"][0]["mimeType"], "text/plain");
        assert_eq!(envelope.event["formattedValues"][0]["value"], "2");
    }

    #[test]
    fn unknown_event_type_becomes_custom() {
        let envelope = KernelEventEnvelope {
            event_type: "FutureFeature".into(),
            event: json!({"key": "value", "num": 42}),
            command: None,
            routing_slip: RoutingSlip::new(),
        };
        let event = KernelEvent::from_envelope(&envelope).unwrap();
        if let KernelEventKind::Custom { event_type, data } = event.kind() {
            assert_eq!(event_type, "FutureFeature");
            assert_eq!(data["key"], "value");
            assert_eq!(data["num"], 42);
        } else {
            panic!("should be Custom");
        }
        let again = event.to_envelope().unwrap();
        assert_eq!(again.event_type, "FutureFeature");
        assert_eq!(again.event, envelope.event);
    }

    #[test]
    fn succeeded_tolerates_extra_payload() {
        let envelope = KernelEventEnvelope {
            event_type: "CommandSucceeded".into(),
            event: json!({"executionOrder": 3}),
            command: None,
            routing_slip: RoutingSlip::new(),
        };
        let event = KernelEvent::from_envelope(&envelope).unwrap();
        assert!(matches!(event.kind(), KernelEventKind::CommandSucceeded {}));
        assert!(event.token().is_none());
    }

    #[test]
    fn stamping_event_slip() {
        let mut event = KernelEvent::new(KernelEventKind::CommandSucceeded {}, &command());
        let uri = KernelUri::parse("kernel://local/calc").unwrap();
        assert!(event.stamp(&uri).unwrap());
        assert!(!event.stamp(&uri).unwrap());
        assert_eq!(event.routing_slip().entries(), ["kernel://local/calc"]);
    }
}
