//! Commands: intents submitted to a kernel.
//!
//! The set of command kinds is closed ([`KernelCommandKind`]); kernels declare
//! which [`CommandType`]s they handle and dispatch with a `match`.
//!
//! A [`KernelCommand`] is shared as `Arc<KernelCommand>` between the caller,
//! the kernels it traverses, and the events it produces. Its token is
//! assigned lazily and never changes afterwards; its routing slip only grows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::KernelCommandEnvelope;
use crate::error::{KernelError, KernelResult};
use crate::ids::{CommandId, CommandToken};
use crate::routing::{KernelUri, RoutingSlip};
use crate::value::{FormattedValue, LinePosition};

/// Field-less discriminant of [`KernelCommandKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandType {
    SubmitCode,
    RequestKernelInfo,
    RequestCompletions,
    RequestHoverText,
    RequestDiagnostics,
    RequestValueInfos,
    RequestValue,
    SendValue,
    DirectiveCommand,
    Cancel,
}

impl CommandType {
    pub const ALL: [CommandType; 10] = [
        CommandType::SubmitCode,
        CommandType::RequestKernelInfo,
        CommandType::RequestCompletions,
        CommandType::RequestHoverText,
        CommandType::RequestDiagnostics,
        CommandType::RequestValueInfos,
        CommandType::RequestValue,
        CommandType::SendValue,
        CommandType::DirectiveCommand,
        CommandType::Cancel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::SubmitCode => "SubmitCode",
            CommandType::RequestKernelInfo => "RequestKernelInfo",
            CommandType::RequestCompletions => "RequestCompletions",
            CommandType::RequestHoverText => "RequestHoverText",
            CommandType::RequestDiagnostics => "RequestDiagnostics",
            CommandType::RequestValueInfos => "RequestValueInfos",
            CommandType::RequestValue => "RequestValue",
            CommandType::SendValue => "SendValue",
            CommandType::DirectiveCommand => "DirectiveCommand",
            CommandType::Cancel => "Cancel",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == name)
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every command a kernel can be asked to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", content = "command")]
#[serde(rename_all_fields = "camelCase")]
pub enum KernelCommandKind {
    SubmitCode {
        code: String,
    },
    RequestKernelInfo {},
    RequestCompletions {
        code: String,
        line_position: LinePosition,
    },
    RequestHoverText {
        code: String,
        line_position: LinePosition,
    },
    RequestDiagnostics {
        code: String,
    },
    RequestValueInfos {},
    RequestValue {
        name: String,
        #[serde(default = "default_mime_type")]
        mime_type: String,
    },
    SendValue {
        name: String,
        formatted_value: FormattedValue,
    },
    /// An action directive, or the arguments given to a kernel selector.
    DirectiveCommand {
        name: String,
        #[serde(default)]
        arguments: IndexMap<String, String>,
        #[serde(default)]
        positional: Vec<String>,
        #[serde(default)]
        raw: String,
    },
    Cancel {},
}

fn default_mime_type() -> String {
    crate::value::PLAIN_TEXT.to_owned()
}

impl KernelCommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            KernelCommandKind::SubmitCode { .. } => CommandType::SubmitCode,
            KernelCommandKind::RequestKernelInfo {} => CommandType::RequestKernelInfo,
            KernelCommandKind::RequestCompletions { .. } => CommandType::RequestCompletions,
            KernelCommandKind::RequestHoverText { .. } => CommandType::RequestHoverText,
            KernelCommandKind::RequestDiagnostics { .. } => CommandType::RequestDiagnostics,
            KernelCommandKind::RequestValueInfos {} => CommandType::RequestValueInfos,
            KernelCommandKind::RequestValue { .. } => CommandType::RequestValue,
            KernelCommandKind::SendValue { .. } => CommandType::SendValue,
            KernelCommandKind::DirectiveCommand { .. } => CommandType::DirectiveCommand,
            KernelCommandKind::Cancel {} => CommandType::Cancel,
        }
    }
}

#[derive(Debug)]
pub struct KernelCommand {
    kind: KernelCommandKind,
    id: CommandId,
    target_kernel_name: Option<String>,
    destination_uri: OnceLock<KernelUri>,
    origin_uri: OnceLock<KernelUri>,
    token: OnceLock<CommandToken>,
    parent: OnceLock<Arc<KernelCommand>>,
    children_issued: AtomicU64,
    routing_slip: Mutex<RoutingSlip>,
}

impl KernelCommand {
    pub fn new(kind: KernelCommandKind) -> Self {
        Self {
            kind,
            id: CommandId::new_uuid(),
            target_kernel_name: None,
            destination_uri: OnceLock::new(),
            origin_uri: OnceLock::new(),
            token: OnceLock::new(),
            parent: OnceLock::new(),
            children_issued: AtomicU64::new(0),
            routing_slip: Mutex::new(RoutingSlip::new()),
        }
    }

    pub fn submit_code(code: impl Into<String>) -> Self {
        Self::new(KernelCommandKind::SubmitCode { code: code.into() })
    }

    pub fn request_kernel_info() -> Self {
        Self::new(KernelCommandKind::RequestKernelInfo {})
    }

    pub fn cancel() -> Self {
        Self::new(KernelCommandKind::Cancel {})
    }

    /// A command synthesized while handling `parent`. Its token is derived
    /// from the parent's.
    pub fn child_of(kind: KernelCommandKind, parent: &Arc<KernelCommand>) -> Self {
        let command = Self::new(kind);
        let _ = command.parent.set(Arc::clone(parent));
        command
    }

    pub fn with_target_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.target_kernel_name = Some(name.into());
        self
    }

    pub fn with_destination_uri(self, uri: KernelUri) -> Self {
        let _ = self.destination_uri.set(uri);
        self
    }

    /// Adopt a token minted elsewhere, typically by a remote host.
    pub fn with_token(self, token: CommandToken) -> Self {
        let _ = self.token.set(token);
        self
    }

    pub fn kind(&self) -> &KernelCommandKind {
        &self.kind
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }

    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub fn target_kernel_name(&self) -> Option<&str> {
        self.target_kernel_name.as_deref()
    }

    pub fn destination_uri(&self) -> Option<&KernelUri> {
        self.destination_uri.get()
    }

    pub fn origin_uri(&self) -> Option<&KernelUri> {
        self.origin_uri.get()
    }

    /// Set the destination unless one was already assigned.
    pub fn set_destination_uri_if_unset(&self, uri: KernelUri) {
        let _ = self.destination_uri.set(uri);
    }

    /// Set the origin unless one was already assigned.
    pub fn set_origin_uri_if_unset(&self, uri: KernelUri) {
        let _ = self.origin_uri.set(uri);
    }

    pub fn parent(&self) -> Option<&Arc<KernelCommand>> {
        self.parent.get()
    }

    /// Attach a parent. Has no effect when a parent is already set or the
    /// token has already been assigned.
    pub fn set_parent(&self, parent: Arc<KernelCommand>) -> bool {
        if self.token.get().is_some() || std::ptr::eq(self, Arc::as_ptr(&parent)) {
            return false;
        }
        self.parent.set(parent).is_ok()
    }

    /// The command's correlation token, minted on first access.
    pub fn token(&self) -> &CommandToken {
        self.token.get_or_init(|| match self.parent.get() {
            Some(parent) => parent.next_child_token(),
            None => CommandToken::new_root(),
        })
    }

    fn next_child_token(&self) -> CommandToken {
        let index = self.children_issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.token().child(index)
    }

    /// Whether `self` and `other` belong to the same command tree.
    pub fn shares_root_with(&self, other: &KernelCommand) -> bool {
        self.token().root() == other.token().root()
    }

    /// Snapshot of the routing slip.
    pub fn routing_slip(&self) -> RoutingSlip {
        self.routing_slip.lock().clone()
    }

    pub fn stamp(&self, uri: &KernelUri) -> KernelResult<bool> {
        self.routing_slip.lock().stamp(uri.as_str())
    }

    pub fn stamp_as_arrived(&self, uri: &KernelUri) -> KernelResult<bool> {
        self.routing_slip.lock().stamp_as_arrived(uri)
    }

    pub fn continue_routing_slip(&self, other: &RoutingSlip) -> KernelResult<()> {
        self.routing_slip.lock().continue_with(other)
    }

    pub fn has_arrived_at(&self, uri: &KernelUri) -> bool {
        self.routing_slip.lock().contains(&uri.arrived_marker(), false)
    }

    pub fn to_envelope(&self) -> KernelResult<KernelCommandEnvelope> {
        let Value::Object(mut tagged) = serde_json::to_value(&self.kind)? else {
            return Err(KernelError::Serialization(
                "command kind did not serialize to an object".to_owned(),
            ));
        };
        let command_type = self.command_type().as_str().to_owned();
        let mut payload = match tagged.remove("command") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(name) = &self.target_kernel_name {
            payload.insert("targetKernelName".into(), Value::String(name.clone()));
        }
        if let Some(uri) = self.destination_uri() {
            payload.insert("destinationUri".into(), Value::String(uri.to_string()));
        }
        if let Some(uri) = self.origin_uri() {
            payload.insert("originUri".into(), Value::String(uri.to_string()));
        }
        Ok(KernelCommandEnvelope {
            token: self.token().clone(),
            id: Some(self.id.clone()),
            command_type,
            command: Value::Object(payload),
            routing_slip: self.routing_slip(),
        })
    }

    /// Rebuild a command from its wire form, keeping the sender's token, id
    /// and routing slip.
    pub fn from_envelope(envelope: &KernelCommandEnvelope) -> KernelResult<Self> {
        let payload = match &envelope.command {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(KernelError::Serialization(format!(
                    "command payload must be an object, got {other}"
                )));
            }
        };
        if CommandType::parse(&envelope.command_type).is_none() {
            return Err(KernelError::UnknownCommandType(envelope.command_type.clone()));
        }
        let text_field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_owned);
        let target_kernel_name = text_field("targetKernelName");
        let destination_uri = text_field("destinationUri")
            .map(|raw| KernelUri::parse(&raw))
            .transpose()?;
        let origin_uri = text_field("originUri")
            .map(|raw| KernelUri::parse(&raw))
            .transpose()?;

        let mut tagged = Map::new();
        tagged.insert(
            "commandType".into(),
            Value::String(envelope.command_type.clone()),
        );
        tagged.insert("command".into(), Value::Object(payload));
        let kind: KernelCommandKind = serde_json::from_value(Value::Object(tagged))?;

        let mut command = Self::new(kind).with_token(envelope.token.clone());
        if let Some(id) = &envelope.id {
            command.id = id.clone();
        }
        command.target_kernel_name = target_kernel_name;
        if let Some(uri) = destination_uri {
            let _ = command.destination_uri.set(uri);
        }
        if let Some(uri) = origin_uri {
            let _ = command.origin_uri.set(uri);
        }
        *command.routing_slip.get_mut() = envelope.routing_slip.clone();
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable() {
        let command = KernelCommand::submit_code("1+1");
        let first = command.token().clone();
        assert_eq!(command.token(), &first);
    }

    #[test]
    fn child_tokens_follow_parent() {
        let parent = Arc::new(KernelCommand::submit_code("#!a\n1"));
        let first = KernelCommand::child_of(
            KernelCommandKind::SubmitCode { code: "1".into() },
            &parent,
        );
        let second = KernelCommand::child_of(KernelCommandKind::RequestKernelInfo {}, &parent);
        assert_eq!(first.token().as_str(), format!("{}.1", parent.token()));
        assert_eq!(second.token().as_str(), format!("{}.2", parent.token()));
        assert!(first.shares_root_with(&parent));
        assert_ne!(first.id(), parent.id());
    }

    #[test]
    fn set_parent_is_ignored_once_token_exists() {
        let parent = Arc::new(KernelCommand::submit_code("x"));
        let orphan = KernelCommand::submit_code("y");
        let _ = orphan.token();
        assert!(!orphan.set_parent(Arc::clone(&parent)));
        assert!(orphan.parent().is_none());

        let adopted = KernelCommand::submit_code("z");
        assert!(adopted.set_parent(Arc::clone(&parent)));
        assert_eq!(adopted.token().parent().as_ref(), Some(parent.token()));
    }

    #[test]
    fn command_type_names_roundtrip() {
        for ty in CommandType::ALL {
            assert_eq!(CommandType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(CommandType::parse("Nope"), None);
    }

    #[test]
    fn envelope_carries_routing_fields_inside_command() {
        let command = KernelCommand::submit_code("1+1")
            .with_target_kernel_name("csharp")
            .with_destination_uri(KernelUri::parse("kernel://remote/csharp").unwrap());
        command.stamp(&KernelUri::parse("kernel://local/").unwrap()).unwrap();
        let envelope = command.to_envelope().unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["commandType"], "SubmitCode");
        assert_eq!(json["command"]["code"], "1+1");
        assert_eq!(json["command"]["targetKernelName"], "csharp");
        assert_eq!(json["command"]["destinationUri"], "kernel://remote/csharp");
        assert_eq!(json["routingSlip"][0], "kernel://local/");
        assert_eq!(json["token"], command.token().as_str());
    }

    #[test]
    fn from_envelope_keeps_token_and_slip() {
        let original = KernelCommand::new(KernelCommandKind::RequestCompletions {
            code: "Console.".into(),
            line_position: LinePosition {
                line: 0,
                character: 8,
            },
        });
        original
            .stamp_as_arrived(&KernelUri::parse("kernel://a/x").unwrap())
            .unwrap();
        let envelope = original.to_envelope().unwrap();
        let rebuilt = KernelCommand::from_envelope(&envelope).unwrap();
        assert_eq!(rebuilt.token(), original.token());
        assert_eq!(rebuilt.id(), original.id());
        assert_eq!(rebuilt.kind(), original.kind());
        assert_eq!(rebuilt.routing_slip(), original.routing_slip());
    }

    #[test]
    fn from_envelope_ignores_unknown_fields() {
        let json = r#"{
            "token": "t1",
            "commandType": "SubmitCode",
            "command": {"code": "2*3", "targetKernelName": "calc", "newField": [1, 2]},
            "routingSlip": [],
            "extra": true
        }"#;
        let envelope: KernelCommandEnvelope = serde_json::from_str(json).unwrap();
        let command = KernelCommand::from_envelope(&envelope).unwrap();
        assert_eq!(command.token().as_str(), "t1");
        assert_eq!(command.target_kernel_name(), Some("calc"));
        assert!(matches!(command.kind(), KernelCommandKind::SubmitCode { code } if code == "2*3"));
    }

    #[test]
    fn from_envelope_rejects_unknown_command_type() {
        let envelope = KernelCommandEnvelope {
            token: CommandToken::from_string("t"),
            id: None,
            command_type: "LaunchRocket".into(),
            command: Value::Null,
            routing_slip: RoutingSlip::new(),
        };
        let err = KernelCommand::from_envelope(&envelope).expect_err("unknown type");
        assert_eq!(err, KernelError::UnknownCommandType("LaunchRocket".into()));
    }

    #[test]
    fn origin_and_destination_are_set_once() {
        let command = KernelCommand::submit_code("x");
        let first = KernelUri::parse("kernel://a/x").unwrap();
        command.set_origin_uri_if_unset(first.clone());
        command.set_origin_uri_if_unset(KernelUri::parse("kernel://b/x").unwrap());
        assert_eq!(command.origin_uri(), Some(&first));
    }
}
