//! Wire envelopes exchanged by transports.
//!
//! Commands travel as `{ token, id?, commandType, command, routingSlip }`,
//! events as `{ eventType, event, command?, routingSlip }`. Field names are
//! camelCase and unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelError, KernelResult};
use crate::ids::{CommandId, CommandToken};
use crate::routing::RoutingSlip;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommandEnvelope {
    pub token: CommandToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CommandId>,
    pub command_type: String,
    #[serde(default)]
    pub command: Value,
    #[serde(default)]
    pub routing_slip: RoutingSlip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelEventEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<KernelCommandEnvelope>,
    #[serde(default)]
    pub routing_slip: RoutingSlip,
}

impl KernelEventEnvelope {
    pub fn token(&self) -> Option<&CommandToken> {
        self.command.as_ref().map(|command| &command.token)
    }
}

/// One message on a transport.
///
/// Serialized untagged; decoding distinguishes the two shapes by the
/// presence of `commandType` or `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KernelCommandOrEventEnvelope {
    Command(KernelCommandEnvelope),
    Event(KernelEventEnvelope),
}

impl KernelCommandOrEventEnvelope {
    pub fn from_json(raw: &str) -> KernelResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> KernelResult<Self> {
        if value.get("commandType").is_some() {
            Ok(Self::Command(serde_json::from_value(value)?))
        } else if value.get("eventType").is_some() {
            Ok(Self::Event(serde_json::from_value(value)?))
        } else {
            Err(KernelError::Serialization(
                "envelope has neither commandType nor eventType".to_owned(),
            ))
        }
    }

    pub fn to_json(&self) -> KernelResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<'de> Deserialize<'de> for KernelCommandOrEventEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Self::from_value(raw).map_err(serde::de::Error::custom)
    }
}

impl From<KernelCommandEnvelope> for KernelCommandOrEventEnvelope {
    fn from(envelope: KernelCommandEnvelope) -> Self {
        Self::Command(envelope)
    }
}

impl From<KernelEventEnvelope> for KernelCommandOrEventEnvelope {
    fn from(envelope: KernelEventEnvelope) -> Self {
        Self::Event(envelope)
    }
}
