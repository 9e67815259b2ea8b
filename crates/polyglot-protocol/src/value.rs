//! Payload types shared by commands and events.

use serde::{Deserialize, Serialize};

pub const PLAIN_TEXT: &str = "text/plain";
pub const JSON: &str = "application/json";

/// A value rendered for one MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedValue {
    pub mime_type: String,
    pub value: String,
    #[serde(default)]
    pub suppress_display: bool,
}

impl FormattedValue {
    pub fn new(mime_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            value: value.into(),
            suppress_display: false,
        }
    }

    pub fn plain_text(value: impl Into<String>) -> Self {
        Self::new(PLAIN_TEXT, value)
    }
}

/// Zero-based line/character position inside a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinePosition {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePositionSpan {
    pub start: LinePosition,
    pub end: LinePosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    pub display_text: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Hidden,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub line_position_span: LinePositionSpan,
    pub severity: DiagnosticSeverity,
    pub code: String,
    pub message: String,
}

/// Name and type of a variable a kernel can share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelValueInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_value: Option<FormattedValue>,
}
