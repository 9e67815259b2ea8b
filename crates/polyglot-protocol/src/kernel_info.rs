//! Self-description a kernel publishes in `KernelInfoProduced` and `KernelReady`.

use serde::{Deserialize, Serialize};

use crate::command::CommandType;
use crate::directive::KernelDirective;
use crate::routing::KernelUri;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommandInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub local_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<KernelUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<KernelUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub is_composite: bool,
    #[serde(default)]
    pub supported_kernel_commands: Vec<KernelCommandInfo>,
    #[serde(default)]
    pub supported_directives: Vec<KernelDirective>,
}

impl KernelInfo {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            aliases: Vec::new(),
            uri: None,
            remote_uri: None,
            language_name: None,
            language_version: None,
            display_name: None,
            is_proxy: false,
            is_composite: false,
            supported_kernel_commands: Vec::new(),
            supported_directives: Vec::new(),
        }
    }

    /// Replace the advertised command list.
    pub fn set_supported_commands(&mut self, commands: impl IntoIterator<Item = CommandType>) {
        self.supported_kernel_commands = commands
            .into_iter()
            .map(|command| KernelCommandInfo {
                name: command.as_str().to_owned(),
            })
            .collect();
    }

    pub fn supports(&self, command_type: CommandType) -> bool {
        self.supported_kernel_commands
            .iter()
            .any(|info| info.name == command_type.as_str())
    }

    /// Whether `name` is this kernel's local name or one of its aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.local_name == name || self.aliases.iter().any(|alias| alias == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_info_uses_camel_case() {
        let mut info = KernelInfo::new("csharp");
        info.aliases.push("C#".into());
        info.uri = Some(KernelUri::parse("kernel://local/csharp").unwrap());
        info.set_supported_commands([CommandType::SubmitCode]);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["localName"], "csharp");
        assert_eq!(json["uri"], "kernel://local/csharp");
        assert_eq!(json["supportedKernelCommands"][0]["name"], "SubmitCode");
        assert!(json.get("remoteUri").is_none());
        assert!(info.answers_to("C#"));
        assert!(info.supports(CommandType::SubmitCode));
        assert!(!info.supports(CommandType::RequestHoverText));
    }

    #[test]
    fn kernel_info_tolerates_missing_and_unknown_fields() {
        let json = r#"{"localName":"python","languageName":"Python","futureField":1}"#;
        let info: KernelInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.local_name, "python");
        assert_eq!(info.language_name.as_deref(), Some("Python"));
        assert!(info.aliases.is_empty());
    }
}
