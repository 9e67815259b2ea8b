//! Directive schemas advertised by kernels.
//!
//! A directive is a `#!name` line in submitted code. Kernel selectors switch
//! the kernel that receives the following code; action directives run a
//! command of their own on the kernel that declared them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectiveKind {
    KernelSelector,
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveParameter {
    /// Full flag spelling, e.g. `--name`.
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Flags take no value; their presence is recorded as `"true"`.
    #[serde(default)]
    pub flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DirectiveParameter {
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            flag: false,
            description: None,
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            flag: true,
            ..Self::value(name)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelDirective {
    /// Spelling including the `#!` prefix.
    pub name: String,
    pub kind: DirectiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<DirectiveParameter>,
}

impl KernelDirective {
    pub fn kernel_selector(kernel_name: &str) -> Self {
        Self {
            name: format!("#!{kernel_name}"),
            kind: DirectiveKind::KernelSelector,
            description: None,
            parameters: Vec::new(),
        }
    }

    pub fn action(name: &str) -> Self {
        let name = if name.starts_with("#!") {
            name.to_owned()
        } else {
            format!("#!{name}")
        };
        Self {
            name,
            kind: DirectiveKind::Action,
            description: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: DirectiveParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&DirectiveParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}
