//! Splitting submitted code at `#!` directive lines.
//!
//! A submission is partitioned into contiguous segments. Every segment but
//! possibly the first starts at a known directive line; the segment ranges
//! concatenate back to the original text. Lines starting with `#!` that do
//! not name a known directive stay in the code.

use std::ops::Range;

use indexmap::IndexMap;
use polyglot_protocol::{KernelCommandKind, KernelDirective, KernelError, KernelResult};
use tracing::debug;

/// Who handles a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveTarget {
    /// Switches the segment's code to this child kernel.
    Selector { kernel_name: String },
    /// Runs on the named child, or on the composite itself when `None`.
    Action { owner: Option<String> },
}

#[derive(Debug, Clone)]
struct DirectiveBinding {
    directive: KernelDirective,
    target: DirectiveTarget,
}

/// Directives recognised in submissions, keyed by their `#!` spelling.
#[derive(Debug, Clone, Default)]
pub struct DirectiveTable {
    bindings: IndexMap<String, DirectiveBinding>,
}

impl DirectiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel selector for `kernel_name`, spelled `#!{spelling}`.
    pub fn add_selector(&mut self, spelling: &str, kernel_name: &str, schema: Option<&KernelDirective>) {
        let mut directive = KernelDirective::kernel_selector(spelling);
        if let Some(schema) = schema {
            directive.parameters = schema.parameters.clone();
            directive.description = schema.description.clone();
        }
        self.insert(
            directive,
            DirectiveTarget::Selector {
                kernel_name: kernel_name.to_owned(),
            },
        );
    }

    pub fn add_action(&mut self, directive: KernelDirective, owner: Option<&str>) {
        self.insert(
            directive,
            DirectiveTarget::Action {
                owner: owner.map(str::to_owned),
            },
        );
    }

    fn insert(&mut self, directive: KernelDirective, target: DirectiveTarget) {
        if self.bindings.contains_key(&directive.name) {
            debug!(directive = %directive.name, "directive already registered, keeping first");
            return;
        }
        self.bindings
            .insert(directive.name.clone(), DirectiveBinding { directive, target });
    }

    pub fn get(&self, name: &str) -> Option<(&KernelDirective, &DirectiveTarget)> {
        self.bindings
            .get(name)
            .map(|binding| (&binding.directive, &binding.target))
    }

    pub fn directives(&self) -> impl Iterator<Item = &KernelDirective> {
        self.bindings.values().map(|binding| &binding.directive)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// A directive line with its arguments bound to the declared parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDirective {
    pub name: String,
    pub arguments: IndexMap<String, String>,
    pub positional: Vec<String>,
    /// The directive line without its line ending.
    pub raw: String,
}

impl ParsedDirective {
    pub fn has_arguments(&self) -> bool {
        !self.arguments.is_empty() || !self.positional.is_empty()
    }

    pub fn to_command_kind(&self) -> KernelCommandKind {
        KernelCommandKind::DirectiveCommand {
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            positional: self.positional.clone(),
            raw: self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentDirective {
    KernelSelector {
        kernel_name: String,
        directive: ParsedDirective,
    },
    Action {
        owner: Option<String>,
        directive: ParsedDirective,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionSegment {
    /// Kernel receiving the segment's code; `None` means the default kernel.
    pub kernel_name: Option<String>,
    pub directive: Option<SegmentDirective>,
    /// Byte range of the whole segment, directive line included.
    pub range: Range<usize>,
    /// Byte range of the code following the directive line.
    pub code_range: Range<usize>,
}

impl SubmissionSegment {
    pub fn source<'a>(&self, text: &'a str) -> &'a str {
        &text[self.range.clone()]
    }

    pub fn code<'a>(&self, text: &'a str) -> &'a str {
        &text[self.code_range.clone()]
    }
}

/// Partition `text` into segments at every known directive line.
///
/// With `n` directive lines the result has `n + 1` segments when code
/// precedes the first directive (or there is no directive at all), `n`
/// otherwise.
pub fn split_submission(text: &str, table: &DirectiveTable) -> KernelResult<Vec<SubmissionSegment>> {
    let mut segments = Vec::new();
    let mut current = SubmissionSegment {
        kernel_name: None,
        directive: None,
        range: 0..0,
        code_range: 0..0,
    };
    let mut selected: Option<String> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let Some((directive, target)) = directive_on_line(line, table) else {
            continue;
        };

        current.range.end = start;
        current.code_range.end = start;
        if current.directive.is_some() || start > 0 {
            segments.push(current);
        }

        let parsed = parse_directive_line(line, directive)?;
        let directive = match target {
            DirectiveTarget::Selector { kernel_name } => {
                selected = Some(kernel_name.clone());
                SegmentDirective::KernelSelector {
                    kernel_name: kernel_name.clone(),
                    directive: parsed,
                }
            }
            DirectiveTarget::Action { owner } => SegmentDirective::Action {
                owner: owner.clone(),
                directive: parsed,
            },
        };
        current = SubmissionSegment {
            kernel_name: selected.clone(),
            directive: Some(directive),
            range: start..start,
            code_range: offset..offset,
        };
    }

    current.range.end = text.len();
    current.code_range.end = text.len();
    segments.push(current);
    Ok(segments)
}

fn directive_on_line<'t>(
    line: &str,
    table: &'t DirectiveTable,
) -> Option<(&'t KernelDirective, &'t DirectiveTarget)> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("#!") {
        return None;
    }
    let name = trimmed.split_whitespace().next()?;
    table.get(name)
}

fn parse_directive_line(line: &str, directive: &KernelDirective) -> KernelResult<ParsedDirective> {
    let raw = line.trim_end_matches(['\r', '\n']);
    let mut tokens = tokenize(raw)?.into_iter();
    // The first token is the directive name itself.
    tokens.next();

    let mut arguments = IndexMap::new();
    let mut positional = Vec::new();
    while let Some(token) = tokens.next() {
        if !token.starts_with("--") {
            positional.push(token);
            continue;
        }
        let Some(parameter) = directive.parameter(&token) else {
            return Err(KernelError::DirectiveParse(format!(
                "unrecognized parameter {token} for {}",
                directive.name
            )));
        };
        let value = if parameter.flag {
            "true".to_owned()
        } else {
            tokens.next().ok_or_else(|| {
                KernelError::DirectiveParse(format!("missing value for {token} in {}", directive.name))
            })?
        };
        arguments.insert(parameter.name.clone(), value);
    }

    if let Some(missing) = directive
        .parameters
        .iter()
        .find(|p| p.required && !arguments.contains_key(&p.name))
    {
        return Err(KernelError::DirectiveParse(format!(
            "required parameter {} missing for {}",
            missing.name, directive.name
        )));
    }

    Ok(ParsedDirective {
        name: directive.name.clone(),
        arguments,
        positional,
        raw: raw.to_owned(),
    })
}

/// Whitespace-separated tokens; `"…"` and `'…'` group text containing spaces.
fn tokenize(line: &str) -> KernelResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.trim().chars().peekable();
    while let Some(&next) = chars.peek() {
        if next.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
            if c == '"' || c == '\'' {
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == c {
                        closed = true;
                        break;
                    }
                    token.push(inner);
                }
                if !closed {
                    return Err(KernelError::DirectiveParse(format!(
                        "unterminated quote in `{line}`"
                    )));
                }
            } else {
                token.push(c);
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}
