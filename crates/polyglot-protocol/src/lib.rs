//! # polyglot-protocol — kernel command/event contract
//!
//! Shared types for routing commands between kernels and correlating the
//! events they produce, locally or across a transport.
//!
//! It is intentionally dependency-light (no tokio) so transports and kernel
//! backends can depend on it as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — CommandToken (hierarchical correlation token), CommandId
//! - [`routing`] — KernelUri, RoutingSlip (append-only provenance with cycle rejection)
//! - [`command`] — KernelCommand + KernelCommandKind (closed command set), CommandType
//! - [`event`] — KernelEvent + KernelEventKind (closed event set, forward-compatible)
//! - [`envelope`] — camelCase wire envelopes for transports
//! - [`kernel_info`] — KernelInfo advertised by kernels and hosts
//! - [`directive`] — `#!` directive schemas
//! - [`value`] — FormattedValue, LinePositionSpan and other payloads
//! - [`ports`] — Transport sender/receiver traits
//! - [`error`] — KernelError, KernelResult

pub mod command;
pub mod directive;
pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod kernel_info;
pub mod ports;
pub mod routing;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use command::{CommandType, KernelCommand, KernelCommandKind};
pub use directive::{DirectiveKind, DirectiveParameter, KernelDirective};
pub use envelope::{KernelCommandEnvelope, KernelCommandOrEventEnvelope, KernelEventEnvelope};
pub use error::{KernelError, KernelResult};
pub use event::{KernelEvent, KernelEventKind};
pub use ids::{CommandId, CommandToken};
pub use kernel_info::{KernelCommandInfo, KernelInfo};
pub use ports::{CommandOrEventStream, KernelCommandAndEventReceiver, KernelCommandAndEventSender};
pub use routing::{KernelUri, RoutingSlip};
pub use value::{
    CompletionItem, Diagnostic, DiagnosticSeverity, FormattedValue, KernelValueInfo, LinePosition,
    LinePositionSpan,
};
