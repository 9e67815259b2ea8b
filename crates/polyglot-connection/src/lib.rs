//! # polyglot-connection — kernels across process boundaries
//!
//! - [`proxy`] — [`ProxyKernel`], a local kernel that forwards to a remote one
//!   and relays its events
//! - [`host`] — [`KernelHost`], which serves a composite over connectors and
//!   builds proxies for what remote hosts announce
//! - [`transport`] — in-process channels and JSON-lines streams

pub mod host;
pub mod proxy;
pub mod transport;

pub use host::{KernelConnector, KernelHost, KernelHostOptions};
pub use proxy::{ProxyKernel, ProxyKernelOptions};
pub use transport::{ChannelTransport, JsonLinesReceiver, JsonLinesSender, envelope_lines};
