//! Transport ports between a kernel host and whatever carries its messages.
//!
//! A connector is a sender/receiver pair. Proxy kernels send commands and
//! read events; hosts read commands and send events.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Inbound traffic is a boxed stream (`CommandOrEventStream`); each call
//!   to `subscribe` starts an independent subscription that ends when the
//!   transport closes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::envelope::KernelCommandOrEventEnvelope;
use crate::error::KernelResult;
use crate::routing::KernelUri;

pub type CommandOrEventStream = BoxStream<'static, KernelCommandOrEventEnvelope>;

#[async_trait]
pub trait KernelCommandAndEventSender: Send + Sync {
    async fn send(&self, envelope: KernelCommandOrEventEnvelope) -> KernelResult<()>;

    /// Root URI of the host at the other end, when the transport knows it.
    fn remote_host_uri(&self) -> Option<KernelUri> {
        None
    }
}

pub trait KernelCommandAndEventReceiver: Send + Sync {
    fn subscribe(&self) -> CommandOrEventStream;
}
