//! The kernel contract and the boundary every command crosses.
//!
//! Implementors provide [`Kernel::handle_command`]; callers go through
//! [`KernelExt::send`] (root commands) or [`KernelExt::invoke`] (nested
//! dispatch under an existing context). The boundary stamps routing slips,
//! serializes work per kernel, enforces cancellation, and turns every error
//! into a `CommandFailed` event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use polyglot_events::{KernelCommandResult, KernelEventHub};
use polyglot_protocol::{
    CommandToken, CommandType, KernelCommand, KernelCommandKind, KernelError, KernelEvent,
    KernelInfo, KernelResult, KernelUri,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::KernelInvocationContext;
use crate::scheduler::KernelScheduler;

#[derive(Debug, Clone)]
pub struct KernelOptions {
    /// Capacity of the broadcast buffer behind `kernel_events()`.
    pub event_buffer: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self { event_buffer: 1024 }
    }
}

/// State every kernel carries: identity, advertised info, event stream,
/// scheduler, and the cancellation handles of commands it is running.
#[derive(Debug)]
pub struct KernelCore {
    name: String,
    info: RwLock<KernelInfo>,
    events: KernelEventHub,
    scheduler: KernelScheduler,
    in_flight: Mutex<Vec<(CommandToken, CancellationToken)>>,
}

impl KernelCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, KernelOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: KernelOptions) -> Self {
        let name = name.into();
        Self {
            info: RwLock::new(KernelInfo::new(name.clone())),
            name,
            events: KernelEventHub::new(options.event_buffer),
            scheduler: KernelScheduler::new(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> Option<KernelUri> {
        self.info.read().uri.clone()
    }

    pub fn set_uri(&self, uri: KernelUri) {
        self.info.write().uri = Some(uri);
    }

    pub fn info(&self) -> KernelInfo {
        self.info.read().clone()
    }

    pub fn update_info(&self, update: impl FnOnce(&mut KernelInfo)) {
        let mut info = self.info.write();
        update(&mut info);
        info.local_name = self.name.clone();
    }

    pub fn events(&self) -> &KernelEventHub {
        &self.events
    }

    pub fn scheduler(&self) -> &KernelScheduler {
        &self.scheduler
    }

    fn track(&self, token: CommandToken, cancellation: CancellationToken) -> InFlight<'_> {
        self.in_flight.lock().push((token.clone(), cancellation));
        InFlight { core: self, token }
    }

    /// Cancel every command this kernel is running, except those in the tree
    /// rooted at `except_root`. Returns how many were signalled.
    pub fn cancel_in_flight(&self, except_root: &str) -> usize {
        let in_flight = self.in_flight.lock();
        let mut cancelled = 0;
        for (token, cancellation) in in_flight.iter() {
            if token.root() != except_root {
                cancellation.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

struct InFlight<'a> {
    core: &'a KernelCore,
    token: CommandToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.core.in_flight.lock();
        if let Some(index) = in_flight.iter().position(|(token, _)| *token == self.token) {
            in_flight.swap_remove(index);
        }
    }
}

#[async_trait]
pub trait Kernel: Send + Sync + 'static {
    fn core(&self) -> &KernelCore;

    /// Static capability declaration, queried before dispatch.
    fn supports_command(&self, command_type: CommandType) -> bool;

    /// Execute `command`, publishing its events through `context`.
    ///
    /// Returning `Err` fails the command with the error's message.
    async fn handle_command(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kernel_info(&self) -> KernelInfo {
        self.core().info()
    }

    fn kernel_events(&self) -> broadcast::Receiver<KernelEvent> {
        self.core().events().subscribe()
    }
}

#[async_trait]
pub trait KernelExt: Kernel {
    /// Submit a root command and wait for all of its events.
    async fn send(&self, command: KernelCommand) -> KernelCommandResult {
        self.send_with_cancellation(Arc::new(command), CancellationToken::new())
            .await
    }

    /// Submit a root command that can be cancelled through `cancellation`.
    ///
    /// Events are returned to the caller and also published on this kernel's
    /// `kernel_events()` stream.
    async fn send_with_cancellation(
        &self,
        command: Arc<KernelCommand>,
        cancellation: CancellationToken,
    ) -> KernelCommandResult {
        let context = KernelInvocationContext::new(Arc::clone(&command), cancellation);
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscribed = context
            .subscribe(Arc::new(sender))
            .and_then(|()| context.subscribe(Arc::new(self.core().events().clone())));
        if let Err(err) = subscribed {
            warn!(%err, "could not subscribe to a fresh invocation context");
        }

        if let Err(err) = self.invoke(Arc::clone(&command), &context).await {
            debug!(token = %command.token(), %err, "root command failed");
        }
        context.completed().await;
        KernelCommandResult::collect(command, receiver).await
    }

    /// Handle `command` under an existing context.
    ///
    /// Returns `Err(KernelError::CommandFailed)` when the command ended in
    /// failure, after its `CommandFailed` event has been published.
    async fn invoke(
        &self,
        command: Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        let core = self.core();
        let uri = core.uri();
        let context = context.entered_kernel(uri.clone());
        let span = info_span!(
            "kernel.invoke",
            kernel = %core.name(),
            command_type = %command.command_type(),
            token = %command.token()
        );

        context.enter(&command);
        let arrival = match &uri {
            Some(uri) => command.stamp_as_arrived(uri).map(|_| ()),
            None => Ok(()),
        };

        let outcome = match arrival {
            Err(err) => Err(err),
            Ok(()) if matches!(command.kind(), KernelCommandKind::Cancel {}) => {
                let cancelled = core.cancel_in_flight(command.token().root());
                info!(kernel = %core.name(), cancelled, "cancel requested");
                Ok(())
            }
            Ok(()) if !self.supports_command(command.command_type()) => {
                Err(KernelError::CommandNotSupported {
                    command_type: command.command_type().to_string(),
                    kernel: core.name().to_owned(),
                })
            }
            Ok(()) => {
                let cancellation = context.cancellation_for(&command);
                let _in_flight = core.track(command.token().clone(), cancellation.clone());
                core.scheduler()
                    .run(command.token().root(), async {
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => Err(KernelError::Cancelled),
                            result = AssertUnwindSafe(self.handle_command(&command, &context)).catch_unwind() => {
                                result.unwrap_or_else(|payload| {
                                    let message = panic_message(payload.as_ref());
                                    error!(kernel = %core.name(), token = %command.token(), %message, "handler panicked");
                                    Err(KernelError::CommandFailed(format!("handler panicked: {message}")))
                                })
                            }
                        }
                    })
                    .instrument(span)
                    .await
            }
        };

        match outcome {
            Err(err) => {
                if let Err(publish_err) = context.fail(&command, err.to_string()) {
                    warn!(%publish_err, "failure could not be published");
                }
            }
            Ok(()) => {
                if let Some(uri) = &uri
                    && let Err(err) = command.stamp(uri)
                {
                    warn!(%err, "completion stamp rejected");
                }
            }
        }
        context.exit(&command);

        match context.failure_of(&command) {
            Some(message) => Err(KernelError::CommandFailed(message)),
            None => Ok(()),
        }
    }
}

impl<K: Kernel + ?Sized> KernelExt for K {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
