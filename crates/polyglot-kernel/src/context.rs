//! Invocation context: the correlation scope of one root command.
//!
//! A context is passed explicitly to every handler. Nested commands handled
//! on behalf of the root share its context, so every event they publish
//! reaches the root's subscribers in publication order. The context finishes
//! (root terminal event emitted, subscribers released) only once the root's
//! handler has returned and every [`PendingOperation`] has been dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use polyglot_events::KernelEventSink;
use polyglot_protocol::{
    CommandToken, KernelCommand, KernelError, KernelEvent, KernelEventKind, KernelResult,
    KernelUri,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal state of a command within a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Clone)]
pub struct KernelInvocationContext {
    shared: Arc<ContextShared>,
    /// Kernels currently handling work through this handle, outermost first.
    path: Arc<Vec<KernelUri>>,
}

struct ContextShared {
    root: Arc<KernelCommand>,
    cancellation: CancellationToken,
    state: Mutex<ContextState>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct ContextState {
    sinks: Vec<Arc<dyn KernelEventSink>>,
    commands: HashMap<CommandToken, CommandState>,
    children: Vec<Arc<KernelCommand>>,
    pending_operations: usize,
    root_path: Vec<KernelUri>,
    root_awaiting_operations: bool,
    completed: bool,
}

#[derive(Default)]
struct CommandState {
    depth: usize,
    outcome: Option<CommandOutcome>,
    cancellation: Option<CancellationToken>,
}

impl std::fmt::Debug for KernelInvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelInvocationContext")
            .field("root", self.shared.root.token())
            .field("path", &self.path)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl KernelInvocationContext {
    pub fn new(command: Arc<KernelCommand>, cancellation: CancellationToken) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(ContextShared {
                root: command,
                cancellation,
                state: Mutex::new(ContextState::default()),
                done,
            }),
            path: Arc::new(Vec::new()),
        }
    }

    /// Context for `command`: the still-active `current` context when the
    /// command is nested inside another's handling, otherwise a fresh one.
    pub fn establish(
        command: &Arc<KernelCommand>,
        current: Option<&KernelInvocationContext>,
    ) -> Self {
        match current {
            Some(context) if !context.is_complete() => {
                context.record_child(command);
                context.clone()
            }
            _ => Self::new(Arc::clone(command), CancellationToken::new()),
        }
    }

    fn record_child(&self, command: &Arc<KernelCommand>) {
        let root = &self.shared.root;
        if Arc::ptr_eq(command, root) {
            return;
        }
        if command.parent().is_none() {
            command.set_parent(Arc::clone(root));
        }
        if command.token() == root.token() {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state
            .children
            .iter()
            .any(|child| child.token() == command.token())
        {
            state.children.push(Arc::clone(command));
        }
    }

    /// The root command.
    pub fn command(&self) -> &Arc<KernelCommand> {
        &self.shared.root
    }

    pub fn is_root(&self, command: &KernelCommand) -> bool {
        command.token() == self.shared.root.token()
    }

    /// Child commands recorded so far, in the order they were established.
    pub fn child_commands(&self) -> Vec<Arc<KernelCommand>> {
        self.shared.state.lock().children.clone()
    }

    /// The innermost kernel handling work through this handle.
    pub fn handling_kernel_uri(&self) -> Option<&KernelUri> {
        self.path.last()
    }

    /// A handle on the same context for work running inside the kernel at `uri`.
    pub(crate) fn entered_kernel(&self, uri: Option<KernelUri>) -> Self {
        let Some(uri) = uri else {
            return self.clone();
        };
        if self.path.last() == Some(&uri) {
            return self.clone();
        }
        let mut path = (*self.path).clone();
        path.push(uri);
        Self {
            shared: Arc::clone(&self.shared),
            path: Arc::new(path),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn KernelEventSink>) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        if state.completed {
            return Err(self.completed_error());
        }
        state.sinks.push(sink);
        Ok(())
    }

    /// Publish an event to every subscriber.
    ///
    /// Publishing into a finished context is a programming error and is
    /// reported as [`KernelError::ContextCompleted`].
    pub fn publish(&self, event: KernelEvent) -> KernelResult<()> {
        let state = self.shared.state.lock();
        if state.completed {
            error!(
                root = %self.shared.root.token(),
                event_type = event.event_type(),
                "event published after its invocation context completed"
            );
            return Err(self.completed_error());
        }
        deliver(&state, event, &self.path);
        Ok(())
    }

    pub fn publish_kind(
        &self,
        command: &Arc<KernelCommand>,
        kind: KernelEventKind,
    ) -> KernelResult<()> {
        self.publish(KernelEvent::new(kind, command))
    }

    /// Emit `CommandSucceeded` for `command` unless it already ended.
    pub fn complete(&self, command: &Arc<KernelCommand>) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        if state.completed {
            return Err(self.completed_error());
        }
        let entry = state.commands.entry(command.token().clone()).or_default();
        if entry.outcome.is_none() {
            entry.outcome = Some(CommandOutcome::Succeeded);
            let event = KernelEvent::new(KernelEventKind::CommandSucceeded {}, command);
            deliver(&state, event, &self.path);
        }
        self.finish_if_idle(&mut state);
        Ok(())
    }

    /// Emit `CommandFailed` for `command` unless it already ended, and stop
    /// the rest of its handler.
    pub fn fail(&self, command: &Arc<KernelCommand>, message: impl Into<String>) -> KernelResult<()> {
        let message = message.into();
        let cancellation = {
            let mut state = self.shared.state.lock();
            if state.completed {
                return Err(self.completed_error());
            }
            let is_root = self.is_root(command);
            let entry = state.commands.entry(command.token().clone()).or_default();
            if entry.outcome.is_some() {
                return Ok(());
            }
            entry.outcome = Some(CommandOutcome::Failed(message.clone()));
            let cancellation = if is_root {
                Some(self.shared.cancellation.clone())
            } else {
                entry.cancellation.clone()
            };
            debug!(token = %command.token(), %message, "command failed");
            let event = KernelEvent::new(KernelEventKind::failed(message), command);
            deliver(&state, event, &self.path);
            self.finish_if_idle(&mut state);
            cancellation
        };
        if let Some(cancellation) = cancellation {
            cancellation.cancel();
        }
        Ok(())
    }

    /// Track asynchronous work that must finish before the root completes.
    pub fn begin_operation(&self) -> PendingOperation {
        self.shared.state.lock().pending_operations += 1;
        PendingOperation {
            context: self.clone(),
        }
    }

    fn end_operation(&self) {
        let mut state = self.shared.state.lock();
        state.pending_operations = state.pending_operations.saturating_sub(1);
        if state.pending_operations == 0 && state.root_awaiting_operations && !state.completed {
            state.root_awaiting_operations = false;
            let root = Arc::clone(&self.shared.root);
            let entry = state.commands.entry(root.token().clone()).or_default();
            if entry.outcome.is_none() {
                entry.outcome = Some(CommandOutcome::Succeeded);
                let event = KernelEvent::new(KernelEventKind::CommandSucceeded {}, &root);
                deliver(&state, event, &state.root_path);
            }
        }
        self.finish_if_idle(&mut state);
    }

    /// A kernel started handling `command` under this context.
    pub(crate) fn enter(&self, command: &Arc<KernelCommand>) {
        let is_root = self.is_root(command);
        let mut state = self.shared.state.lock();
        if is_root && state.root_path.is_empty() {
            state.root_path = (*self.path).clone();
        }
        let entry = state.commands.entry(command.token().clone()).or_default();
        entry.depth += 1;
        if !is_root && entry.cancellation.is_none() {
            entry.cancellation = Some(self.shared.cancellation.child_token());
        }
    }

    /// A kernel finished handling `command`. The outermost exit emits the
    /// success event unless the command already ended.
    pub(crate) fn exit(&self, command: &Arc<KernelCommand>) {
        let is_root = self.is_root(command);
        let mut state = self.shared.state.lock();
        if state.completed {
            return;
        }
        let pending = state.pending_operations;
        let entry = state.commands.entry(command.token().clone()).or_default();
        entry.depth = entry.depth.saturating_sub(1);
        if entry.depth == 0 && entry.outcome.is_none() {
            if is_root && pending > 0 {
                state.root_awaiting_operations = true;
            } else {
                entry.outcome = Some(CommandOutcome::Succeeded);
                let event = KernelEvent::new(KernelEventKind::CommandSucceeded {}, command);
                deliver(&state, event, &self.path);
            }
        }
        self.finish_if_idle(&mut state);
    }

    fn finish_if_idle(&self, state: &mut ContextState) {
        if state.completed || state.pending_operations > 0 {
            return;
        }
        let root_done = state
            .commands
            .get(self.shared.root.token())
            .is_some_and(|root| root.depth == 0 && root.outcome.is_some());
        if !root_done {
            return;
        }
        state.completed = true;
        state.sinks.clear();
        self.shared.done.send_replace(true);
        debug!(root = %self.shared.root.token(), "invocation context completed");
    }

    pub fn outcome_of(&self, command: &KernelCommand) -> Option<CommandOutcome> {
        self.shared
            .state
            .lock()
            .commands
            .get(command.token())
            .and_then(|state| state.outcome.clone())
    }

    pub fn failure_of(&self, command: &KernelCommand) -> Option<String> {
        match self.outcome_of(command) {
            Some(CommandOutcome::Failed(message)) => Some(message),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().completed
    }

    pub fn is_failed(&self) -> bool {
        self.failure_of(&self.shared.root).is_some()
    }

    /// Cancellation signal of the whole command tree.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancellation.clone()
    }

    /// Cancellation signal of one command. Cancelling the root cancels every
    /// child; cancelling a child leaves its siblings running.
    pub fn cancellation_for(&self, command: &KernelCommand) -> CancellationToken {
        if self.is_root(command) {
            return self.shared.cancellation.clone();
        }
        let mut state = self.shared.state.lock();
        let entry = state.commands.entry(command.token().clone()).or_default();
        entry
            .cancellation
            .get_or_insert_with(|| self.shared.cancellation.child_token())
            .clone()
    }

    pub fn cancel(&self) {
        self.shared.cancellation.cancel();
    }

    /// Resolves once the root command has ended and all pending work is done.
    pub async fn completed(&self) {
        let mut done = self.shared.done.subscribe();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!(root = %self.shared.root.token(), "context dropped before completing");
        }
    }

    fn completed_error(&self) -> KernelError {
        KernelError::ContextCompleted(self.shared.root.token().to_string())
    }
}

fn deliver(state: &ContextState, mut event: KernelEvent, path: &[KernelUri]) {
    for uri in path.iter().rev() {
        if let Err(err) = event.stamp(uri) {
            warn!(%err, event_type = event.event_type(), "event routing slip rejected stamp");
        }
    }
    for sink in &state.sinks {
        sink.deliver(&event);
    }
}

/// Keeps the root command open until dropped.
#[must_use = "the root command completes as soon as the operation is dropped"]
pub struct PendingOperation {
    context: KernelInvocationContext,
}

impl PendingOperation {
    pub fn context(&self) -> &KernelInvocationContext {
        &self.context
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.context.end_operation();
    }
}
