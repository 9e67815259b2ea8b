//! Event fan-out for kernels and invocation contexts.
//!
//! [`KernelEventHub`] is the broadcast stream behind every kernel's
//! `kernel_events()`, plus lossless subscriptions for forwarders that must
//! not skip events. [`KernelEventSink`] is what an invocation context
//! delivers into, synchronously and in publication order.
//! [`KernelCommandResult`] is everything one root command produced.

use std::sync::Arc;

use parking_lot::Mutex;
use polyglot_protocol::{CommandToken, KernelCommand, KernelEvent, KernelEventKind};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::debug;

/// Receives events as an invocation context publishes them.
pub trait KernelEventSink: Send + Sync {
    fn deliver(&self, event: &KernelEvent);
}

impl KernelEventSink for mpsc::UnboundedSender<KernelEvent> {
    fn deliver(&self, event: &KernelEvent) {
        if self.send(event.clone()).is_err() {
            debug!(event_type = event.event_type(), "event receiver dropped");
        }
    }
}

/// Clones share subscribers.
#[derive(Debug, Clone)]
pub struct KernelEventHub {
    sender: broadcast::Sender<KernelEvent>,
    lossless: Arc<Mutex<Vec<mpsc::UnboundedSender<KernelEvent>>>>,
}

impl KernelEventHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self {
            sender,
            lossless: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publish(&self, event: KernelEvent) {
        self.lossless
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        let _ = self.sender.send(event);
    }

    /// Every event published from now on, unbounded and in order. Unlike
    /// [`subscribe`](Self::subscribe) a slow reader never lags.
    pub fn subscribe_lossless(&self) -> UnboundedReceiverStream<KernelEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lossless.lock().push(sender);
        UnboundedReceiverStream::new(receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<KernelEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count() + self.lossless.lock().len()
    }
}

impl Default for KernelEventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl KernelEventSink for KernelEventHub {
    fn deliver(&self, event: &KernelEvent) {
        self.publish(event.clone());
    }
}

/// Events observed for one root command, in publication order.
#[derive(Debug, Clone)]
pub struct KernelCommandResult {
    command: Arc<KernelCommand>,
    events: Vec<KernelEvent>,
}

impl KernelCommandResult {
    pub fn new(command: Arc<KernelCommand>, events: Vec<KernelEvent>) -> Self {
        Self { command, events }
    }

    /// Drain `receiver` until every sender is gone.
    pub async fn collect(
        command: Arc<KernelCommand>,
        mut receiver: mpsc::UnboundedReceiver<KernelEvent>,
    ) -> Self {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        Self { command, events }
    }

    pub fn command(&self) -> &Arc<KernelCommand> {
        &self.command
    }

    pub fn events(&self) -> &[KernelEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<KernelEvent> {
        self.events
    }

    /// Events belonging to the command tree rooted at `token`.
    pub fn events_for<'a>(
        &'a self,
        token: &'a CommandToken,
    ) -> impl Iterator<Item = &'a KernelEvent> + 'a {
        self.events.iter().filter(move |event| {
            event
                .token()
                .is_some_and(|own| own.is_self_or_descendant_of(token))
        })
    }

    /// The terminal event of the root command, if it was observed.
    pub fn terminal(&self) -> Option<&KernelEvent> {
        let token = self.command.token();
        self.events
            .iter()
            .rev()
            .find(|event| event.is_terminal() && event.token() == Some(token))
    }

    pub fn succeeded(&self) -> bool {
        self.terminal()
            .is_some_and(|event| matches!(event.kind(), KernelEventKind::CommandSucceeded {}))
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self.terminal().map(KernelEvent::kind) {
            Some(KernelEventKind::CommandFailed { message }) => Some(message.as_str()),
            _ => None,
        }
    }

    /// Event type names in order, handy for assertions and logs.
    pub fn event_types(&self) -> Vec<&str> {
        self.events.iter().map(KernelEvent::event_type).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use futures_util::StreamExt;
    use polyglot_protocol::KernelCommandKind;

    fn submit(code: &str) -> Arc<KernelCommand> {
        Arc::new(KernelCommand::submit_code(code))
    }

    #[tokio::test]
    async fn hub_fans_out_to_every_subscriber() -> Result<()> {
        let hub = KernelEventHub::new(16);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe_stream();
        let command = submit("1");

        hub.deliver(&KernelEvent::new(KernelEventKind::CommandSucceeded {}, &command));

        assert_eq!(first.recv().await?.event_type(), "CommandSucceeded");
        let streamed = second.next().await.expect("stream item")?;
        assert_eq!(streamed.token(), Some(command.token()));
        assert_eq!(hub.subscriber_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn lossless_subscribers_see_bursts_beyond_the_buffer() -> Result<()> {
        let hub = KernelEventHub::new(4);
        let mut lossy = hub.subscribe();
        let lossless = hub.subscribe_lossless();
        let command = submit("burst");
        for _ in 0..100 {
            hub.publish(KernelEvent::new(KernelEventKind::display_text("tick"), &command));
        }
        hub.publish(KernelEvent::new(KernelEventKind::CommandSucceeded {}, &command));

        assert!(matches!(
            lossy.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        drop(hub);
        let received: Vec<_> = lossless.collect().await;
        assert_eq!(received.len(), 101);
        assert_eq!(received[100].event_type(), "CommandSucceeded");
        Ok(())
    }

    #[test]
    fn dropped_lossless_subscribers_are_pruned() {
        let hub = KernelEventHub::new(4);
        drop(hub.subscribe_lossless());
        hub.publish(KernelEvent::new(KernelEventKind::CommandSucceeded {}, &submit("1")));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn collect_drains_until_senders_close() -> Result<()> {
        let command = submit("1+1");
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.deliver(&KernelEvent::new(
            KernelEventKind::CodeSubmissionReceived { code: "1+1".into() },
            &command,
        ));
        sender.deliver(&KernelEvent::new(KernelEventKind::CommandSucceeded {}, &command));
        drop(sender);

        let result = KernelCommandResult::collect(Arc::clone(&command), receiver).await;
        assert_eq!(
            result.event_types(),
            ["CodeSubmissionReceived", "CommandSucceeded"]
        );
        assert!(result.succeeded());
        assert!(result.failure_message().is_none());
        Ok(())
    }

    #[test]
    fn terminal_ignores_child_terminal_events() {
        let root = submit("#!a\n1");
        let child = Arc::new(KernelCommand::child_of(
            KernelCommandKind::SubmitCode { code: "1".into() },
            &root,
        ));
        let result = KernelCommandResult::new(
            Arc::clone(&root),
            vec![
                KernelEvent::new(KernelEventKind::CommandSucceeded {}, &child),
                KernelEvent::new(KernelEventKind::failed("later segment broke"), &root),
            ],
        );
        assert!(!result.succeeded());
        assert_eq!(result.failure_message(), Some("later segment broke"));
        assert_eq!(result.events_for(child.token()).count(), 1);
        assert_eq!(result.events_for(root.token()).count(), 2);
    }
}
