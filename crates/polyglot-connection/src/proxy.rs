//! Local stand-in for a kernel hosted at the other end of a transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use polyglot_kernel::{Kernel, KernelCore, KernelInvocationContext};
use polyglot_protocol::{
    CommandType, KernelCommand, KernelCommandAndEventReceiver, KernelCommandAndEventSender,
    KernelCommandOrEventEnvelope, KernelError, KernelEvent, KernelEventKind, KernelInfo,
    KernelResult, KernelUri,
};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, Default)]
pub struct ProxyKernelOptions {
    /// Longest silence tolerated while a forwarded command is outstanding.
    /// `None` waits until the transport closes.
    pub response_timeout: Option<Duration>,
}

pub struct ProxyKernel {
    core: KernelCore,
    remote_uri: KernelUri,
    sender: Arc<dyn KernelCommandAndEventSender>,
    receiver: Arc<dyn KernelCommandAndEventReceiver>,
    options: ProxyKernelOptions,
}

impl ProxyKernel {
    pub fn new(
        name: impl Into<String>,
        remote_uri: KernelUri,
        sender: Arc<dyn KernelCommandAndEventSender>,
        receiver: Arc<dyn KernelCommandAndEventReceiver>,
    ) -> Self {
        Self::with_options(name, remote_uri, sender, receiver, ProxyKernelOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        remote_uri: KernelUri,
        sender: Arc<dyn KernelCommandAndEventSender>,
        receiver: Arc<dyn KernelCommandAndEventReceiver>,
        options: ProxyKernelOptions,
    ) -> Self {
        let core = KernelCore::new(name);
        core.update_info(|info| {
            info.is_proxy = true;
            info.remote_uri = Some(remote_uri.clone());
            info.set_supported_commands(CommandType::ALL);
        });
        Self {
            core,
            remote_uri,
            sender,
            receiver,
            options,
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.options.response_timeout = Some(limit);
        self
    }

    pub fn remote_uri(&self) -> &KernelUri {
        &self.remote_uri
    }

    /// Adopt what the remote kernel says about itself, keeping local identity.
    pub fn update_from_remote(&self, remote: &KernelInfo) {
        self.core.update_info(|info| {
            info.language_name = remote.language_name.clone();
            info.language_version = remote.language_version.clone();
            info.display_name = remote.display_name.clone();
            info.supported_directives = remote.supported_directives.clone();
            if !remote.supported_kernel_commands.is_empty() {
                info.supported_kernel_commands = remote.supported_kernel_commands.clone();
            }
        });
    }

    fn outbound_envelope(&self, command: &KernelCommand) -> KernelResult<KernelCommandOrEventEnvelope> {
        let mut envelope = command.to_envelope()?;
        let local_uri = self.core.uri();
        if let Value::Object(payload) = &mut envelope.command {
            let addressed_here = match payload.get("destinationUri").and_then(Value::as_str) {
                None => true,
                Some(destination) => local_uri.as_ref().is_some_and(|uri| uri.as_str() == destination),
            };
            if addressed_here {
                payload.insert(
                    "destinationUri".into(),
                    Value::String(self.remote_uri.to_string()),
                );
            }
            if let Some(uri) = &local_uri
                && !payload.contains_key("originUri")
            {
                payload.insert("originUri".into(), Value::String(uri.to_string()));
            }
        }
        Ok(envelope.into())
    }

    async fn send_envelope(&self, envelope: KernelCommandOrEventEnvelope) -> KernelResult<()> {
        self.sender.send(envelope).await
    }
}

/// Asks the remote side to cancel if the local invocation is dropped before
/// the remote command finished.
struct RemoteCancel {
    sender: Arc<dyn KernelCommandAndEventSender>,
    remote_uri: KernelUri,
    armed: bool,
}

impl Drop for RemoteCancel {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cancel = KernelCommand::cancel().with_destination_uri(self.remote_uri.clone());
        let sender = Arc::clone(&self.sender);
        runtime.spawn(async move {
            match cancel.to_envelope() {
                Ok(envelope) => {
                    if let Err(err) = sender.send(envelope.into()).await {
                        debug!(%err, "remote cancel not delivered");
                    }
                }
                Err(err) => warn!(%err, "remote cancel not encoded"),
            }
        });
    }
}

#[async_trait]
impl Kernel for ProxyKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn supports_command(&self, _command_type: CommandType) -> bool {
        true
    }

    #[instrument(
        skip_all,
        fields(kernel = %self.core.name(), remote = %self.remote_uri, token = %command.token())
    )]
    async fn handle_command(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        let local_uri = self.core.uri();
        let token = command.token().clone();

        // Subscribe first so no reply can slip past.
        let mut inbound = self.receiver.subscribe();
        self.send_envelope(self.outbound_envelope(command)?).await?;
        let mut remote_cancel = RemoteCancel {
            sender: Arc::clone(&self.sender),
            remote_uri: self.remote_uri.clone(),
            armed: true,
        };
        debug!("command forwarded");

        loop {
            let next = match self.options.response_timeout {
                Some(limit) => tokio::time::timeout(limit, inbound.next())
                    .await
                    .map_err(|_| KernelError::Timeout(format!("no reply from {} for {token}", self.remote_uri)))?,
                None => inbound.next().await,
            };
            let Some(envelope) = next else {
                remote_cancel.armed = false;
                return Err(KernelError::Disconnected(format!(
                    "connection to {} closed while {token} was outstanding",
                    self.remote_uri
                )));
            };
            let KernelCommandOrEventEnvelope::Event(envelope) = envelope else {
                continue;
            };
            if !envelope
                .token()
                .is_some_and(|own| own.is_self_or_descendant_of(&token))
            {
                continue;
            }
            if let Some(uri) = &local_uri
                && envelope.routing_slip.contains(uri.as_str(), true)
            {
                trace!(event_type = %envelope.event_type, "skipping echoed event");
                continue;
            }

            let event = match KernelEvent::from_envelope(&envelope) {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, event_type = %envelope.event_type, "dropping undecodable event");
                    continue;
                }
            };
            let is_own = event.token() == Some(&token);

            if let KernelEventKind::KernelInfoProduced { kernel_info } = event.kind()
                && kernel_info.uri.as_ref() == Some(&self.remote_uri)
            {
                self.update_from_remote(kernel_info);
            }

            if is_own && event.is_terminal() {
                remote_cancel.armed = false;
                if let Some(remote) = &envelope.command
                    && let Err(err) = command.continue_routing_slip(&remote.routing_slip)
                {
                    warn!(%err, "remote routing slip not merged");
                }
                return match event.into_kind() {
                    KernelEventKind::CommandFailed { message } => Err(KernelError::CommandFailed(message)),
                    _ => Ok(()),
                };
            }

            let event = if is_own {
                event.with_command(Arc::clone(command))
            } else {
                event
            };
            context.publish(event)?;
        }
    }
}
