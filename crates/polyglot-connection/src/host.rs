//! Exposes a composite kernel over one or more connectors.
//!
//! Inbound commands are dispatched into the composite as if submitted
//! locally; everything the composite publishes goes back out. Remote hosts
//! announcing their kernels (`KernelReady`, `KernelInfoProduced`) get local
//! proxies, so their kernels become addressable by name.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use polyglot_kernel::{CompositeKernel, Kernel, KernelExt};
use polyglot_protocol::{
    CommandOrEventStream, CommandToken, KernelCommand, KernelCommandAndEventReceiver, KernelCommandAndEventSender,
    KernelCommandEnvelope, KernelCommandOrEventEnvelope, KernelError, KernelEvent,
    KernelEventEnvelope, KernelEventKind, KernelInfo, KernelResult, KernelUri,
};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::proxy::{ProxyKernel, ProxyKernelOptions};

#[derive(Debug, Clone)]
pub struct KernelHostOptions {
    pub host_uri: KernelUri,
    pub proxy: ProxyKernelOptions,
}

impl Default for KernelHostOptions {
    fn default() -> Self {
        Self {
            host_uri: KernelUri::local(),
            proxy: ProxyKernelOptions::default(),
        }
    }
}

/// A sender/receiver pair and the remote hosts reachable through it.
#[derive(Clone)]
pub struct KernelConnector {
    sender: Arc<dyn KernelCommandAndEventSender>,
    receiver: Arc<dyn KernelCommandAndEventReceiver>,
    remote_hosts: Vec<KernelUri>,
}

impl KernelConnector {
    pub fn new(
        sender: Arc<dyn KernelCommandAndEventSender>,
        receiver: Arc<dyn KernelCommandAndEventReceiver>,
    ) -> Self {
        let remote_hosts = sender.remote_host_uri().into_iter().collect();
        Self {
            sender,
            receiver,
            remote_hosts,
        }
    }

    /// Connector whose two halves are the same transport object.
    pub fn duplex<T>(transport: T) -> Self
    where
        T: KernelCommandAndEventSender + KernelCommandAndEventReceiver + 'static,
    {
        let transport = Arc::new(transport);
        Self::new(transport.clone(), transport)
    }

    pub fn reaching(mut self, remote_host: KernelUri) -> Self {
        let root = remote_host.host_root();
        if !self.remote_hosts.contains(&root) {
            self.remote_hosts.push(root);
        }
        self
    }

    fn reaches(&self, uri: &KernelUri) -> bool {
        self.remote_hosts.iter().any(|host| host.same_host(uri))
    }
}

/// Tokens of commands a connector submitted and that have not finished yet.
/// Only their events go back out through that connector.
type ServedCommands = Arc<Mutex<HashSet<CommandToken>>>;

struct HostShared {
    composite: Arc<CompositeKernel>,
    options: KernelHostOptions,
    connectors: Mutex<Vec<KernelConnector>>,
}

pub struct KernelHost {
    shared: Arc<HostShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KernelHost {
    pub fn new(composite: Arc<CompositeKernel>, connector: KernelConnector) -> Self {
        Self::with_options(composite, connector, KernelHostOptions::default())
    }

    pub fn with_options(
        composite: Arc<CompositeKernel>,
        connector: KernelConnector,
        options: KernelHostOptions,
    ) -> Self {
        composite.set_host_uri(options.host_uri.clone());
        Self {
            shared: Arc::new(HostShared {
                composite,
                options,
                connectors: Mutex::new(vec![connector]),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn uri(&self) -> &KernelUri {
        &self.shared.options.host_uri
    }

    pub fn composite(&self) -> &Arc<CompositeKernel> {
        &self.shared.composite
    }

    /// Add a connector; takes effect for connections made after this call.
    pub fn add_connector(&self, connector: KernelConnector) {
        self.shared.connectors.lock().push(connector);
    }

    /// Start serving every connector and announce the local kernels.
    ///
    /// Returns the kernel infos sent in the `KernelReady` handshake.
    #[instrument(skip(self), fields(host = %self.shared.options.host_uri))]
    pub async fn connect(&self) -> KernelResult<Vec<KernelInfo>> {
        let connectors = self.shared.connectors.lock().clone();
        let infos = self.local_kernel_infos();
        for connector in connectors {
            // Subscribe before spawning so nothing published meanwhile is lost.
            let inbound = connector.receiver.subscribe();
            let events = self.shared.composite.core().events().subscribe_lossless();
            let served = ServedCommands::default();
            self.spawn(inbound_loop(
                Arc::clone(&self.shared),
                connector.clone(),
                inbound,
                Arc::clone(&served),
            ));
            self.spawn(outbound_loop(events, connector.sender.clone(), served));

            let mut ready = KernelEvent::unsolicited(KernelEventKind::KernelReady {
                kernel_infos: infos.clone(),
            });
            ready.stamp(&self.shared.options.host_uri)?;
            connector.sender.send(ready.to_envelope()?.into()).await?;
        }
        info!(kernels = infos.len(), "kernel host connected");
        Ok(infos)
    }

    /// Add a proxy named `local_name` for the kernel at `remote_uri`.
    pub fn connect_proxy_kernel<I, S>(
        &self,
        local_name: &str,
        remote_uri: KernelUri,
        aliases: I,
    ) -> KernelResult<Arc<ProxyKernel>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let connector = self.shared.connector_for(&remote_uri)?;
        self.shared
            .add_proxy(local_name, remote_uri, aliases.into_iter().map(Into::into).collect(), &connector)
    }

    /// The kernel a command would reach: by destination URI, then by target name.
    pub fn get_kernel(&self, command: &KernelCommand) -> Option<Arc<dyn Kernel>> {
        let composite = &self.shared.composite;
        command
            .destination_uri()
            .and_then(|uri| composite.find_kernel_by_uri(uri))
            .or_else(|| {
                command
                    .target_kernel_name()
                    .and_then(|name| composite.find_kernel_by_name(name))
            })
    }

    /// Stop serving connectors. In-flight commands keep running.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        info!(tasks = tasks.len(), "kernel host shut down");
    }

    fn spawn(&self, work: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(work));
    }

    fn local_kernel_infos(&self) -> Vec<KernelInfo> {
        let composite = &self.shared.composite;
        std::iter::once(composite.kernel_info())
            .chain(
                composite
                    .child_kernels()
                    .iter()
                    .map(|kernel| kernel.kernel_info())
                    .filter(|info| !info.is_proxy),
            )
            .collect()
    }
}

impl Drop for KernelHost {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl HostShared {
    fn connector_for(&self, remote_uri: &KernelUri) -> KernelResult<KernelConnector> {
        let connectors = self.connectors.lock();
        connectors
            .iter()
            .find(|connector| connector.reaches(remote_uri))
            .or_else(|| connectors.first())
            .cloned()
            .ok_or_else(|| KernelError::InvalidState("kernel host has no connectors".to_owned()))
    }

    fn add_proxy(
        &self,
        local_name: &str,
        remote_uri: KernelUri,
        aliases: Vec<String>,
        connector: &KernelConnector,
    ) -> KernelResult<Arc<ProxyKernel>> {
        let proxy = Arc::new(ProxyKernel::with_options(
            local_name,
            remote_uri.clone(),
            connector.sender.clone(),
            connector.receiver.clone(),
            self.options.proxy.clone(),
        ));
        self.composite.add(proxy.clone(), aliases)?;
        info!(kernel = %local_name, remote = %remote_uri, "proxy kernel connected");
        Ok(proxy)
    }

    /// Create or refresh proxies for kernels a remote host describes.
    fn adopt_remote_kernels(&self, infos: &[KernelInfo], connector: &KernelConnector) {
        for remote in infos {
            let Some(remote_uri) = remote.uri.clone() else {
                continue;
            };
            if remote.is_composite || remote_uri.same_host(&self.options.host_uri) {
                continue;
            }
            if let Some(existing) = self.composite.find_kernel_by_uri(&remote_uri) {
                existing.core().update_info(|info| {
                    if info.is_proxy {
                        info.language_name = remote.language_name.clone();
                        info.language_version = remote.language_version.clone();
                        info.supported_directives = remote.supported_directives.clone();
                    }
                });
                continue;
            }
            if self.composite.find_kernel_by_name(&remote.local_name).is_some() {
                debug!(kernel = %remote.local_name, "name taken locally, not proxying");
                continue;
            }
            let aliases: Vec<String> = remote
                .aliases
                .iter()
                .filter(|alias| self.composite.find_kernel_by_name(alias).is_none())
                .cloned()
                .collect();
            match self.add_proxy(&remote.local_name, remote_uri, aliases, connector) {
                Ok(proxy) => proxy.update_from_remote(remote),
                Err(err) => warn!(%err, kernel = %remote.local_name, "could not proxy remote kernel"),
            }
        }
    }
}

async fn inbound_loop(
    shared: Arc<HostShared>,
    connector: KernelConnector,
    mut inbound: CommandOrEventStream,
    served: ServedCommands,
) {
    while let Some(envelope) = inbound.next().await {
        match envelope {
            KernelCommandOrEventEnvelope::Command(envelope) => {
                dispatch_inbound(&shared, &connector, envelope, &served).await;
            }
            KernelCommandOrEventEnvelope::Event(envelope) => {
                match KernelEvent::from_envelope(&envelope).map(KernelEvent::into_kind) {
                    Ok(KernelEventKind::KernelReady { kernel_infos }) => {
                        shared.adopt_remote_kernels(&kernel_infos, &connector);
                    }
                    Ok(KernelEventKind::KernelInfoProduced { kernel_info }) => {
                        shared.adopt_remote_kernels(std::slice::from_ref(&kernel_info), &connector);
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%err, "ignoring undecodable event"),
                }
            }
        }
    }
    info!("connector closed, inbound loop finished");
}

async fn dispatch_inbound(
    shared: &Arc<HostShared>,
    connector: &KernelConnector,
    envelope: KernelCommandEnvelope,
    served: &ServedCommands,
) {
    let command = match KernelCommand::from_envelope(&envelope) {
        Ok(command) => command,
        Err(err) => {
            warn!(%err, command_type = %envelope.command_type, "rejecting inbound command");
            let reply = KernelEventEnvelope {
                event_type: "CommandFailed".to_owned(),
                event: serde_json::json!({ "message": err.to_string() }),
                command: Some(envelope),
                routing_slip: Default::default(),
            };
            if let Err(err) = connector.sender.send(reply.into()).await {
                debug!(%err, "failure reply not delivered");
            }
            return;
        }
    };
    debug!(token = %command.token(), command_type = %command.command_type(), "inbound command");
    served.lock().insert(command.token().clone());
    let composite = Arc::clone(&shared.composite);
    tokio::spawn(async move {
        let result = composite.send(command).await;
        if let Some(message) = result.failure_message() {
            debug!(token = %result.command().token(), %message, "inbound command failed");
        }
    });
}

async fn outbound_loop(
    mut events: UnboundedReceiverStream<KernelEvent>,
    sender: Arc<dyn KernelCommandAndEventSender>,
    served: ServedCommands,
) {
    while let Some(event) = events.next().await {
        if !should_forward(&event, &served) {
            continue;
        }
        let envelope = match event.to_envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, event_type = event.event_type(), "event not encodable");
                continue;
            }
        };
        if let Err(err) = sender.send(envelope.into()).await {
            warn!(%err, "event forwarding stopped");
            break;
        }
    }
}

/// Whether `event` belongs to a command submitted through this connector.
/// The terminal event of a served command also retires its token.
fn should_forward(event: &KernelEvent, served: &ServedCommands) -> bool {
    let Some(token) = event.token() else {
        return true;
    };
    let mut served = served.lock();
    if event.is_terminal() && served.remove(token) {
        return true;
    }
    served.iter().any(|root| token.is_self_or_descendant_of(root))
}
