//! A kernel that owns named child kernels and routes commands to them.
//!
//! Submissions are split at `#!` directive lines ([`crate::submission`]) and
//! each segment is dispatched, in order, to the kernel its selector names.
//! The first failing segment stops the submission. Every other command goes
//! to a single child, resolved by destination URI, then target name or
//! alias, then the per-command-type default, then the default kernel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use polyglot_protocol::{
    CommandType, DirectiveKind, KernelCommand, KernelCommandKind, KernelDirective,
    KernelError, KernelEventKind, KernelInfo, KernelResult, KernelUri,
};
use tracing::{debug, info, instrument, warn};

use crate::context::KernelInvocationContext;
use crate::kernel::{Kernel, KernelCore, KernelExt, KernelOptions};
use crate::submission::{DirectiveTable, SegmentDirective, split_submission};

const LSMAGIC: &str = "#!lsmagic";

#[derive(Default)]
struct ChildKernels {
    kernels: IndexMap<String, Arc<dyn Kernel>>,
    /// alias -> kernel name
    aliases: HashMap<String, String>,
    default_kernel: Option<String>,
    default_for_command: HashMap<CommandType, String>,
}

impl ChildKernels {
    fn canonical_name<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.kernels.contains_key(name) {
            return Some(name);
        }
        self.aliases.get(name).map(String::as_str)
    }

    fn by_name(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.canonical_name(name)
            .and_then(|name| self.kernels.get(name))
            .cloned()
    }

    fn by_uri(&self, uri: &KernelUri) -> Option<Arc<dyn Kernel>> {
        self.kernels
            .values()
            .find(|kernel| {
                let info = kernel.kernel_info();
                info.uri.as_ref() == Some(uri) || info.remote_uri.as_ref() == Some(uri)
            })
            .cloned()
    }

    fn is_taken(&self, name: &str) -> bool {
        self.kernels.contains_key(name) || self.aliases.contains_key(name)
    }
}

pub struct CompositeKernel {
    core: KernelCore,
    children: RwLock<ChildKernels>,
}

impl CompositeKernel {
    pub fn new(name: &str) -> KernelResult<Self> {
        Self::with_options(name, KernelOptions::default())
    }

    pub fn with_options(name: &str, options: KernelOptions) -> KernelResult<Self> {
        let uri = KernelUri::for_host(name)?;
        let core = KernelCore::with_options(name, options);
        core.update_info(|info| {
            info.uri = Some(uri);
            info.is_composite = true;
            info.set_supported_commands(CommandType::ALL);
            info.supported_directives = vec![lsmagic_directive()];
        });
        Ok(Self {
            core,
            children: RwLock::new(ChildKernels::default()),
        })
    }

    pub fn builder(name: impl Into<String>) -> CompositeKernelBuilder {
        CompositeKernelBuilder::new(name)
    }

    /// Register `kernel` as a child reachable by its name and `aliases`.
    ///
    /// The first child added becomes the default kernel.
    pub fn add<I, S>(&self, kernel: Arc<dyn Kernel>, aliases: I) -> KernelResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = kernel.name().to_owned();
        let aliases: Vec<String> = aliases.into_iter().map(Into::into).collect();
        let mut children = self.children.write();

        let mut claimed = HashSet::new();
        for candidate in std::iter::once(&name).chain(&aliases) {
            if children.is_taken(candidate) || !claimed.insert(candidate.as_str()) {
                return Err(KernelError::DuplicateKernelName(candidate.clone()));
            }
        }

        if let Some(uri) = self.core.uri() {
            kernel.core().set_uri(uri.join(&name));
        }
        kernel.core().update_info(|info| {
            for alias in &aliases {
                if !info.aliases.contains(alias) {
                    info.aliases.push(alias.clone());
                }
            }
        });
        for alias in &aliases {
            children.aliases.insert(alias.clone(), name.clone());
        }
        children.kernels.insert(name.clone(), kernel);
        if children.default_kernel.is_none() {
            children.default_kernel = Some(name.clone());
        }
        info!(composite = %self.core.name(), kernel = %name, ?aliases, "child kernel added");
        Ok(())
    }

    /// Detach a child and its aliases.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        let mut children = self.children.write();
        let name = children.canonical_name(name)?.to_owned();
        let removed = children.kernels.shift_remove(&name)?;
        children.aliases.retain(|_, target| *target != name);
        children.default_for_command.retain(|_, target| *target != name);
        if children.default_kernel.as_deref() == Some(name.as_str()) {
            children.default_kernel = None;
        }
        info!(composite = %self.core.name(), kernel = %name, "child kernel removed");
        Some(removed)
    }

    pub fn default_kernel_name(&self) -> Option<String> {
        self.children.read().default_kernel.clone()
    }

    /// Route commands with no selector and no target to `name` from now on.
    pub fn set_default_kernel_name(&self, name: &str) -> KernelResult<()> {
        let mut children = self.children.write();
        let canonical = children
            .canonical_name(name)
            .ok_or_else(|| KernelError::KernelNotFound(name.to_owned()))?
            .to_owned();
        children.default_kernel = Some(canonical);
        Ok(())
    }

    pub fn set_default_target_kernel_name_for_command(
        &self,
        command_type: CommandType,
        name: &str,
    ) -> KernelResult<()> {
        let mut children = self.children.write();
        let canonical = children
            .canonical_name(name)
            .ok_or_else(|| KernelError::KernelNotFound(name.to_owned()))?
            .to_owned();
        children.default_for_command.insert(command_type, canonical);
        Ok(())
    }

    pub fn child_kernels(&self) -> Vec<Arc<dyn Kernel>> {
        self.children.read().kernels.values().cloned().collect()
    }

    pub fn find_kernel_by_name(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.children.read().by_name(name)
    }

    pub fn find_kernel_by_uri(&self, uri: &KernelUri) -> Option<Arc<dyn Kernel>> {
        self.children.read().by_uri(uri)
    }

    /// Re-root this composite and its children under `uri`.
    pub fn set_host_uri(&self, uri: KernelUri) {
        for (name, kernel) in &self.children.read().kernels {
            kernel.core().set_uri(uri.join(name));
        }
        self.core.set_uri(uri);
    }

    /// Kernel that handles `command` when it is not a multi-kernel submission.
    pub fn resolve(&self, command: &KernelCommand) -> KernelResult<Arc<dyn Kernel>> {
        let children = self.children.read();
        if let Some(uri) = command.destination_uri()
            && let Some(kernel) = children.by_uri(uri)
        {
            return Ok(kernel);
        }
        if let Some(name) = command.target_kernel_name() {
            if let Some(kernel) = children.by_name(name) {
                return Ok(kernel);
            }
            // A command addressed by URI may carry the sender's local name.
            if command.destination_uri().is_none() {
                return Err(KernelError::KernelNotFound(name.to_owned()));
            }
        }
        let fallback = children
            .default_for_command
            .get(&command.command_type())
            .or(children.default_kernel.as_ref());
        match fallback.and_then(|name| children.kernels.get(name)) {
            Some(kernel) => {
                if let Some(uri) = command.destination_uri() {
                    warn!(
                        composite = %self.core.name(),
                        destination = %uri,
                        fallback = %kernel.core().name(),
                        "destination matches no child; using the default kernel"
                    );
                }
                Ok(Arc::clone(kernel))
            }
            None => Err(KernelError::KernelNotFound(
                command
                    .destination_uri()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no default kernel".to_owned()),
            )),
        }
    }

    /// Directives recognised in submissions right now.
    pub fn directive_table(&self) -> DirectiveTable {
        let mut table = DirectiveTable::new();
        table.add_action(lsmagic_directive(), None);
        let children = self.children.read();
        for (name, kernel) in &children.kernels {
            let info = kernel.kernel_info();
            let selector = format!("#!{name}");
            let schema = info
                .supported_directives
                .iter()
                .find(|d| d.kind == DirectiveKind::KernelSelector && d.name == selector);
            table.add_selector(name, name, schema);
            for (alias, _) in children.aliases.iter().filter(|(_, target)| *target == name) {
                table.add_selector(alias, name, schema);
            }
            for directive in info
                .supported_directives
                .iter()
                .filter(|d| d.kind == DirectiveKind::Action)
            {
                table.add_action(directive.clone(), Some(name));
            }
        }
        table
    }

    fn addressed_to_self(&self, command: &KernelCommand) -> bool {
        match command.destination_uri() {
            Some(uri) => self.core.uri().as_ref() == Some(uri),
            None => command.target_kernel_name().is_none_or(|name| name == self.core.name()),
        }
    }

    async fn dispatch(
        &self,
        kernel: Arc<dyn Kernel>,
        command: Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        let context = KernelInvocationContext::establish(&command, Some(context));
        debug!(kernel = %kernel.name(), token = %command.token(), "dispatching to child");
        kernel.invoke(command, &context).await
    }

    #[instrument(skip_all, fields(composite = %self.core.name(), token = %command.token()))]
    async fn submit(
        &self,
        command: &Arc<KernelCommand>,
        text: &str,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        let segments = split_submission(text, &self.directive_table())?;
        // Resolved once so a default change only affects later submissions.
        let fallback = self.resolve(command);

        if let [segment] = segments.as_slice()
            && segment.directive.is_none()
        {
            return fallback?.invoke(Arc::clone(command), context).await;
        }

        let cancellation = context.cancellation_for(command);
        for segment in &segments {
            if cancellation.is_cancelled() {
                return Err(KernelError::Cancelled);
            }
            match &segment.directive {
                Some(SegmentDirective::Action { owner, directive }) => {
                    let child = Arc::new(KernelCommand::child_of(directive.to_command_kind(), command));
                    match owner {
                        Some(owner) => {
                            let kernel = self
                                .find_kernel_by_name(owner)
                                .ok_or_else(|| KernelError::KernelNotFound(owner.clone()))?;
                            self.dispatch(kernel, child, context).await?;
                        }
                        None => {
                            let context = KernelInvocationContext::establish(&child, Some(context));
                            self.invoke(child, &context).await?;
                        }
                    }
                }
                Some(SegmentDirective::KernelSelector {
                    kernel_name,
                    directive,
                }) if directive.has_arguments() => {
                    let kernel = self
                        .find_kernel_by_name(kernel_name)
                        .ok_or_else(|| KernelError::KernelNotFound(kernel_name.clone()))?;
                    let child = KernelCommand::child_of(directive.to_command_kind(), command)
                        .with_target_kernel_name(kernel_name.clone());
                    self.dispatch(kernel, Arc::new(child), context).await?;
                }
                _ => {}
            }

            let code = segment.code(text);
            if code.trim().is_empty() {
                continue;
            }
            let kernel = match &segment.kernel_name {
                Some(name) => self
                    .find_kernel_by_name(name)
                    .ok_or_else(|| KernelError::KernelNotFound(name.clone()))?,
                None => fallback.clone()?,
            };
            let child = KernelCommand::child_of(
                KernelCommandKind::SubmitCode {
                    code: code.to_owned(),
                },
                command,
            )
            .with_target_kernel_name(kernel.name());
            self.dispatch(kernel, Arc::new(child), context).await?;
        }
        Ok(())
    }

    async fn describe_all(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        context.publish_kind(
            command,
            KernelEventKind::KernelInfoProduced {
                kernel_info: self.kernel_info(),
            },
        )?;
        for kernel in self.child_kernels() {
            let child = KernelCommand::child_of(KernelCommandKind::RequestKernelInfo {}, command)
                .with_target_kernel_name(kernel.name());
            let name = kernel.name().to_owned();
            if let Err(err) = self.dispatch(kernel, Arc::new(child), context).await {
                warn!(kernel = %name, %err, "child kernel did not describe itself");
            }
        }
        Ok(())
    }

    fn list_directives(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        let listing = self
            .directive_table()
            .directives()
            .map(|directive| match &directive.description {
                Some(description) => format!("{}  {description}", directive.name),
                None => directive.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        context.publish_kind(command, KernelEventKind::display_text(listing))
    }
}

#[async_trait]
impl Kernel for CompositeKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn supports_command(&self, _command_type: CommandType) -> bool {
        true
    }

    fn kernel_info(&self) -> KernelInfo {
        let mut info = self.core.info();
        info.supported_directives = self.directive_table().directives().cloned().collect();
        info
    }

    async fn handle_command(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        match command.kind() {
            KernelCommandKind::SubmitCode { code } => self.submit(command, code, context).await,
            KernelCommandKind::RequestKernelInfo {} if self.addressed_to_self(command) => {
                self.describe_all(command, context).await
            }
            KernelCommandKind::DirectiveCommand { name, .. }
                if name == LSMAGIC && self.addressed_to_self(command) =>
            {
                self.list_directives(command, context)
            }
            _ => {
                let kernel = self.resolve(command)?;
                kernel.invoke(Arc::clone(command), context).await
            }
        }
    }
}

fn lsmagic_directive() -> KernelDirective {
    KernelDirective::action(LSMAGIC).described("List the available directives")
}

/// Assembles a [`CompositeKernel`] from its children.
pub struct CompositeKernelBuilder {
    name: String,
    kernels: Vec<(Arc<dyn Kernel>, Vec<String>)>,
    default_kernel: Option<String>,
    host_uri: Option<KernelUri>,
    options: KernelOptions,
}

impl CompositeKernelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: Vec::new(),
            default_kernel: None,
            host_uri: None,
            options: KernelOptions::default(),
        }
    }

    pub fn with_kernel(self, kernel: impl Kernel) -> Self {
        self.with_shared_kernel(Arc::new(kernel), Vec::<String>::new())
    }

    pub fn with_aliases<I, S>(self, kernel: impl Kernel, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_shared_kernel(Arc::new(kernel), aliases)
    }

    pub fn with_shared_kernel<I, S>(mut self, kernel: Arc<dyn Kernel>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kernels
            .push((kernel, aliases.into_iter().map(Into::into).collect()));
        self
    }

    pub fn default_kernel(mut self, name: impl Into<String>) -> Self {
        self.default_kernel = Some(name.into());
        self
    }

    pub fn host_uri(mut self, uri: KernelUri) -> Self {
        self.host_uri = Some(uri);
        self
    }

    pub fn options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> KernelResult<Arc<CompositeKernel>> {
        let composite = CompositeKernel::with_options(&self.name, self.options)?;
        if let Some(uri) = self.host_uri {
            composite.set_host_uri(uri);
        }
        for (kernel, aliases) in self.kernels {
            composite.add(kernel, aliases)?;
        }
        if let Some(name) = self.default_kernel {
            composite.set_default_kernel_name(&name)?;
        }
        Ok(Arc::new(composite))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Result, bail};
    use polyglot_protocol::{CommandToken, DirectiveParameter, KernelEvent};
    use serde_json::json;

    use super::*;
    use crate::language::{KernelCommandHandler, LanguageKernel};

    /// Returns submitted code as a string value; fails on `fail`, stalls on `sleep`.
    struct Echo;

    #[async_trait]
    impl KernelCommandHandler for Echo {
        fn supported_commands(&self) -> Vec<CommandType> {
            vec![CommandType::SubmitCode, CommandType::DirectiveCommand]
        }

        fn describe(&self, info: &mut KernelInfo) {
            info.supported_directives.push(
                KernelDirective::kernel_selector(&info.local_name)
                    .with_parameter(DirectiveParameter::value("--mode")),
            );
            info.supported_directives
                .push(KernelDirective::action(&format!("#!{}-reset", info.local_name)));
        }

        async fn handle(
            &self,
            command: &Arc<KernelCommand>,
            context: &KernelInvocationContext,
        ) -> anyhow::Result<()> {
            let value = match command.kind() {
                KernelCommandKind::SubmitCode { code } => match code.trim() {
                    "fail" => bail!("segment failed"),
                    "sleep" => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        json!("woke")
                    }
                    code => json!(code),
                },
                KernelCommandKind::DirectiveCommand { raw, .. } => json!(raw),
                _ => bail!("unexpected command"),
            };
            context.publish_kind(command, KernelEventKind::return_value(value))?;
            Ok(())
        }
    }

    fn composite() -> Result<Arc<CompositeKernel>> {
        Ok(CompositeKernel::builder("local")
            .with_kernel(LanguageKernel::new("a", Echo))
            .with_aliases(LanguageKernel::new("b", Echo), ["bee"])
            .build()?)
    }

    fn values(events: &[KernelEvent]) -> Vec<serde_json::Value> {
        events
            .iter()
            .filter_map(|event| match event.kind() {
                KernelEventKind::ReturnValueProduced { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn segments_run_in_order_on_their_kernels() -> Result<()> {
        let kernel = composite()?;
        let result = kernel.send(KernelCommand::submit_code("code1\n#!b\ncode2")).await;
        assert!(result.succeeded());
        assert_eq!(values(result.events()), [json!("code1"), json!("code2")]);

        let root = result.command().token().clone();
        let first = CommandToken::from_string(format!("{root}.1"));
        let second = CommandToken::from_string(format!("{root}.2"));
        let owners: Vec<_> = result
            .events()
            .iter()
            .filter_map(|event| event.token().cloned())
            .collect();
        let last_first = owners.iter().rposition(|t| *t == first).expect("first segment events");
        let first_second = owners.iter().position(|t| *t == second).expect("second segment events");
        assert!(last_first < first_second);
        assert_eq!(owners.last(), Some(&root));
        Ok(())
    }

    #[tokio::test]
    async fn failed_segment_stops_the_submission() -> Result<()> {
        let kernel = composite()?;
        let result = kernel.send(KernelCommand::submit_code("fail\n#!b\ncode2")).await;
        assert_eq!(result.failure_message(), Some("segment failed"));
        assert!(values(result.events()).is_empty());
        assert_eq!(
            result.event_types(),
            ["CodeSubmissionReceived", "CommandFailed", "CommandFailed"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn single_segment_is_forwarded_with_the_root_token() -> Result<()> {
        let kernel = composite()?;
        let result = kernel.send(KernelCommand::submit_code("1+1")).await;
        let root = result.command().token();
        assert!(result.events().iter().all(|event| event.token() == Some(root)));
        assert_eq!(
            result.event_types(),
            ["CodeSubmissionReceived", "ReturnValueProduced", "CommandSucceeded"]
        );
        let slip = result.command().routing_slip();
        assert_eq!(
            slip.entries(),
            [
                "kernel://local/?tag=arrived",
                "kernel://local/a?tag=arrived",
                "kernel://local/a",
                "kernel://local/",
            ]
        );
        assert_eq!(
            result.events()[1].routing_slip().entries(),
            ["kernel://local/a", "kernel://local/"]
        );
        let terminal = result.terminal().expect("terminal");
        assert_eq!(terminal.routing_slip().entries(), ["kernel://local/"]);
        Ok(())
    }

    #[tokio::test]
    async fn default_kernel_change_affects_later_commands() -> Result<()> {
        let kernel = composite()?;
        assert_eq!(kernel.default_kernel_name().as_deref(), Some("a"));
        let before = kernel.send(KernelCommand::submit_code("x")).await;
        kernel.set_default_kernel_name("bee")?;
        assert_eq!(kernel.default_kernel_name().as_deref(), Some("b"));
        let after = kernel.send(KernelCommand::submit_code("x")).await;

        let arrived = |slip: polyglot_protocol::RoutingSlip, name: &str| {
            slip.contains(&format!("kernel://local/{name}"), false)
        };
        assert!(arrived(before.command().routing_slip(), "a"));
        assert!(arrived(after.command().routing_slip(), "b"));
        assert!(matches!(
            kernel.set_default_kernel_name("zzz"),
            Err(KernelError::KernelNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn target_name_and_destination_uri_route_directly() -> Result<()> {
        let kernel = composite()?;
        let by_alias = kernel
            .send(KernelCommand::submit_code("x").with_target_kernel_name("bee"))
            .await;
        assert!(by_alias.command().has_arrived_at(&KernelUri::parse("kernel://local/b")?));

        let by_uri = kernel
            .send(KernelCommand::submit_code("x").with_destination_uri(KernelUri::parse("kernel://local/b")?))
            .await;
        assert!(by_uri.command().has_arrived_at(&KernelUri::parse("kernel://local/b")?));

        let missing = kernel
            .send(KernelCommand::submit_code("x").with_target_kernel_name("nope"))
            .await;
        assert_eq!(missing.failure_message(), Some("Kernel not found: nope"));
        Ok(())
    }

    #[tokio::test]
    async fn unmatched_destination_falls_back_to_the_default_kernel() -> Result<()> {
        let kernel = composite()?;
        let result = kernel
            .send(
                KernelCommand::submit_code("x")
                    .with_target_kernel_name("remote-only")
                    .with_destination_uri(KernelUri::parse("kernel://elsewhere/b")?),
            )
            .await;
        assert!(result.succeeded(), "{:?}", result.failure_message());
        assert!(result.command().has_arrived_at(&KernelUri::parse("kernel://local/a")?));
        Ok(())
    }

    #[tokio::test]
    async fn per_command_default_wins_over_default_kernel() -> Result<()> {
        let kernel = composite()?;
        kernel.set_default_target_kernel_name_for_command(CommandType::DirectiveCommand, "b")?;
        let command = KernelCommand::new(KernelCommandKind::DirectiveCommand {
            name: "#!b-reset".into(),
            arguments: IndexMap::new(),
            positional: Vec::new(),
            raw: "#!b-reset".into(),
        })
        .with_destination_uri(KernelUri::parse("kernel://local/")?);
        let result = kernel.send(command).await;
        assert!(result.succeeded());
        assert!(result.command().has_arrived_at(&KernelUri::parse("kernel://local/b")?));
        Ok(())
    }

    #[test]
    fn duplicate_names_and_aliases_are_rejected() -> Result<()> {
        let kernel = composite()?;
        let clash = kernel.add(Arc::new(LanguageKernel::new("a", Echo)), Vec::<String>::new());
        assert_eq!(clash, Err(KernelError::DuplicateKernelName("a".into())));
        let alias_clash = kernel.add(Arc::new(LanguageKernel::new("c", Echo)), ["bee"]);
        assert_eq!(alias_clash, Err(KernelError::DuplicateKernelName("bee".into())));
        let name_as_alias = kernel.add(Arc::new(LanguageKernel::new("bee", Echo)), ["d"]);
        assert!(name_as_alias.is_err());
        assert_eq!(kernel.child_kernels().len(), 2);
        assert!(kernel.find_kernel_by_name("c").is_none());
        assert!(kernel.find_kernel_by_name("d").is_none());
        Ok(())
    }

    #[test]
    fn remove_detaches_child_and_aliases() -> Result<()> {
        let kernel = composite()?;
        kernel.set_default_kernel_name("b")?;
        assert!(kernel.remove("bee").is_some());
        assert!(kernel.find_kernel_by_name("b").is_none());
        assert!(kernel.default_kernel_name().is_none());
        kernel.add(Arc::new(LanguageKernel::new("bee", Echo)), Vec::<String>::new())?;
        assert_eq!(
            kernel.find_kernel_by_uri(&KernelUri::parse("kernel://local/bee")?).map(|k| k.name().to_owned()),
            Some("bee".to_owned())
        );
        Ok(())
    }

    #[tokio::test]
    async fn kernel_info_covers_composite_and_children() -> Result<()> {
        let kernel = composite()?;
        let result = kernel.send(KernelCommand::request_kernel_info()).await;
        let infos: Vec<KernelInfo> = result
            .events()
            .iter()
            .filter_map(|event| match event.kind() {
                KernelEventKind::KernelInfoProduced { kernel_info } => Some(kernel_info.clone()),
                _ => None,
            })
            .collect();
        let names: Vec<_> = infos.iter().map(|info| info.local_name.as_str()).collect();
        assert_eq!(names, ["local", "a", "b"]);
        assert!(infos[0].is_composite);
        assert!(infos[0].supported_directives.iter().any(|d| d.name == "#!bee"));
        assert_eq!(infos[2].aliases, ["bee"]);
        assert!(result.succeeded());
        Ok(())
    }

    #[tokio::test]
    async fn directives_reach_their_owners() -> Result<()> {
        let kernel = composite()?;
        let result = kernel
            .send(KernelCommand::submit_code("#!b --mode fast\nx\n#!a-reset\n#!lsmagic"))
            .await;
        assert!(result.succeeded(), "{:?}", result.failure_message());
        let values = values(result.events());
        assert_eq!(values, [json!("#!b --mode fast"), json!("x"), json!("#!a-reset")]);
        let listing = result.events().iter().find_map(|event| match event.kind() {
            KernelEventKind::DisplayedValueProduced { formatted_values, .. } => {
                Some(formatted_values[0].value.clone())
            }
            _ => None,
        });
        let listing = listing.expect("lsmagic output");
        assert!(listing.contains("#!lsmagic"));
        assert!(listing.contains("#!a-reset"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_directive_fails_the_submission() -> Result<()> {
        let kernel = composite()?;
        let result = kernel.send(KernelCommand::submit_code("#!b --speed 3\nx")).await;
        assert!(result.failure_message().is_some_and(|m| m.contains("--speed")));
        assert!(values(result.events()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_a_submission_skips_remaining_segments() -> Result<()> {
        let kernel = composite()?;
        let pending = {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.send(KernelCommand::submit_code("sleep\n#!b\nlater")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancel = kernel.send(KernelCommand::cancel()).await;
        assert!(cancel.succeeded());
        let result = tokio::time::timeout(Duration::from_secs(5), pending).await??;
        assert_eq!(result.failure_message(), Some("Command cancelled."));
        assert!(values(result.events()).is_empty());
        Ok(())
    }
}
