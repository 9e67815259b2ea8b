//! Adapter that turns a language backend into a [`Kernel`].
//!
//! A backend implements [`KernelCommandHandler`]: the command types it
//! executes and one `match` over [`KernelCommandKind`]. The adapter answers
//! `RequestKernelInfo`, announces `CodeSubmissionReceived` for each
//! submission, and maps backend errors to `CommandFailed`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use polyglot_protocol::{
    CommandType, KernelCommand, KernelCommandKind, KernelError, KernelEventKind, KernelInfo,
    KernelResult,
};

use crate::context::KernelInvocationContext;
use crate::kernel::{Kernel, KernelCore, KernelOptions};

#[async_trait]
pub trait KernelCommandHandler: Send + Sync + 'static {
    /// Command types this backend executes itself.
    fn supported_commands(&self) -> Vec<CommandType>;

    /// Fill in language details and declared directives.
    fn describe(&self, _info: &mut KernelInfo) {}

    async fn handle(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> anyhow::Result<()>;
}

pub struct LanguageKernel<H> {
    core: KernelCore,
    handler: H,
    supported: BTreeSet<CommandType>,
}

impl<H: KernelCommandHandler> LanguageKernel<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self::with_options(name, handler, KernelOptions::default())
    }

    pub fn with_options(name: impl Into<String>, handler: H, options: KernelOptions) -> Self {
        let core = KernelCore::with_options(name, options);
        let mut supported: BTreeSet<CommandType> =
            handler.supported_commands().into_iter().collect();
        supported.insert(CommandType::RequestKernelInfo);
        core.update_info(|info| {
            handler.describe(info);
            info.set_supported_commands(supported.iter().copied());
        });
        Self {
            core,
            handler,
            supported,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: KernelCommandHandler> Kernel for LanguageKernel<H> {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn supports_command(&self, command_type: CommandType) -> bool {
        self.supported.contains(&command_type)
    }

    async fn handle_command(
        &self,
        command: &Arc<KernelCommand>,
        context: &KernelInvocationContext,
    ) -> KernelResult<()> {
        match command.kind() {
            KernelCommandKind::RequestKernelInfo {}
                if !self
                    .handler
                    .supported_commands()
                    .contains(&CommandType::RequestKernelInfo) =>
            {
                return context.publish_kind(
                    command,
                    KernelEventKind::KernelInfoProduced {
                        kernel_info: self.kernel_info(),
                    },
                );
            }
            KernelCommandKind::SubmitCode { code } => {
                context.publish_kind(
                    command,
                    KernelEventKind::CodeSubmissionReceived { code: code.clone() },
                )?;
            }
            _ => {}
        }
        self.handler
            .handle(command, context)
            .await
            .map_err(|err| KernelError::CommandFailed(format!("{err:#}")))
    }
}
