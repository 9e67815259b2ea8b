//! # polyglot-kernel — kernels, invocation contexts and composite routing
//!
//! - [`kernel`] — the [`Kernel`] trait, [`KernelCore`] state and the
//!   [`KernelExt::invoke`] boundary every command crosses
//! - [`context`] — [`KernelInvocationContext`], the correlation scope of one
//!   root command
//! - [`scheduler`] — per-kernel serialization, reentrant for nested work
//! - [`language`] — [`LanguageKernel`] adapter for language backends
//! - [`submission`] — splitting submissions at `#!` directive lines
//! - [`composite`] — [`CompositeKernel`] and its builder

pub mod composite;
pub mod context;
pub mod kernel;
pub mod language;
pub mod scheduler;
pub mod submission;

pub use composite::{CompositeKernel, CompositeKernelBuilder};
pub use context::{CommandOutcome, KernelInvocationContext, PendingOperation};
pub use kernel::{Kernel, KernelCore, KernelExt, KernelOptions};
pub use language::{KernelCommandHandler, LanguageKernel};
pub use scheduler::KernelScheduler;
pub use submission::{
    DirectiveTable, DirectiveTarget, ParsedDirective, SegmentDirective, SubmissionSegment,
    split_submission,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Context, Result, bail};
    use async_trait::async_trait;
    use polyglot_protocol::{CommandType, KernelCommand, KernelCommandKind, KernelEventKind};
    use serde_json::json;

    use crate::{
        CompositeKernel, Kernel, KernelCommandHandler, KernelExt, KernelInvocationContext, LanguageKernel,
    };

    struct Adder;

    #[async_trait]
    impl KernelCommandHandler for Adder {
        fn supported_commands(&self) -> Vec<CommandType> {
            vec![CommandType::SubmitCode]
        }

        async fn handle(
            &self,
            command: &Arc<KernelCommand>,
            context: &KernelInvocationContext,
        ) -> Result<()> {
            let KernelCommandKind::SubmitCode { code } = command.kind() else {
                bail!("unexpected command");
            };
            let mut sum = 0i64;
            for term in code.split('+') {
                sum += term.trim().parse::<i64>().context("not a number")?;
            }
            context.publish_kind(command, KernelEventKind::return_value(json!(sum)))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_plus_one_through_a_composite() -> Result<()> {
        let composite = CompositeKernel::builder("local")
            .with_kernel(LanguageKernel::new("adder", Adder))
            .build()?;
        let mut stream = composite.kernel_events();

        let result = composite.send(KernelCommand::submit_code("1+1")).await;

        assert_eq!(
            result.event_types(),
            ["CodeSubmissionReceived", "ReturnValueProduced", "CommandSucceeded"]
        );
        assert!(matches!(
            result.events()[1].kind(),
            KernelEventKind::ReturnValueProduced { value, .. } if *value == json!(2)
        ));
        let token = result.command().token();
        assert!(result.events().iter().all(|event| event.token() == Some(token)));

        for expected in ["CodeSubmissionReceived", "ReturnValueProduced", "CommandSucceeded"] {
            assert_eq!(stream.recv().await?.event_type(), expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn bad_input_fails_with_readable_message() -> Result<()> {
        let composite = CompositeKernel::builder("local")
            .with_kernel(LanguageKernel::new("adder", Adder))
            .build()?;
        let result = composite.send(KernelCommand::submit_code("1+x")).await;
        let message = result.failure_message().context("expected failure")?;
        assert!(message.starts_with("not a number"), "{message}");
        Ok(())
    }
}
