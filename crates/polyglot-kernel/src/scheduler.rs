//! Per-kernel command serialization.
//!
//! A kernel runs one command tree at a time. Work belonging to the tree that
//! currently holds the gate runs inline, so a handler can dispatch nested
//! commands back to the same kernel without deadlocking.

use std::future::Future;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
pub struct KernelScheduler {
    gate: tokio::sync::Mutex<()>,
    running: Mutex<Option<String>>,
}

impl KernelScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for the command tree identified by `root_token`.
    pub async fn run<F, T>(&self, root_token: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        if self.running.lock().as_deref() == Some(root_token) {
            trace!(root_token, "running nested work inline");
            return work.await;
        }
        let _permit = self.gate.lock().await;
        *self.running.lock() = Some(root_token.to_owned());
        let _running = RunningTree(&self.running);
        work.await
    }

    pub fn running_tree(&self) -> Option<String> {
        self.running.lock().clone()
    }
}

struct RunningTree<'a>(&'a Mutex<Option<String>>);

impl Drop for RunningTree<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;

    use super::*;

    #[tokio::test]
    async fn distinct_trees_run_one_at_a_time() -> Result<()> {
        let scheduler = Arc::new(KernelScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                scheduler
                    .run("a", async {
                        log.lock().push("a:start");
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        log.lock().push("a:end");
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let scheduler = Arc::clone(&scheduler);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                scheduler
                    .run("b", async {
                        log.lock().push("b:start");
                    })
                    .await;
            })
        };
        first.await?;
        second.await?;
        assert_eq!(*log.lock(), ["a:start", "a:end", "b:start"]);
        assert!(scheduler.running_tree().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn same_tree_reenters_without_blocking() -> Result<()> {
        let scheduler = KernelScheduler::new();
        let value = scheduler
            .run("root", async {
                let inner = scheduler.run("root", async { 41 }).await;
                inner + 1
            })
            .await;
        assert_eq!(value, 42);
        Ok(())
    }
}
