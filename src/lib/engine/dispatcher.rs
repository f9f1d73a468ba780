use std::sync::Arc;

use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::types::{IdError, PollConfig, RunInput, RunResult};
use crate::{
    drivers::types::{Context, Driver},
    tasks::types::Task,
};

/// Source of the per-dispatch unique part of a container name.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String, IdError>;
}

/// Time-ordered UUIDv7 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7;

impl IdGenerator for UuidV7 {
    fn generate(&self) -> Result<String, IdError> {
        Ok(Uuid::now_v7().to_string())
    }
}

/// Drives one task at a time through run, poll, logs and cleanup on a driver.
pub struct Dispatcher {
    driver: Arc<dyn Driver>,
    ids: Box<dyn IdGenerator>,
    poll: PollConfig,
    ctx: Context,
}

impl Dispatcher {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Dispatcher {
            driver,
            ids: Box::new(UuidV7),
            poll: PollConfig::default(),
            ctx: Context::new(),
        }
    }

    pub fn with_ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub async fn dispatch(&self, input: RunInput) -> RunResult {
        let id = match self.ids.generate() {
            Ok(id) => id,
            Err(e) => return RunResult::failure(e.to_string()),
        };

        let span = info_span!("dispatch", %id, driver = self.driver.name());
        self.run(input, id).instrument(span).await
    }

    async fn run(&self, input: RunInput, id: String) -> RunResult {
        let ctx = &self.ctx;
        info!(?input, "container.run");

        let task = Task::new(format!("{}-{}", input.name, id), input.image, input.command);
        let container = match self.driver.run_container(ctx, task).await {
            Ok(container) => container,
            Err(e) => return RunResult::failure(format!("could not run container: {e}")),
        };

        let mut delays = self.poll.delays();
        let status = loop {
            match container.status(ctx).await {
                Ok(status) if status.is_done() => break status,
                Ok(_) => {
                    if let Some(delay) = delays.next().filter(|d| !d.is_zero()) {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    return RunResult::failure(format!("could not get container status: {e}"));
                }
            }
        };

        info!(exit_code = status.exit_code(), "container.status");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let logs = container.logs(ctx, &mut stdout, &mut stderr).await;

        // Runs whatever the log read did; a failure here never replaces the result.
        if let Err(e) = container.cleanup(ctx).await {
            error!(error = %e, "container.cleanup");
        }

        if let Err(e) = logs {
            error!(error = %e, "container.logs");
            return RunResult {
                code: status.exit_code(),
                error: format!("could not get container logs: {e}"),
                ..Default::default()
            };
        }

        RunResult {
            code: status.exit_code(),
            error: String::new(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }
}
