use std::{future::Future, io::Write};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tasks::types::Task;

/// Cancellation-aware execution context threaded through every driver call.
pub type Context = CancellationToken;

pub type LogSink<'a> = &'a mut (dyn Write + Send);

/// Point-in-time snapshot of a container. `exit_code` is `-1` while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    done: bool,
    exit_code: i64,
}

impl ContainerStatus {
    pub fn running() -> Self {
        ContainerStatus {
            done: false,
            exit_code: -1,
        }
    }

    pub fn exited(exit_code: i64) -> Self {
        ContainerStatus {
            done: true,
            exit_code,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response: status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("path is not in the namespace directory: {0}")]
    InvalidPath(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("process failed: {0}")]
    Process(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// A backend that turns tasks into containers and owns their lifecycle.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent by `Task::container_name`: an existing, reachable container
    /// with that name is adopted rather than duplicated.
    async fn run_container(&self, ctx: &Context, task: Task) -> Result<Box<dyn Container>>;

    async fn create_volume(&self, ctx: &Context, name: &str, size: u64) -> Result<Box<dyn Volume>>;

    /// Removes everything this driver created under its namespace.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Container: Send + Sync {
    /// Backend identity of the underlying resource.
    fn id(&self) -> &str;

    async fn status(&self, ctx: &Context) -> Result<ContainerStatus>;

    async fn logs(&self, ctx: &Context, stdout: LogSink<'_>, stderr: LogSink<'_>) -> Result<()>;

    async fn cleanup(&self, ctx: &Context) -> Result<()>;
}

#[async_trait]
pub trait Volume: Send + Sync {
    fn name(&self) -> &str;

    async fn cleanup(&self, ctx: &Context) -> Result<()>;
}

/// Races `fut` against cancellation of `ctx`.
pub async fn cancellable<T, E, F>(ctx: &Context, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<DriverError>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DriverError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}
