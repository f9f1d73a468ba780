use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{bridge::types::BridgeError, drivers::types::DriverError};

/// A dispatch request as it arrives from a pipeline script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    pub command: Vec<String>,
    pub image: String,
    #[serde(default)]
    pub name: String,
}

/// Outcome handed back to the pipeline.
///
/// `error` is set for failures of the backend or transport, which are
/// distinct from the task itself exiting non-zero (`code`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub code: i64,
    pub error: String,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn failure(error: impl Into<String>) -> Self {
        RunResult {
            code: 1,
            error: error.into(),
            ..Default::default()
        }
    }
}

/// Bounded exponential backoff between status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
        }
    }
}

impl PollConfig {
    pub fn immediate() -> Self {
        PollConfig {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max;
        std::iter::successors(Some(self.initial.min(max)), move |delay| {
            Some((*delay * 2).min(max))
        })
    }
}

#[derive(Debug, Error)]
pub enum IdError {
    #[error("could not generate id: {0}")]
    Generate(String),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Driver(#[from] DriverError),

    #[error("{0}")]
    Bridge(#[from] BridgeError),

    #[error("pipeline thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to read pipeline {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}
