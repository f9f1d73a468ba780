use std::{path::Path, sync::Arc};

use tokio::runtime::Handle;
use tracing::{info, warn};

use super::{
    dispatcher::Dispatcher,
    types::{PollConfig, RunnerError},
};
use crate::{bridge::script::ScriptBridge, drivers::registry::DriverRegistry};

/// Everything a pipeline run needs besides the script itself.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub driver: String,
    pub namespace: String,
    pub poll: PollConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            driver: "native".to_string(),
            namespace: "ci".to_string(),
            poll: PollConfig::default(),
        }
    }
}

pub async fn run_file(
    registry: &DriverRegistry,
    config: &RunnerConfig,
    path: &Path,
) -> Result<(), RunnerError> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RunnerError::Read {
            path: path.display().to_string(),
            source,
        })?;
    run_pipeline(registry, config, source).await
}

/// Resolves the driver, evaluates the pipeline on a blocking thread and
/// closes the driver afterwards whatever the pipeline did.
pub async fn run_pipeline(
    registry: &DriverRegistry,
    config: &RunnerConfig,
    source: String,
) -> Result<(), RunnerError> {
    let driver = registry.build(&config.driver, &config.namespace)?;
    info!(driver = driver.name(), namespace = %config.namespace, "pipeline.start");

    let dispatcher = Arc::new(Dispatcher::new(driver.clone()).with_poll(config.poll));
    let handle = Handle::current();
    let evaluation =
        tokio::task::spawn_blocking(move || ScriptBridge::new(dispatcher, handle).execute(&source))
            .await;

    if let Err(e) = driver.close().await {
        warn!(error = %e, "driver.close");
    }

    evaluation??;
    info!("pipeline.done");
    Ok(())
}
