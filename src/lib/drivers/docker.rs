use std::{collections::HashMap, future::Future, pin::pin};

use async_trait::async_trait;
use bollard::{
    Docker as DockerClient,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{ContainerStateStatusEnum, HostConfig},
    volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use super::types::{
    Container, ContainerStatus, Context, Driver, DriverError, LogSink, Result, Volume, cancellable,
};
use crate::tasks::{state::StatusLatch, types::Task};

pub const NAMESPACE_LABEL: &str = "orchestra.namespace";

pub struct Docker {
    client: DockerClient,
    namespace: String,
}

pub struct DockerContainer {
    id: String,
    client: DockerClient,
    latch: StatusLatch,
}

pub struct DockerVolume {
    name: String,
    client: DockerClient,
}

impl Docker {
    /// Connects using `DOCKER_HOST` or the platform's local socket.
    pub fn new(namespace: &str) -> Result<Self> {
        let client = DockerClient::connect_with_local_defaults()?;

        Ok(Docker {
            client,
            namespace: namespace.to_string(),
        })
    }

    fn labels(&self) -> HashMap<String, String> {
        HashMap::from([(NAMESPACE_LABEL.to_string(), self.namespace.clone())])
    }

    fn label_filter(&self) -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", NAMESPACE_LABEL, self.namespace)],
        )])
    }

    async fn pull_image(&self, ctx: &Context, image: &str) -> Result<()> {
        let (from_image, tag) = split_image_tag(image);
        debug!(image, "pulling image");

        let mut stream = pin!(self.client.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        ));

        // A pull is only complete once the whole progress stream is drained.
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(DriverError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(info)) => {
                    if let Some(status) = info.status {
                        debug!(image, %status, "pull progress");
                    }
                }
                Some(Err(e)) => {
                    warn!(image, error = %e, "image pull failed");
                    return Err(e.into());
                }
                None => break,
            }
        }

        debug!(image, "image pulled");
        Ok(())
    }

    async fn find_by_name(&self, ctx: &Context, name: &str) -> Result<String> {
        let filters = HashMap::from([("name".to_string(), vec![format!("^/{}$", name)])]);
        let containers = cancellable(
            ctx,
            self.client.list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            })),
        )
        .await?;

        containers
            .into_iter()
            .find_map(|summary| summary.id)
            .ok_or_else(|| DriverError::ContainerNotFound(name.to_string()))
    }

    /// A container left behind between create and start never runs on its own.
    async fn start_if_created(&self, ctx: &Context, id: &str) -> Result<()> {
        let inspection = cancellable(ctx, self.client.inspect_container(id, None)).await?;
        let state = inspection.state.and_then(|state| state.status);
        if state != Some(ContainerStateStatusEnum::CREATED) {
            return Ok(());
        }

        cancellable(
            ctx,
            self.client
                .start_container(id, None::<StartContainerOptions<String>>),
        )
        .await?;
        debug!(%id, "adopted container started");
        Ok(())
    }

    fn container(&self, id: String) -> Box<dyn Container> {
        Box::new(DockerContainer {
            id,
            client: self.client.clone(),
            latch: StatusLatch::new(),
        })
    }
}

#[async_trait]
impl Driver for Docker {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run_container(&self, ctx: &Context, task: Task) -> Result<Box<dyn Container>> {
        self.pull_image(ctx, &task.image).await?;

        let name = task.container_name(&self.namespace);
        let binds: Vec<String> = task
            .mounts
            .iter()
            .map(|mount| format!("{}-{}:{}", self.namespace, mount.name, mount.path))
            .collect();

        let config = Config {
            image: Some(task.image.clone()),
            cmd: (!task.command.is_empty()).then(|| task.command.clone()),
            labels: Some(self.labels()),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });

        let created = cancellable(ctx, self.client.create_container(options, config)).await;
        let id = match created {
            Ok(resp) => resp.id,
            Err(DriverError::Docker(BollardError::DockerResponseServerError {
                status_code: 409,
                ..
            })) => {
                // Same composed name already exists: adopt it.
                let id = self.find_by_name(ctx, &name).await?;
                self.start_if_created(ctx, &id).await?;
                info!(%name, %id, "reusing existing container");
                return Ok(self.container(id));
            }
            Err(e) => return Err(e),
        };

        cancellable(
            ctx,
            self.client
                .start_container(&id, None::<StartContainerOptions<String>>),
        )
        .await?;

        info!(%name, %id, "container started");
        Ok(self.container(id))
    }

    async fn create_volume(&self, ctx: &Context, name: &str, _size: u64) -> Result<Box<dyn Volume>> {
        let volume = cancellable(
            ctx,
            self.client.create_volume(CreateVolumeOptions {
                name: format!("{}-{}", self.namespace, name),
                labels: self.labels(),
                ..Default::default()
            }),
        )
        .await?;

        Ok(Box::new(DockerVolume {
            name: volume.name,
            client: self.client.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: self.label_filter(),
                ..Default::default()
            }))
            .await?;

        let ids = containers.into_iter().filter_map(|summary| summary.id);
        let removed_containers = remove_all("container", ids, |id| {
            let client = self.client.clone();
            async move {
                let options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                client.remove_container(&id, Some(options)).await.map_err(DriverError::from)
            }
        })
        .await;

        let volumes = self
            .client
            .list_volumes(Some(ListVolumesOptions {
                filters: self.label_filter(),
            }))
            .await?;

        let names = volumes.volumes.unwrap_or_default().into_iter().map(|volume| volume.name);
        let removed_volumes = remove_all("volume", names, |name| {
            let client = self.client.clone();
            async move {
                let options = RemoveVolumeOptions { force: true };
                client.remove_volume(&name, Some(options)).await.map_err(DriverError::from)
            }
        })
        .await;

        removed_containers.and(removed_volumes)?;
        info!(namespace = %self.namespace, "docker namespace pruned");
        Ok(())
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self, ctx: &Context) -> Result<ContainerStatus> {
        let inspection = cancellable(ctx, self.client.inspect_container(&self.id, None)).await?;
        let state = inspection.state.unwrap_or_default();

        let done = matches!(
            state.status,
            Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD)
        );
        let status = if done {
            ContainerStatus::exited(state.exit_code.unwrap_or(-1))
        } else {
            ContainerStatus::running()
        };

        Ok(self.latch.observe(status))
    }

    async fn logs(&self, ctx: &Context, stdout: LogSink<'_>, stderr: LogSink<'_>) -> Result<()> {
        let mut stream = pin!(self.client.logs(
            &self.id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        ));

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(DriverError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(LogOutput::StdErr { message })) => stderr.write_all(&message)?,
                Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                    stdout.write_all(&message)?
                }
                Some(Ok(LogOutput::StdIn { .. })) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        cancellable(
            ctx,
            self.client.remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    link: false,
                }),
            ),
        )
        .await
    }
}

#[async_trait]
impl Volume for DockerVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        cancellable(
            ctx,
            self.client
                .remove_volume(&self.name, Some(RemoveVolumeOptions { force: true })),
        )
        .await
    }
}

/// Attempts every removal, logging each failure, and returns the first error.
async fn remove_all<I, F, Fut>(kind: &str, names: I, mut remove: F) -> Result<()>
where
    I: IntoIterator<Item = String>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut first = None;
    for name in names {
        if let Err(e) = remove(name.clone()).await {
            warn!(kind, %name, error = %e, "removal failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Splits `repo[:tag]`, defaulting the tag to `latest` unless a digest is given.
fn split_image_tag(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }

    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rsplit_once(':') {
        Some((_, tag)) => {
            let repo = &image[..image.len() - tag.len() - 1];
            (repo.to_string(), tag.to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
