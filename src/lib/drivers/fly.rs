use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    docker::NAMESPACE_LABEL,
    fly_api::{
        CreateVolume, FlyApi, FlyConfig, LaunchMachine, LogEntry, MachineConfig, MachineMount,
        MachineProcess,
    },
    limiter::RateLimiter,
    types::{
        Container, ContainerStatus, Context, Driver, DriverError, LogSink, Result, Volume,
        cancellable,
    },
};
use crate::tasks::{state::StatusLatch, types::Task};

/// Calls per second allowed against the machines API.
const RATE_LIMIT: u32 = 3;
const MAX_VOLUME_NAME: usize = 30;

/// Runs tasks as Fly machines in one app.
pub struct Fly {
    api: FlyApi,
    limiter: Arc<RateLimiter>,
    namespace: String,
    /// Ids of volumes created through this driver, destroyed on close.
    volumes: Mutex<Vec<String>>,
}

pub struct FlyContainer {
    api: FlyApi,
    limiter: Arc<RateLimiter>,
    id: String,
    instance_id: String,
    latch: StatusLatch,
}

pub struct FlyVolumeHandle {
    api: FlyApi,
    limiter: Arc<RateLimiter>,
    id: String,
    name: String,
}

impl Fly {
    pub fn new(namespace: &str, config: FlyConfig) -> Self {
        Fly {
            api: FlyApi::new(config),
            limiter: Arc::new(RateLimiter::per_second(RATE_LIMIT)),
            namespace: namespace.to_string(),
            volumes: Mutex::new(Vec::new()),
        }
    }

    /// Missing credentials fail here, before anything is dispatched.
    pub fn from_env(namespace: &str) -> Result<Self> {
        Ok(Self::new(namespace, FlyConfig::from_env()?))
    }

    fn container(&self, id: String, instance_id: String) -> Box<dyn Container> {
        Box::new(FlyContainer {
            api: self.api.clone(),
            limiter: self.limiter.clone(),
            id,
            instance_id,
            latch: StatusLatch::new(),
        })
    }

    fn volume_name(&self, name: &str) -> String {
        volume_name(&self.namespace, name)
    }

    async fn resolve_mounts(&self, ctx: &Context, task: &Task) -> Result<Vec<MachineMount>> {
        if task.mounts.is_empty() {
            return Ok(Vec::new());
        }

        self.limiter.take().await;
        let volumes = cancellable(ctx, self.api.list_volumes()).await?;
        let by_name: HashMap<_, _> = volumes
            .into_iter()
            .map(|volume| (volume.name, volume.id))
            .collect();

        task.mounts
            .iter()
            .map(|mount| {
                let name = self.volume_name(&mount.name);
                by_name
                    .get(&name)
                    .map(|id| MachineMount {
                        volume: id.clone(),
                        path: mount.path.clone(),
                    })
                    .ok_or(DriverError::VolumeNotFound(name))
            })
            .collect()
    }
}

#[async_trait]
impl Driver for Fly {
    fn name(&self) -> &'static str {
        "fly"
    }

    async fn run_container(&self, ctx: &Context, task: Task) -> Result<Box<dyn Container>> {
        let name = task.container_name(&self.namespace);

        self.limiter.take().await;
        let machines = cancellable(ctx, self.api.list_machines()).await?;
        if let Some(machine) = machines
            .into_iter()
            .find(|machine| machine.is_active() && machine.name == name)
        {
            info!(%name, id = %machine.id, "reusing existing machine");
            return Ok(self.container(machine.id, machine.instance_id));
        }

        let mounts = self.resolve_mounts(ctx, &task).await?;
        let input = LaunchMachine {
            name: name.clone(),
            config: MachineConfig {
                image: task.image.clone(),
                processes: vec![MachineProcess {
                    cmd: task.command.clone(),
                }],
                mounts,
                metadata: HashMap::from([(NAMESPACE_LABEL.to_string(), self.namespace.clone())]),
                ..Default::default()
            },
        };

        self.limiter.take().await;
        let machine = cancellable(ctx, self.api.launch_machine(&input)).await?;

        info!(%name, id = %machine.id, "machine launched");
        Ok(self.container(machine.id, machine.instance_id))
    }

    async fn create_volume(&self, ctx: &Context, name: &str, size: u64) -> Result<Box<dyn Volume>> {
        let input = CreateVolume {
            name: self.volume_name(name),
            size_gb: size.max(1),
            region: self.api.region().map(str::to_string),
        };

        self.limiter.take().await;
        let volume = cancellable(ctx, self.api.create_volume(&input)).await?;
        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.push(volume.id.clone());
        }

        Ok(Box::new(FlyVolumeHandle {
            api: self.api.clone(),
            limiter: self.limiter.clone(),
            id: volume.id,
            name: volume.name,
        }))
    }

    /// Machines are matched on their namespace metadata, volumes on the ids
    /// this driver created; name prefixes overlap between namespaces.
    async fn close(&self) -> Result<()> {
        self.limiter.take().await;
        let machines = self.api.list_machines().await?;
        for machine in machines.iter().filter(|machine| {
            machine.is_active() && machine.metadata(NAMESPACE_LABEL) == Some(self.namespace.as_str())
        }) {
            self.limiter.take().await;
            self.api.destroy_machine(&machine.id).await?;
            debug!(id = %machine.id, "machine destroyed");
        }

        let volumes = match self.volumes.lock() {
            Ok(mut volumes) => std::mem::take(&mut *volumes),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for id in volumes {
            self.limiter.take().await;
            self.api.destroy_volume(&id).await?;
            debug!(%id, "volume destroyed");
        }

        info!(namespace = %self.namespace, app = self.api.app_name(), "fly namespace removed");
        Ok(())
    }
}

#[async_trait]
impl Container for FlyContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self, ctx: &Context) -> Result<ContainerStatus> {
        self.limiter.take().await;
        let machine = cancellable(ctx, self.api.get_machine(&self.id)).await?;

        let status = match machine.exit_code() {
            Some(code) => ContainerStatus::exited(code),
            None => ContainerStatus::running(),
        };
        Ok(self.latch.observe(status))
    }

    async fn logs(&self, ctx: &Context, stdout: LogSink<'_>, _stderr: LogSink<'_>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(64);

        let api = self.api.clone();
        let limiter = self.limiter.clone();
        let instance = self.id.clone();
        let cancel = ctx.clone();
        let poller =
            tokio::spawn(async move { poll_logs(api, limiter, instance, cancel, tx).await });

        while let Some(entry) = rx.recv().await {
            let message = entry.attributes.message;
            stdout.write_all(message.as_bytes())?;
            if !message.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
        }

        match poller.await {
            Ok(res) => res,
            Err(e) => Err(DriverError::Process(format!("log poller failed: {e}"))),
        }
    }

    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        self.limiter.take().await;
        cancellable(ctx, self.api.destroy_machine(&self.id)).await?;
        debug!(id = %self.id, instance = %self.instance_id, "machine destroyed");
        Ok(())
    }
}

/// Pages through the log stream until an empty page; no tailing. An entry
/// id seen on an earlier page is not sent again.
async fn poll_logs(
    api: FlyApi,
    limiter: Arc<RateLimiter>,
    instance: String,
    cancel: Context,
    tx: mpsc::Sender<LogEntry>,
) -> Result<()> {
    let mut next_token = String::new();
    let mut seen = HashSet::new();
    loop {
        limiter.take().await;
        let page = cancellable(&cancel, api.logs(&instance, &next_token)).await?;
        if page.data.is_empty() {
            return Ok(());
        }

        for entry in page.data {
            if !entry.id.is_empty() && !seen.insert(entry.id.clone()) {
                continue;
            }
            if tx.send(entry).await.is_err() {
                warn!(%instance, "log reader went away");
                return Ok(());
            }
        }

        if page.meta.next_token.is_empty() || page.meta.next_token == next_token {
            return Ok(());
        }
        next_token = page.meta.next_token;
    }
}

#[async_trait]
impl Volume for FlyVolumeHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        self.limiter.take().await;
        cancellable(ctx, self.api.destroy_volume(&self.id)).await
    }
}

/// Fly volume names are `[a-z0-9_]` and at most 30 characters.
fn volume_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_VOLUME_NAME)
        .collect()
}
