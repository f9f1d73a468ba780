use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc::{self, error::TryRecvError},
};
use tracing::{debug, info, warn};

use super::types::{
    Container, ContainerStatus, Context, Driver, DriverError, LogSink, Result, Volume,
};
use crate::tasks::types::Task;

type Outcome = std::result::Result<ExitStatus, String>;

/// Runs task commands as local processes under a per-namespace temp root.
///
/// The image is ignored. stdout and stderr are captured into one buffer and
/// all of it is reported as stdout.
pub struct Native {
    namespace: String,
    path: PathBuf,
    root: Mutex<Option<TempDir>>,
    containers: Mutex<HashMap<String, NativeContainer>>,
}

#[derive(Clone)]
pub struct NativeContainer {
    name: String,
    output: Arc<Mutex<Vec<u8>>>,
    done_tx: mpsc::Sender<Outcome>,
    done_rx: Arc<Mutex<mpsc::Receiver<Outcome>>>,
}

pub struct NativeVolume {
    name: String,
    path: PathBuf,
}

impl Native {
    pub fn new(namespace: &str) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix(&format!("{}-", namespace))
            .tempdir()?;

        Ok(Native {
            namespace: namespace.to_string(),
            path: root.path().to_path_buf(),
            root: Mutex::new(Some(root)),
            containers: Mutex::new(HashMap::new()),
        })
    }

    /// Namespace root holding every working directory and volume.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scoped_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.path.join(contained(name)?))
    }

    fn link_mounts(&self, workdir: &Path, task: &Task) -> Result<()> {
        for mount in &task.mounts {
            let target = workdir.join(contained(mount.path.trim_start_matches('/'))?);
            let source = self.scoped_path(&mount.name)?;
            std::fs::create_dir_all(&source)?;

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            #[cfg(unix)]
            std::os::unix::fs::symlink(&source, &target)?;
            #[cfg(not(unix))]
            warn!(mount = %mount.name, "mounts are only supported on unix");
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for Native {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn run_container(&self, ctx: &Context, task: Task) -> Result<Box<dyn Container>> {
        let name = task.container_name(&self.namespace);

        let mut containers = self
            .containers
            .lock()
            .map_err(|_| DriverError::Process("container table poisoned".to_string()))?;
        if let Some(existing) = containers.get(&name) {
            info!(%name, "reusing existing process");
            return Ok(Box::new(existing.clone()));
        }

        let Some((program, args)) = task.command.split_first() else {
            return Err(DriverError::InvalidTask(format!("{name}: command is empty")));
        };

        let workdir = self.scoped_path(&name)?;
        std::fs::create_dir_all(&workdir)?;
        self.link_mounts(&workdir, &task)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let (done_tx, done_rx) = mpsc::channel(1);
        let container = NativeContainer {
            name: name.clone(),
            output: Arc::new(Mutex::new(Vec::new())),
            done_tx: done_tx.clone(),
            done_rx: Arc::new(Mutex::new(done_rx)),
        };

        let output = container.output.clone();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            let outcome = supervise(command, output, cancel).await;
            // Capacity one and this is the only send before the first receive.
            let _ = done_tx.try_send(outcome);
        });

        debug!(%name, dir = %workdir.display(), "process spawned");
        containers.insert(name, container.clone());
        Ok(Box::new(container))
    }

    async fn create_volume(&self, _ctx: &Context, name: &str, _size: u64) -> Result<Box<dyn Volume>> {
        let path = self.scoped_path(name)?;
        std::fs::create_dir_all(&path)?;

        Ok(Box::new(NativeVolume {
            name: name.to_string(),
            path,
        }))
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut containers) = self.containers.lock() {
            containers.clear();
        }

        let root = self.root.lock().ok().and_then(|mut root| root.take());
        if let Some(root) = root {
            root.close()?;
            info!(namespace = %self.namespace, "native namespace removed");
        }
        Ok(())
    }
}

/// A relative path that names something strictly below the directory it is
/// joined onto.
fn contained(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let names_something = relative
        .components()
        .any(|c| matches!(c, Component::Normal(_)));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || !names_something {
        return Err(DriverError::InvalidPath(path.to_string()));
    }
    Ok(relative)
}

async fn supervise(mut command: Command, output: Arc<Mutex<Vec<u8>>>, cancel: Context) -> Outcome {
    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to run command: {e}"))?;

    let stdout = child.stdout.take().map(|pipe| tokio::spawn(pump(pipe, output.clone())));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(pump(pipe, output.clone())));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            warn!("cancelled, killing process");
            let _ = child.start_kill();
            child.wait().await
        }
    }
    .map_err(|e| format!("failed to wait for command: {e}"))?;

    // Drain whatever is still buffered in the pipes before signalling.
    for pump in [stdout, stderr].into_iter().flatten() {
        let _ = pump.await;
    }

    Ok(status)
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if let Ok(mut buffer) = output.lock() {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn exit_code(status: &ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }

    -1
}

#[async_trait]
impl Container for NativeContainer {
    fn id(&self) -> &str {
        &self.name
    }

    async fn status(&self, ctx: &Context) -> Result<ContainerStatus> {
        if ctx.is_cancelled() {
            return Err(DriverError::Cancelled);
        }

        let mut done_rx = self
            .done_rx
            .lock()
            .map_err(|_| DriverError::Process("completion slot poisoned".to_string()))?;

        match done_rx.try_recv() {
            Ok(outcome) => {
                let status = match &outcome {
                    Ok(exit) => Ok(ContainerStatus::exited(exit_code(exit))),
                    Err(reason) => Err(DriverError::Process(reason.clone())),
                };
                // Put it back so every later poll sees the same terminal result.
                let _ = self.done_tx.try_send(outcome);
                status
            }
            Err(TryRecvError::Empty) => Ok(ContainerStatus::running()),
            Err(TryRecvError::Disconnected) => Err(DriverError::Process(
                "completion signal closed".to_string(),
            )),
        }
    }

    async fn logs(&self, _ctx: &Context, stdout: LogSink<'_>, _stderr: LogSink<'_>) -> Result<()> {
        let snapshot = match self.output.lock() {
            Ok(buffer) => buffer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stdout.write_all(&snapshot)?;
        Ok(())
    }

    async fn cleanup(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Volume for NativeVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cleanup(&self, _ctx: &Context) -> Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_paths_stay_inside_the_namespace() {
        let native = Native::new("scoped").unwrap();

        assert!(native.scoped_path("cache").unwrap().starts_with(native.path()));
        assert!(native.scoped_path("a/b").unwrap().starts_with(native.path()));
        assert!(matches!(
            native.scoped_path("../escape"),
            Err(DriverError::InvalidPath(_))
        ));
        assert!(matches!(
            native.scoped_path("/etc"),
            Err(DriverError::InvalidPath(_))
        ));
    }

    #[test]
    fn contained_rejects_paths_naming_nothing_below() {
        assert!(contained("data").is_ok());
        assert!(contained("./data/cache").is_ok());
        for path in ["", ".", "..", "../../escaped", "data/../../up", "/abs"] {
            assert!(
                matches!(contained(path), Err(DriverError::InvalidPath(_))),
                "{path:?} accepted"
            );
        }
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let native = Native::new("empty").unwrap();
        let res = native
            .run_container(&Context::new(), Task::new("t", "alpine", vec![]))
            .await;
        assert!(matches!(res, Err(DriverError::InvalidTask(_))));
    }

    #[tokio::test]
    async fn cancelled_context_fails_status_immediately() {
        let native = Native::new("cancel").unwrap();
        let ctx = Context::new();
        let container = native
            .run_container(&ctx, Task::new("t", "", vec!["sleep".into(), "5".into()]))
            .await
            .unwrap();

        ctx.cancel();
        assert!(matches!(
            container.status(&ctx).await,
            Err(DriverError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_through_status() {
        let native = Native::new("missing").unwrap();
        let ctx = Context::new();
        let container = native
            .run_container(&ctx, Task::new("t", "", vec!["definitely-not-a-binary".into()]))
            .await
            .unwrap();

        let mut err = None;
        for _ in 0..200 {
            match container.status(&ctx).await {
                Ok(status) if !status.is_done() => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await
                }
                other => {
                    err = other.err();
                    break;
                }
            }
        }
        assert!(matches!(err, Some(DriverError::Process(_))));
        assert!(matches!(
            container.status(&ctx).await,
            Err(DriverError::Process(_))
        ));
    }

    #[test]
    fn signal_exit_is_reported_as_done() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(exit_code(&ExitStatus::from_raw(9)), 137);
            assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        }
    }
}
