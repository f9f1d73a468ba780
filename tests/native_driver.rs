#![cfg(unix)]

use std::time::Duration;

use orchestra::{
    drivers::{native::Native, Container, ContainerStatus, Context, Driver, DriverError},
    tasks::Task,
};

fn sh(id: &str, script: &str) -> Task {
    Task::new(id, "ignored", vec!["sh".to_string(), "-c".to_string(), script.to_string()])
}

async fn wait(container: &dyn Container, ctx: &Context) -> ContainerStatus {
    for _ in 0..500 {
        let status = container.status(ctx).await.unwrap();
        if status.is_done() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never finished", container.id());
}

async fn logs(container: &dyn Container, ctx: &Context) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    container.logs(ctx, &mut stdout, &mut stderr).await.unwrap();
    (
        String::from_utf8(stdout).unwrap(),
        String::from_utf8(stderr).unwrap(),
    )
}

#[tokio::test]
async fn echo_runs_to_completion() {
    let native = Native::new("native-echo").unwrap();
    let ctx = Context::new();
    let task = Task::new("echo", "alpine", vec!["echo".to_string(), "hello".to_string()]);

    let container = native.run_container(&ctx, task).await.unwrap();
    assert_eq!(wait(container.as_ref(), &ctx).await, ContainerStatus::exited(0));
    assert_eq!(logs(container.as_ref(), &ctx).await, ("hello\n".to_string(), String::new()));

    container.cleanup(&ctx).await.unwrap();
    native.close().await.unwrap();
}

#[tokio::test]
async fn stderr_is_reported_on_stdout() {
    let native = Native::new("native-merge").unwrap();
    let ctx = Context::new();

    let container = native.run_container(&ctx, sh("merge", "echo out; echo err >&2")).await.unwrap();
    wait(container.as_ref(), &ctx).await;

    let (stdout, stderr) = logs(container.as_ref(), &ctx).await;
    assert!(stdout.contains("out\n"));
    assert!(stdout.contains("err\n"));
    assert!(stderr.is_empty());
}

#[tokio::test]
async fn finished_status_is_stable() {
    let native = Native::new("native-stable").unwrap();
    let ctx = Context::new();

    let container = native.run_container(&ctx, sh("fail", "exit 3")).await.unwrap();
    assert_eq!(wait(container.as_ref(), &ctx).await, ContainerStatus::exited(3));

    for _ in 0..3 {
        assert_eq!(container.status(&ctx).await.unwrap(), ContainerStatus::exited(3));
    }
}

#[tokio::test]
async fn same_name_reuses_the_running_process() {
    let native = Native::new("native-idem").unwrap();
    let ctx = Context::new();

    let first = native.run_container(&ctx, sh("once", "echo ran >> count")).await.unwrap();
    let second = native.run_container(&ctx, sh("once", "echo ran >> count")).await.unwrap();
    assert_eq!(first.id(), second.id());

    wait(first.as_ref(), &ctx).await;
    wait(second.as_ref(), &ctx).await;

    let count = std::fs::read_to_string(native.path().join("native-idem-once").join("count")).unwrap();
    assert_eq!(count, "ran\n");
}

#[tokio::test]
async fn environment_only_keeps_path() {
    let native = Native::new("native-env").unwrap();
    let ctx = Context::new();

    let container = native
        .run_container(&ctx, sh("env", "echo ${CARGO_PKG_NAME:-unset}"))
        .await
        .unwrap();
    wait(container.as_ref(), &ctx).await;

    assert_eq!(logs(container.as_ref(), &ctx).await.0, "unset\n");
}

#[tokio::test]
async fn cancellation_kills_the_process() {
    let native = Native::new("native-kill").unwrap();
    let ctx = Context::new();

    let container = native
        .run_container(&ctx, Task::new("sleep", "", vec!["sleep".to_string(), "30".to_string()]))
        .await
        .unwrap();
    ctx.cancel();

    let status = wait(container.as_ref(), &Context::new()).await;
    assert_eq!(status.exit_code(), 137);
}

#[tokio::test]
async fn mounts_link_volumes_into_the_workdir() {
    let native = Native::new("native-vol").unwrap();
    let ctx = Context::new();

    let volume = native.create_volume(&ctx, "cache", 1).await.unwrap();
    assert_eq!(volume.name(), "cache");
    let volume_dir = native.path().join("cache");
    assert!(volume_dir.is_dir());

    let task = sh("write", "echo cached > data/file").with_mount("cache", "/data");
    let container = native.run_container(&ctx, task).await.unwrap();
    assert_eq!(wait(container.as_ref(), &ctx).await, ContainerStatus::exited(0));
    assert_eq!(std::fs::read_to_string(volume_dir.join("file")).unwrap(), "cached\n");

    volume.cleanup(&ctx).await.unwrap();
    assert!(!volume_dir.exists());
    volume.cleanup(&ctx).await.unwrap();
}

#[tokio::test]
async fn volume_names_cannot_escape_the_namespace() {
    let native = Native::new("native-escape").unwrap();
    let err = native.create_volume(&Context::new(), "../outside", 1).await.err().unwrap();
    assert!(matches!(err, DriverError::InvalidPath(_)));
}

#[tokio::test]
async fn close_removes_the_namespace_directory() {
    let native = Native::new("native-close").unwrap();
    let root = native.path().to_path_buf();
    let ctx = Context::new();

    let container = native.run_container(&ctx, sh("touch", "touch marker")).await.unwrap();
    wait(container.as_ref(), &ctx).await;
    assert!(root.join("native-close-touch").join("marker").exists());

    native.close().await.unwrap();
    assert!(!root.exists());
}

#[tokio::test]
async fn mount_paths_cannot_escape_the_workdir() {
    let native = Native::new("native-mount-escape").unwrap();
    let ctx = Context::new();
    let outside = native.path().parent().unwrap().join("native-mount-escaped-link");

    for path in ["../../native-mount-escaped-link", "/", ""] {
        let task = sh("escape", "true").with_mount("cache", path);
        let err = native.run_container(&ctx, task).await.err().unwrap();
        assert!(matches!(err, DriverError::InvalidPath(_)), "{path:?}: {err}");
    }

    native.close().await.unwrap();
    assert!(!outside.exists());
}

#[tokio::test]
async fn logs_never_run_ahead_of_the_process() {
    let native = Native::new("native-partial").unwrap();
    let ctx = Context::new();

    let container = native
        .run_container(&ctx, sh("partial", "echo first; sleep 1; echo second"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!container.status(&ctx).await.unwrap().is_done());
    let (early, _) = logs(container.as_ref(), &ctx).await;

    wait(container.as_ref(), &ctx).await;
    let (complete, _) = logs(container.as_ref(), &ctx).await;
    assert_eq!(complete, "first\nsecond\n");
    assert!(complete.starts_with(&early), "{early:?} is not a prefix");

    let (again, _) = logs(container.as_ref(), &ctx).await;
    assert_eq!(again, complete);
}
