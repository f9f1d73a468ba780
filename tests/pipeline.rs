#![cfg(unix)]

use std::path::Path;

use orchestra::{
    bridge::BridgeError,
    drivers::{DriverError, DriverRegistry},
    engine::{run_file, run_pipeline, PollConfig, RunnerConfig, RunnerError},
};

fn config(namespace: &str) -> RunnerConfig {
    RunnerConfig {
        driver: "native".to_string(),
        namespace: namespace.to_string(),
        poll: PollConfig::default(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn hello_world_demo_passes_on_native() {
    let registry = DriverRegistry::with_defaults();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/hello-world.rhai");

    run_file(&registry, &config("demo"), &path).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn results_flow_back_into_the_script() {
    let source = r#"
        fn pipeline() {
            let ok = run(#{ name: "ok", image: "alpine", command: ["sh", "-c", "echo out; exit 0"] });
            assert::equal(0, ok.code);
            assert::equal("out\n", ok.stdout);

            let failed = run(#{ name: "failed", image: "alpine", command: ["sh", "-c", "exit 4"] });
            assert::equal(4, failed.code);
            assert::equal("", failed.error);

            let broken = run(#{ name: "broken", image: "alpine", command: [] });
            assert::equal(1, broken.code);
            assert::contains_string("could not run container", broken.error);
        }
    "#;

    run_pipeline(&DriverRegistry::with_defaults(), &config("flow"), source.to_string())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_assertion_fails_the_run() {
    let source = r#"
        fn pipeline() {
            let result = run(#{ name: "fail", image: "alpine", command: ["false"] });
            assert::equal(0, result.code, "step must pass");
        }
    "#;

    let err = run_pipeline(&DriverRegistry::with_defaults(), &config("assert"), source.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Bridge(BridgeError::Assertion(message)) if message == "step must pass"));
}

#[tokio::test]
async fn unknown_driver_is_rejected_before_evaluation() {
    let config = RunnerConfig {
        driver: "podman".to_string(),
        ..Default::default()
    };

    let err = run_pipeline(&DriverRegistry::with_defaults(), &config, "fn pipeline() {}".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Driver(DriverError::Config(_))));
}

#[tokio::test]
async fn missing_pipeline_file_is_a_read_error() {
    let err = run_file(&DriverRegistry::with_defaults(), &config("missing"), Path::new("does/not/exist.rhai"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Read { .. }));
}
