use std::sync::Arc;

use rhai::{
    serde::{from_dynamic, to_dynamic},
    Dynamic, Engine, EvalAltResult, Scope,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::{
    assert,
    types::{BridgeError, ENTRY_POINT},
};
use crate::engine::{dispatcher::Dispatcher, types::RunInput};

/// Evaluates pipeline scripts, exposing `run(#{...})` and `assert::*`.
///
/// Must be driven from a thread outside the async runtime: `run` blocks on
/// `handle` until the dispatch completes.
pub struct ScriptBridge {
    dispatcher: Arc<Dispatcher>,
    handle: Handle,
}

impl ScriptBridge {
    pub fn new(dispatcher: Arc<Dispatcher>, handle: Handle) -> Self {
        ScriptBridge { dispatcher, handle }
    }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();

        engine.on_print(|text| info!(target: "pipeline", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "pipeline", source = source.unwrap_or(""), %pos, "{text}")
        });
        engine.register_static_module("assert", assert::module().into());

        let dispatcher = self.dispatcher.clone();
        let handle = self.handle.clone();
        engine.register_fn(
            "run",
            move |input: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                let input: RunInput = from_dynamic(&input)?;
                let result = handle.block_on(dispatcher.dispatch(input));
                to_dynamic(result)
            },
        );

        engine
    }

    pub fn execute(&self, source: &str) -> Result<(), BridgeError> {
        let engine = self.engine();
        let ast = engine
            .compile(source)
            .map_err(|e| BridgeError::Compile(e.to_string()))?;

        let has_entry = ast
            .iter_functions()
            .any(|f| f.name == ENTRY_POINT && f.params.is_empty());
        if !has_entry {
            return Err(BridgeError::PipelineNotFound);
        }

        engine
            .call_fn::<Dynamic>(&mut Scope::new(), &ast, ENTRY_POINT, ())
            .map_err(|e| BridgeError::from_eval(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::runtime::Runtime;

    use super::*;
    use crate::{
        drivers::types::{Container, ContainerStatus, Context, Driver, LogSink, Result, Volume},
        engine::types::PollConfig,
        tasks::types::Task,
    };

    /// Finishes every task immediately and echoes its command back.
    struct EchoDriver;

    struct EchoContainer {
        id: String,
        output: String,
    }

    #[async_trait]
    impl Driver for EchoDriver {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run_container(&self, _ctx: &Context, task: Task) -> Result<Box<dyn Container>> {
            Ok(Box::new(EchoContainer {
                id: task.id,
                output: format!("{}\n", task.command.join(" ")),
            }))
        }

        async fn create_volume(&self, _ctx: &Context, name: &str, _size: u64) -> Result<Box<dyn Volume>> {
            Err(crate::drivers::types::DriverError::VolumeNotFound(name.to_string()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Container for EchoContainer {
        fn id(&self) -> &str {
            &self.id
        }

        async fn status(&self, _ctx: &Context) -> Result<ContainerStatus> {
            Ok(ContainerStatus::exited(0))
        }

        async fn logs(&self, _ctx: &Context, stdout: LogSink<'_>, _stderr: LogSink<'_>) -> Result<()> {
            stdout.write_all(self.output.as_bytes())?;
            Ok(())
        }

        async fn cleanup(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
    }

    fn execute(source: &str) -> std::result::Result<(), BridgeError> {
        let rt = Runtime::new().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(EchoDriver)).with_poll(PollConfig::immediate());
        ScriptBridge::new(Arc::new(dispatcher), rt.handle().clone()).execute(source)
    }

    #[test]
    fn run_marshals_by_field_name() {
        let source = r#"
            fn pipeline() {
                let a = run(#{ name: "a", image: "alpine", command: ["echo", "hi"] });
                let b = run(#{ command: ["echo", "hi"], image: "alpine", name: "b" });
                assert::equal(0, a.code);
                assert::equal(a.stdout, b.stdout);
                assert::contains_string("^echo hi", a.stdout, "stdout was " + a.stdout);
                assert::equal("", a.error);
            }
        "#;
        execute(source).unwrap();
    }

    #[test]
    fn failed_assertion_is_reported_as_such() {
        let source = r#"
            fn pipeline() {
                let result = run(#{ name: "t", image: "alpine", command: ["echo", "hi"] });
                assert::equal(1, result.code, "wanted a failure");
            }
        "#;
        match execute(source) {
            Err(BridgeError::Assertion(message)) => assert_eq!(message, "wanted a failure"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn script_without_entry_point_is_rejected() {
        let source = r#"fn build(target) { run(#{ image: "alpine", command: [target] }) }"#;
        assert!(matches!(execute(source), Err(BridgeError::PipelineNotFound)));
    }

    #[test]
    fn syntax_error_fails_compilation() {
        assert!(matches!(execute("fn pipeline( {"), Err(BridgeError::Compile(_))));
    }

    #[test]
    fn other_script_errors_are_runtime_errors() {
        let source = r#"fn pipeline() { run(#{ name: "missing image" }) }"#;
        assert!(matches!(execute(source), Err(BridgeError::Runtime(_))));
    }
}
