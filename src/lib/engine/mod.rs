pub mod dispatcher;
pub mod runner;
pub mod types;

pub use dispatcher::{Dispatcher, IdGenerator, UuidV7};
pub use runner::{RunnerConfig, run_file, run_pipeline};
pub use types::{PollConfig, RunInput, RunResult, RunnerError};
