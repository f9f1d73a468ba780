pub mod state;
pub mod types;

pub use state::StatusLatch;
pub use types::{Mount, Task};
