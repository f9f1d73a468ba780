use std::sync::Mutex;

use crate::drivers::types::ContainerStatus;

/// Only running -> running, running -> done and done -> same done are allowed.
pub fn valid_status_transition(src: &ContainerStatus, dst: &ContainerStatus) -> bool {
    match (src.is_done(), dst.is_done()) {
        (false, _) => true,
        (true, true) => src.exit_code() == dst.exit_code(),
        (true, false) => false,
    }
}

/// Pins the first terminal status a container reports so later polls can
/// never flap back to running or to a different exit code.
#[derive(Debug, Default)]
pub struct StatusLatch {
    terminal: Mutex<Option<ContainerStatus>>,
}

impl StatusLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, status: ContainerStatus) -> ContainerStatus {
        let mut terminal = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(done) = *terminal {
            if !valid_status_transition(&done, &status) {
                tracing::debug!(
                    pinned = done.exit_code(),
                    observed = status.exit_code(),
                    "ignoring status after terminal state"
                );
            }
            return done;
        }

        if status.is_done() {
            *terminal = Some(status);
        }
        status
    }
}
