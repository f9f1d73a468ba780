//! Runs scripted CI pipelines as containerised tasks on a pluggable backend:
//! the local Docker daemon, plain local processes, or Fly.io machines.

pub mod bridge;
pub mod drivers;
pub mod engine;
pub mod tasks;
