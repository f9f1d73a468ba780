pub mod docker;
pub mod fly;
pub mod fly_api;
pub mod limiter;
pub mod native;
pub mod registry;
pub mod types;

pub use registry::{DriverRegistry, InitFn};
pub use types::{Container, ContainerStatus, Context, Driver, DriverError, Volume};
