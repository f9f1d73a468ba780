use std::{collections::BTreeMap, sync::Arc};

use super::{
    docker::Docker,
    fly::Fly,
    native::Native,
    types::{Driver, DriverError, Result},
};

/// Builds a driver scoped to the given namespace.
pub type InitFn = fn(&str) -> Result<Arc<dyn Driver>>;

/// Lookup table from driver name to constructor, handed to the runner at
/// startup instead of living in process-wide state.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, InitFn>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// docker, native and fly.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("docker", |namespace| Ok(Arc::new(Docker::new(namespace)?)));
        registry.register("native", |namespace| Ok(Arc::new(Native::new(namespace)?)));
        registry.register("fly", |namespace| Ok(Arc::new(Fly::from_env(namespace)?)));
        registry
    }

    pub fn register(&mut self, name: &str, init: InitFn) {
        self.drivers.insert(name.to_string(), init);
    }

    pub fn get(&self, name: &str) -> Option<InitFn> {
        self.drivers.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn build(&self, name: &str, namespace: &str) -> Result<Arc<dyn Driver>> {
        let init = self
            .get(name)
            .ok_or_else(|| DriverError::Config(format!("unknown driver {name:?}")))?;
        init(namespace)
    }
}
