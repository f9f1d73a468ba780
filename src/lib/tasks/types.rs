use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub path: String,
}

/// One unit of work handed to a driver.
///
/// `id` is supplied by the caller and is only unique per dispatch; drivers
/// prefix it with their namespace to get the backend-visible name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

impl Task {
    pub fn new(id: impl Into<String>, image: impl Into<String>, command: Vec<String>) -> Self {
        Task {
            id: id.into(),
            image: image.into(),
            command,
            mounts: Vec::new(),
        }
    }

    pub fn with_mount(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// `<namespace>-<id>`: the idempotency key every backend sees.
    pub fn container_name(&self, namespace: &str) -> String {
        format!("{}-{}", namespace, self.id)
    }
}
