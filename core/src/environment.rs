//! Layered descriptors for the toolchain environment.
//!
//! An [`Environment`] is an immutable snapshot. Each `with_*` call returns a
//! new descriptor holding one extra layer on top of the one it was called on;
//! the parent is shared, never modified. Resolution walks the chain from the
//! newest layer down, so later layers override earlier ones.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
enum LayerKind {
    Base { container: String },
    Env { key: String, value: String },
    User(String),
    Workdir(String),
    Pipeline(String),
}

#[derive(Debug)]
struct Layer {
    kind: LayerKind,
    parent: Option<Arc<Layer>>,
}

/// Execution context for commands run in the toolchain container.
#[derive(Clone)]
pub struct Environment {
    head: Arc<Layer>,
}

impl Environment {
    /// Creates a root descriptor targeting the given container.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            head: Arc::new(Layer {
                kind: LayerKind::Base {
                    container: container.into(),
                },
                parent: None,
            }),
        }
    }

    fn layer(&self, kind: LayerKind) -> Self {
        Self {
            head: Arc::new(Layer {
                kind,
                parent: Some(Arc::clone(&self.head)),
            }),
        }
    }

    /// Sets an environment variable for commands run in this snapshot.
    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.layer(LayerKind::Env {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Sets the user commands run as.
    pub fn with_user(&self, user: impl Into<String>) -> Self {
        self.layer(LayerKind::User(user.into()))
    }

    /// Sets the working directory commands run in.
    pub fn with_workdir(&self, dir: impl Into<String>) -> Self {
        self.layer(LayerKind::Workdir(dir.into()))
    }

    /// Appends a pipeline label used for log context.
    pub fn with_pipeline(&self, name: impl Into<String>) -> Self {
        self.layer(LayerKind::Pipeline(name.into()))
    }

    fn layers(&self) -> impl Iterator<Item = &Layer> {
        std::iter::successors(Some(self.head.as_ref()), |layer| layer.parent.as_deref())
    }

    /// Name of the container this environment executes in.
    pub fn container(&self) -> &str {
        self.layers()
            .find_map(|layer| match &layer.kind {
                LayerKind::Base { container } => Some(container.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Resolved environment variables, newest value per key.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for layer in self.layers() {
            if let LayerKind::Env { key, value } = &layer.kind {
                vars.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        vars
    }

    /// Returns the newest value set for `key`.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.layers().find_map(|layer| match &layer.kind {
            LayerKind::Env { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// User commands run as, if one was set.
    pub fn user(&self) -> Option<&str> {
        self.layers().find_map(|layer| match &layer.kind {
            LayerKind::User(user) => Some(user.as_str()),
            _ => None,
        })
    }

    /// Working directory, if one was set.
    pub fn workdir(&self) -> Option<&str> {
        self.layers().find_map(|layer| match &layer.kind {
            LayerKind::Workdir(dir) => Some(dir.as_str()),
            _ => None,
        })
    }

    /// Pipeline labels, oldest first.
    pub fn pipeline(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .layers()
            .filter_map(|layer| match &layer.kind {
                LayerKind::Pipeline(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        labels.reverse();
        labels
    }

    /// Number of layers including the base.
    pub fn depth(&self) -> usize {
        self.layers().count()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values can carry secrets, so only keys are shown.
        f.debug_struct("Environment")
            .field("container", &self.container())
            .field("env_keys", &self.env().into_keys().collect::<Vec<_>>())
            .field("user", &self.user())
            .field("workdir", &self.workdir())
            .field("pipeline", &self.pipeline())
            .finish()
    }
}
