use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Buffer not registered: {0}")]
    NotFound(String),
}

/// Display names of the remote buffers this session knows about, keyed by
/// buffer pointer
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<String, String>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pointer: &str, name: &str) {
        if let Some(previous) = self.buffers.insert(pointer.to_string(), name.to_string()) {
            debug!("Buffer {} renamed from {} to {}", pointer, previous, name);
        } else {
            debug!("Registered buffer {} as {}", pointer, name);
        }
    }

    pub fn unregister(&mut self, pointer: &str) -> Option<String> {
        let removed = self.buffers.remove(pointer);
        debug!("Unregistered buffer {} ({:?})", pointer, removed);
        removed
    }

    pub fn lookup(&self, pointer: &str) -> Result<&str, RegistryError> {
        self.buffers
            .get(pointer)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::NotFound(pointer.to_string()))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}
