//! Runtime vertex handed to user callbacks.

use crate::error::{CoreError, Result};
use crate::stream::{InputStream, OutputStream};
use flowgraph_protocol::Key;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// One live vertex inside an executor.
///
/// Mutated only on the reactor thread that owns the enclosing executor.
/// Carries a type-erased state slot the user downcasts at callback sites.
pub struct Vertex {
    pub key: Key,
    tag: Option<String>,
    state: Option<Box<dyn Any + Send>>,
    ostreams: HashMap<Key, Arc<OutputStream>>,
    istreams: HashMap<Key, Arc<InputStream>>,
}

impl Vertex {
    pub(crate) fn new(key: Key, tag: Option<String>) -> Self {
        Self {
            key,
            tag,
            state: None,
            ostreams: HashMap::new(),
            istreams: HashMap::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Replace the per-vertex scratchpad.
    pub fn set_state<T: Any + Send>(&mut self, value: T) {
        self.state = Some(Box::new(value));
    }

    /// Downcast the scratchpad.
    pub fn state<T: Any + Send>(&self) -> Option<&T> {
        self.state.as_ref().and_then(|s| s.downcast_ref())
    }

    /// Downcast the scratchpad mutably.
    pub fn state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut().and_then(|s| s.downcast_mut())
    }

    pub(crate) fn attach_ostream(&mut self, key: Key, stream: Arc<OutputStream>) {
        self.ostreams.insert(key, stream);
    }

    pub(crate) fn attach_istream(&mut self, key: Key, stream: Arc<InputStream>) {
        self.istreams.insert(key, stream);
    }

    pub fn ostream(&self, key: Key) -> Option<&Arc<OutputStream>> {
        self.ostreams.get(&key)
    }

    pub fn istream(&self, key: Key) -> Option<&Arc<InputStream>> {
        self.istreams.get(&key)
    }

    /// Serialize one record into the given output stream.
    pub fn send<T: Serialize>(&self, stream: Key, value: &T) -> Result<()> {
        self.ostream(stream)
            .ok_or(CoreError::InvalidKey(stream))?
            .send(value)
    }

    /// Send one record down every output stream of this vertex.
    pub fn broadcast<T: Serialize>(&self, value: &T) -> Result<()> {
        for stream in self.ostreams.values() {
            stream.send(value)?;
        }
        Ok(())
    }

    /// Send one record down each of the named output streams.
    pub fn broadcast_to<T: Serialize>(&self, keys: &[Key], value: &T) -> Result<()> {
        for key in keys {
            self.send(*key, value)?;
        }
        Ok(())
    }

    /// Tear down one output stream once its buffered bytes drain.
    pub fn remove_ostream(&self, key: Key) -> Result<()> {
        self.ostream(key)
            .ok_or(CoreError::InvalidKey(key))?
            .remove_on_flush();
        Ok(())
    }

    /// Tear down one input stream immediately.
    pub fn remove_istream(&self, key: Key) -> Result<()> {
        self.istream(key)
            .ok_or(CoreError::InvalidKey(key))?
            .deregister();
        Ok(())
    }
}
