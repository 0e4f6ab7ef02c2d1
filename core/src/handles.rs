use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    NodeId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// REMOTE HANDLE
// ================================================================================================

/// A node-scoped name for an object that never leaves its owner node.
///
/// Messages carry the handle; the owner node echoes it back and dereferences
/// it locally through the [`HandleTable`] it was registered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    pub owner: NodeId,
    pub id: u64,
}

impl Serializable for RemoteHandle {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.owner.write_into(target);
        target.write_u64(self.id);
    }
}

impl Deserializable for RemoteHandle {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self { owner: NodeId::read_from(source)?, id: source.read_u64()? })
    }
}

// HANDLE TABLE
// ================================================================================================

/// Mints [`RemoteHandle`]s for node-local objects and resolves them on
/// return.
pub struct HandleTable<T> {
    owner: NodeId,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> HandleTable<T> {
    pub fn new(owner: NodeId) -> Self {
        Self { owner, next_id: AtomicU64::new(1), entries: Mutex::new(HashMap::new()) }
    }

    /// Registers an object and returns its handle.
    pub fn register(&self, value: T) -> RemoteHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, value);
        RemoteHandle { owner: self.owner, id }
    }

    /// Removes and returns the object named by a handle minted here.
    ///
    /// Panics if the handle belongs to another node; returns `None` if it
    /// was already taken.
    pub fn take(&self, handle: RemoteHandle) -> Option<T> {
        assert_eq!(handle.owner, self.owner, "handle dereferenced on wrong node");
        self.entries.lock().remove(&handle.id)
    }
}

impl<T: Clone> HandleTable<T> {
    /// Returns a clone of the object named by a handle without removing it.
    pub fn get(&self, handle: RemoteHandle) -> Option<T> {
        assert_eq!(handle.owner, self.owner, "handle dereferenced on wrong node");
        self.entries.lock().get(&handle.id).cloned()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_take() {
        let table: HandleTable<&'static str> = HandleTable::new(NodeId::new(2));
        let handle = table.register("payload");
        assert_eq!(handle.owner, NodeId::new(2));
        assert_eq!(table.take(handle), Some("payload"));
        assert_eq!(table.take(handle), None);
    }
}
