use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tessera_core::{MemoryHandle, MemoryKind, NodeId};

use crate::TransferError;

// MEMORY STORE
// ================================================================================================

/// One memory instance: a byte array addressed by offset.
///
/// Channels copy between stores; remote-write payloads land in stores of
/// [`MemoryKind::Registered`].
pub struct MemoryStore {
    handle: MemoryHandle,
    data: Mutex<Vec<u8>>,
}

impl MemoryStore {
    fn new(handle: MemoryHandle, size: usize) -> Self {
        Self { handle, data: Mutex::new(vec![0; size]) }
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<(), TransferError> {
        let size = self.size();
        if offset + len > size {
            return Err(TransferError::OutOfBounds { mem: self.handle, offset, len, size });
        }
        Ok(())
    }

    /// Copies `len` bytes starting at `offset` out of the store.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        self.check_bounds(offset, len)?;
        let data = self.data.lock();
        Ok(data[offset as usize..(offset + len) as usize].to_vec())
    }

    /// Writes `bytes` into the store starting at `offset`.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        self.check_bounds(offset, bytes.len() as u64)?;
        let mut data = self.data.lock();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `len` bytes from `src` at `src_off` into `self` at `dst_off`.
    pub fn copy_from(
        &self,
        dst_off: u64,
        src: &MemoryStore,
        src_off: u64,
        len: u64,
    ) -> Result<(), TransferError> {
        // a store never chains to itself within one request, but the two
        // handles may name the same memory for in-place layout changes
        if core::ptr::eq(self, src) {
            let bytes = self.read(src_off, len)?;
            return self.write(dst_off, &bytes);
        }
        self.check_bounds(dst_off, len)?;
        src.check_bounds(src_off, len)?;
        let src_data = src.data.lock();
        let mut dst_data = self.data.lock();
        dst_data[dst_off as usize..(dst_off + len) as usize]
            .copy_from_slice(&src_data[src_off as usize..(src_off + len) as usize]);
        Ok(())
    }
}

// MEMORY POOL
// ================================================================================================

/// The memories resident on one node, addressable by handle.
pub struct MemoryPool {
    node: NodeId,
    next_index: Mutex<u32>,
    stores: RwLock<HashMap<MemoryHandle, Arc<MemoryStore>>>,
}

impl MemoryPool {
    pub fn new(node: NodeId) -> Self {
        Self { node, next_index: Mutex::new(0), stores: RwLock::new(HashMap::new()) }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Creates a memory of the given kind and size and returns its handle.
    pub fn create_memory(&self, kind: MemoryKind, size: usize) -> MemoryHandle {
        let index = {
            let mut next = self.next_index.lock();
            let index = *next;
            *next += 1;
            index
        };
        let handle = MemoryHandle::new(self.node, kind, index);
        self.stores.write().insert(handle, Arc::new(MemoryStore::new(handle, size)));
        handle
    }

    /// Looks up a memory resident on this node.
    pub fn get(&self, handle: MemoryHandle) -> Result<Arc<MemoryStore>, TransferError> {
        self.stores
            .read()
            .get(&handle)
            .cloned()
            .ok_or(TransferError::UnknownMemory(handle))
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_between_stores() {
        let pool = MemoryPool::new(NodeId::new(0));
        let src = pool.create_memory(MemoryKind::System, 64);
        let dst = pool.create_memory(MemoryKind::System, 64);
        let src_store = pool.get(src).unwrap();
        let dst_store = pool.get(dst).unwrap();

        src_store.write(0, &[1, 2, 3, 4]).unwrap();
        dst_store.copy_from(8, &src_store, 0, 4).unwrap();
        assert_eq!(dst_store.read(8, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let pool = MemoryPool::new(NodeId::new(0));
        let mem = pool.create_memory(MemoryKind::System, 16);
        let store = pool.get(mem).unwrap();
        assert!(matches!(store.read(8, 16), Err(TransferError::OutOfBounds { .. })));
    }
}
