use core::fmt;

use crate::{
    NodeId,
    utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable},
};

// MEMORY KIND
// ================================================================================================

/// The kind of a memory instance, which constrains the channels that can
/// reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryKind {
    /// Ordinary node-local system memory.
    System = 0,
    /// The node-shared global memory segment reachable by get/put.
    Global = 1,
    /// Registered (RDMA-capable) memory writable by remote-write.
    Registered = 2,
    /// Disk-backed memory.
    Disk = 3,
    /// File-backed memory.
    File = 4,
    /// GPU framebuffer memory.
    GpuFramebuffer = 5,
}

impl MemoryKind {
    fn from_u8(value: u8) -> Result<Self, DeserializationError> {
        match value {
            0 => Ok(Self::System),
            1 => Ok(Self::Global),
            2 => Ok(Self::Registered),
            3 => Ok(Self::Disk),
            4 => Ok(Self::File),
            5 => Ok(Self::GpuFramebuffer),
            other => Err(DeserializationError::InvalidValue(format!(
                "invalid memory kind {other}"
            ))),
        }
    }
}

// MEMORY HANDLE
// ================================================================================================

/// Names a memory instance: the node that owns it, its kind, and a
/// node-local index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle {
    pub owner: NodeId,
    pub kind: MemoryKind,
    pub index: u32,
}

impl MemoryHandle {
    pub fn new(owner: NodeId, kind: MemoryKind, index: u32) -> Self {
        Self { owner, kind, index }
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem({}:{:?}:{})", self.owner, self.kind, self.index)
    }
}

impl Serializable for MemoryHandle {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.owner.write_into(target);
        target.write_u8(self.kind as u8);
        target.write_u32(self.index);
    }
}

impl Deserializable for MemoryHandle {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let owner = NodeId::read_from(source)?;
        let kind = MemoryKind::from_u8(source.read_u8()?)?;
        let index = source.read_u32()?;
        Ok(Self { owner, kind, index })
    }
}

// REGION INSTANCE
// ================================================================================================

/// Names a physical region instance living in some memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionInstanceId(pub u64);

impl RegionInstanceId {
    pub const NO_INSTANCE: RegionInstanceId = RegionInstanceId(0);

    pub fn exists(&self) -> bool {
        self.0 != 0
    }
}

impl Serializable for RegionInstanceId {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.0);
    }
}

impl Deserializable for RegionInstanceId {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self(source.read_u64()?))
    }
}
