use core::fmt;

use crate::utils::{
    ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable,
};

// ID NEWTYPES
// ================================================================================================

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $repr:ty) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($repr);

        impl $name {
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            pub const fn as_raw(&self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serializable for $name {
            fn write_into<W: ByteWriter>(&self, target: &mut W) {
                self.0.write_into(target);
            }
        }

        impl Deserializable for $name {
            fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
                Ok(Self(<$repr>::read_from(source)?))
            }
        }
    };
}

define_id!(
    /// Identifies a node (address space) in the machine.
    NodeId,
    u16
);

define_id!(
    /// Monotonically assigned identifier for an operation; unique within a
    /// running program.
    UniqueId,
    u64
);

define_id!(
    /// Identifies an inner task context.
    ContextId,
    u32
);

define_id!(
    /// Identifies one shard of a control-replicated task, in `0..total_shards`.
    ShardId,
    u32
);

define_id!(
    /// Identifies a control-replicated task launch across all of its shards.
    ReplicationId,
    u64
);

define_id!(
    /// Identifies one collective site within a replicated context. Allocated
    /// from a per-context sequence so that all shards agree on the id.
    CollectiveId,
    u64
);

define_id!(
    /// Identifies a dependence trace within a context.
    TraceId,
    u32
);

define_id!(
    /// Identifies a registered sharding functor.
    ShardingId,
    u32
);

define_id!(
    /// Identifies a mapper.
    MapperId,
    u32
);

define_id!(
    /// Identifies a projection functor in a region requirement.
    ProjectionId,
    u32
);

define_id!(
    /// Identifies a reduction operator.
    ReductionOpId,
    u32
);

define_id!(
    /// Identifies a field within a field space.
    FieldId,
    u32
);

define_id!(
    /// Identifies a task variant registered with the runtime.
    TaskId,
    u32
);

define_id!(
    /// Identifier for a distributed object (physical manager, view) that is
    /// stable across nodes.
    DistributedId,
    u64
);

impl ShardId {
    /// Sentinel used before a sharding function has selected an owner.
    pub const INVALID: ShardId = ShardId(u32::MAX);
}

impl ShardingId {
    /// Sentinel returned by a mapper that failed to pick a functor.
    pub const INVALID: ShardingId = ShardingId(u32::MAX);
}

// TRANSFER DESCRIPTOR ID
// ================================================================================================

/// Identifies a transfer descriptor. The high [`XferDesId::NODE_BITS`] bits
/// carry the launch node so that any node can route messages about the
/// descriptor back to the node executing it; the low
/// [`XferDesId::INDEX_BITS`] bits are a per-node sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct XferDesId(u64);

impl XferDesId {
    /// Number of high bits holding the executing node.
    pub const NODE_BITS: u32 = 16;
    /// Number of low bits holding the per-node index.
    pub const INDEX_BITS: u32 = 48;

    /// The "no descriptor" sentinel, used for the missing predecessor or
    /// successor at either end of a transfer chain.
    pub const NO_GUID: XferDesId = XferDesId(0);

    /// Composes an id from an executing node and a per-node index.
    pub const fn new(node: NodeId, index: u64) -> Self {
        debug_assert!(index < (1 << Self::INDEX_BITS));
        Self(((node.as_raw() as u64) << Self::INDEX_BITS) | index)
    }

    /// Returns the node on which this descriptor executes.
    pub const fn node(&self) -> NodeId {
        NodeId::new((self.0 >> Self::INDEX_BITS) as u16)
    }

    /// Returns the per-node index of this descriptor.
    pub const fn index(&self) -> u64 {
        self.0 & ((1 << Self::INDEX_BITS) - 1)
    }

    /// Returns true if this is the [`XferDesId::NO_GUID`] sentinel.
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if this is a real descriptor id.
    pub const fn exists(&self) -> bool {
        self.0 != 0
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for XferDesId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for XferDesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xd({}:{})", self.node(), self.index())
    }
}

impl Serializable for XferDesId {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.0);
    }
}

impl Deserializable for XferDesId {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self(source.read_u64()?))
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xferdes_id_round_trips_node_and_index() {
        let id = XferDesId::new(NodeId::new(7), 12345);
        assert_eq!(id.node(), NodeId::new(7));
        assert_eq!(id.index(), 12345);
        assert!(id.exists());
    }

    #[test]
    fn no_guid_is_none() {
        assert!(XferDesId::NO_GUID.is_none());
        assert!(!XferDesId::NO_GUID.exists());
    }
}
