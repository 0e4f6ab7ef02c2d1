use tessera_core::{
    BarrierToken, CollectiveId, DistributedId, NodeId, ReplicationId, ShardId, TaskId,
    utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, read_blob,
        write_blob,
    },
};

// REPLICATE LAUNCH
// ================================================================================================

/// Ships one node's constituent shards of a control-replicated launch: the
/// full address-space map, the per-phase barriers, and the shard ids this
/// node will run. The task body is resolved locally through the task
/// registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicateLaunchMessage {
    pub repl_id: ReplicationId,
    pub task_id: TaskId,
    pub total_shards: u32,
    pub control_replicated: bool,
    pub top_level: bool,
    pub startup_barrier: BarrierToken,
    pub address_space_mapping: Vec<NodeId>,
    pub pending_partition_barrier: BarrierToken,
    pub future_map_barrier: BarrierToken,
    pub creation_barrier: BarrierToken,
    pub deletion_barrier: BarrierToken,
    pub shard_mapping: Vec<u64>,
    pub shards: Vec<ShardId>,
}

impl Serializable for ReplicateLaunchMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.task_id.write_into(target);
        target.write_u32(self.total_shards);
        target.write_bool(self.control_replicated);
        target.write_bool(self.top_level);
        self.startup_barrier.write_into(target);
        target.write_u32(self.address_space_mapping.len() as u32);
        for node in &self.address_space_mapping {
            node.write_into(target);
        }
        self.pending_partition_barrier.write_into(target);
        self.future_map_barrier.write_into(target);
        self.creation_barrier.write_into(target);
        self.deletion_barrier.write_into(target);
        target.write_u32(self.shard_mapping.len() as u32);
        for proc in &self.shard_mapping {
            target.write_u64(*proc);
        }
        target.write_u32(self.shards.len() as u32);
        for shard in &self.shards {
            shard.write_into(target);
        }
    }
}

impl Deserializable for ReplicateLaunchMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let repl_id = ReplicationId::read_from(source)?;
        let task_id = TaskId::read_from(source)?;
        let total_shards = source.read_u32()?;
        let control_replicated = source.read_bool()?;
        let top_level = source.read_bool()?;
        let startup_barrier = BarrierToken::read_from(source)?;
        let map_len = source.read_u32()? as usize;
        let mut address_space_mapping = Vec::with_capacity(map_len);
        for _ in 0..map_len {
            address_space_mapping.push(NodeId::read_from(source)?);
        }
        let pending_partition_barrier = BarrierToken::read_from(source)?;
        let future_map_barrier = BarrierToken::read_from(source)?;
        let creation_barrier = BarrierToken::read_from(source)?;
        let deletion_barrier = BarrierToken::read_from(source)?;
        let proc_len = source.read_u32()? as usize;
        let mut shard_mapping = Vec::with_capacity(proc_len);
        for _ in 0..proc_len {
            shard_mapping.push(source.read_u64()?);
        }
        let shard_len = source.read_u32()? as usize;
        let mut shards = Vec::with_capacity(shard_len);
        for _ in 0..shard_len {
            shards.push(ShardId::read_from(source)?);
        }
        Ok(Self {
            repl_id,
            task_id,
            total_shards,
            control_replicated,
            top_level,
            startup_barrier,
            address_space_mapping,
            pending_partition_barrier,
            future_map_barrier,
            creation_barrier,
            deletion_barrier,
            shard_mapping,
            shards,
        })
    }
}

// LIFECYCLE NOTICES
// ================================================================================================

macro_rules! repl_id_message {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            pub repl_id: ReplicationId,
        }

        impl Serializable for $name {
            fn write_into<W: ByteWriter>(&self, target: &mut W) {
                self.repl_id.write_into(target);
            }
        }

        impl Deserializable for $name {
            fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
                Ok(Self { repl_id: ReplicationId::read_from(source)? })
            }
        }
    };
}

repl_id_message!(
    /// Tears down a remote constituent of a replicated launch.
    ReplicateDeleteMessage
);
repl_id_message!(
    /// A remote node's shards have all mapped.
    ReplicatePostMappedMessage
);
repl_id_message!(
    /// A remote node's shards have all completed.
    ReplicateTriggerCompleteMessage
);
repl_id_message!(
    /// A remote node's shards have all committed.
    ReplicateTriggerCommitMessage
);

// COLLECTIVE MESSAGE
// ================================================================================================

/// One hop of a shard collective, routed by the shard manager of `repl_id`
/// to the collective registered under `collective_id` on `target_shard`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectiveMessage {
    pub repl_id: ReplicationId,
    pub target_shard: ShardId,
    pub collective_id: CollectiveId,
    pub payload: Vec<u8>,
}

impl Serializable for CollectiveMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.target_shard.write_into(target);
        self.collective_id.write_into(target);
        write_blob(target, &self.payload);
    }
}

impl Deserializable for CollectiveMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            target_shard: ShardId::read_from(source)?,
            collective_id: CollectiveId::read_from(source)?,
            payload: read_blob(source)?,
        })
    }
}

// VIEW AND FUTURE-MAP REQUESTS
// ================================================================================================

/// Requests a shard's future map; the reply arrives as a collective message
/// to `reply_collective` on `reply_shard`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FutureMapRequestMessage {
    pub repl_id: ReplicationId,
    pub target_shard: ShardId,
    pub reply_shard: ShardId,
    pub reply_collective: CollectiveId,
}

impl Serializable for FutureMapRequestMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.target_shard.write_into(target);
        self.reply_shard.write_into(target);
        self.reply_collective.write_into(target);
    }
}

impl Deserializable for FutureMapRequestMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            target_shard: ShardId::read_from(source)?,
            reply_shard: ShardId::read_from(source)?,
            reply_collective: CollectiveId::read_from(source)?,
        })
    }
}

/// Requests materialization of a composite view on the shard that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompositeViewRequestMessage {
    pub repl_id: ReplicationId,
    pub target_shard: ShardId,
    pub view_did: DistributedId,
}

impl Serializable for CompositeViewRequestMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.target_shard.write_into(target);
        self.view_did.write_into(target);
    }
}

impl Deserializable for CompositeViewRequestMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            target_shard: ShardId::read_from(source)?,
            view_did: DistributedId::read_from(source)?,
        })
    }
}

/// Asks the node owning a physical manager for its instance top view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopViewRequestMessage {
    pub repl_id: ReplicationId,
    pub manager_did: DistributedId,
    pub request_node: NodeId,
}

impl Serializable for TopViewRequestMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.manager_did.write_into(target);
        self.request_node.write_into(target);
    }
}

impl Deserializable for TopViewRequestMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            manager_did: DistributedId::read_from(source)?,
            request_node: NodeId::read_from(source)?,
        })
    }
}

/// The created top view for a previously requested physical manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopViewResponseMessage {
    pub repl_id: ReplicationId,
    pub manager_did: DistributedId,
    pub view_did: DistributedId,
}

impl Serializable for TopViewResponseMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        self.manager_did.write_into(target);
        self.view_did.write_into(target);
    }
}

impl Deserializable for TopViewResponseMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            manager_did: DistributedId::read_from(source)?,
            view_did: DistributedId::read_from(source)?,
        })
    }
}

/// Redistributes a freshly advanced barrier for a close site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneBarrierMessage {
    pub repl_id: ReplicationId,
    pub close_index: u32,
    pub barrier: BarrierToken,
}

impl Serializable for CloneBarrierMessage {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        self.repl_id.write_into(target);
        target.write_u32(self.close_index);
        self.barrier.write_into(target);
    }
}

impl Deserializable for CloneBarrierMessage {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            repl_id: ReplicationId::read_from(source)?,
            close_index: source.read_u32()?,
            barrier: BarrierToken::read_from(source)?,
        })
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_message_round_trips() {
        let msg = ReplicateLaunchMessage {
            repl_id: ReplicationId::new(11),
            task_id: TaskId::new(4),
            total_shards: 4,
            control_replicated: true,
            top_level: false,
            startup_barrier: BarrierToken { id: 1, r#gen: 0 },
            address_space_mapping: vec![NodeId::new(0), NodeId::new(0), NodeId::new(1), NodeId::new(1)],
            pending_partition_barrier: BarrierToken { id: 2, r#gen: 0 },
            future_map_barrier: BarrierToken { id: 3, r#gen: 0 },
            creation_barrier: BarrierToken { id: 4, r#gen: 0 },
            deletion_barrier: BarrierToken { id: 5, r#gen: 0 },
            shard_mapping: vec![10, 11, 12, 13],
            shards: vec![ShardId::new(2), ShardId::new(3)],
        };
        assert_eq!(ReplicateLaunchMessage::read_from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn collective_message_round_trips() {
        let msg = CollectiveMessage {
            repl_id: ReplicationId::new(7),
            target_shard: ShardId::new(3),
            collective_id: CollectiveId::new(21),
            payload: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(CollectiveMessage::read_from_bytes(&msg.to_bytes()).unwrap(), msg);
    }
}
