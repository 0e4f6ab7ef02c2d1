use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tessera_core::{
    Domain, DomainPoint, Event, FieldId, MapperId, NodeId, RegionInstanceId, ShardId, TaskId,
};
use tessera_runtime::{
    DependentPartitionKind, FieldDescriptor, InMemoryForest, LocalCluster, MappableDesc, Mapper,
    MustEpochMapInput, MustEpochMapOutput, MustEpochShardingOutput, PendingPartitionKind,
    Runtime, RuntimeConfig, ops::TimingKind,
};

use crate::{
    BarrierExchange, FutureExchange, PartitionThunk, ReplDeletionOp, ReplDependentPartitionOp,
    ReplIndexTask, ReplIndividualTask, ReplMustEpochOp, ReplPendingPartitionOp, ReplTimingOp,
    ReplicationService, ShardContext, ShardManager, sum_i64_fold,
};
use tessera_runtime::ops::DeletionTarget;

// HARNESS
// ================================================================================================

struct ClusterNode {
    rt: Arc<Runtime>,
    service: Arc<ReplicationService>,
    forest: Arc<InMemoryForest>,
}

struct Cluster {
    cluster: LocalCluster,
    nodes: Vec<ClusterNode>,
}

impl Cluster {
    fn new(node_count: usize) -> Self {
        let cluster = LocalCluster::new(node_count);
        let mut nodes = Vec::new();
        for idx in 0..node_count {
            let node = NodeId::new(idx as u16);
            let forest = Arc::new(InMemoryForest::new());
            let rt = Runtime::new(
                node,
                cluster.endpoint(node),
                forest.clone(),
                cluster.barrier_space(),
                RuntimeConfig::new(),
            );
            let service = ReplicationService::install(&rt);
            cluster.register_node(node, rt.clone());
            nodes.push(ClusterNode { rt, service, forest });
        }
        Self { cluster, nodes }
    }

    fn register_task_everywhere(
        &self,
        task_id: TaskId,
        body: impl Fn(&Arc<Runtime>, &Arc<ShardContext>) + Send + Sync + Clone + 'static,
    ) {
        for node in &self.nodes {
            node.service.register_task(task_id, Arc::new(body.clone()));
        }
    }

    fn launch(&self, task_id: TaskId, shard_nodes: Vec<NodeId>) -> Arc<ShardManager> {
        let mapping = (0..shard_nodes.len() as u64).collect();
        self.nodes[0].service.launch_replicated(task_id, shard_nodes, mapping)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.rt.shutdown();
        }
        self.cluster.shutdown();
    }
}

fn wait_event(event: &Event) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !event.has_triggered() {
        assert!(Instant::now() < deadline, "replicated launch did not finish in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// INDEX TASKS
// ================================================================================================

#[test]
fn four_shard_index_task_owns_modulo_points() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(1);
    let launched: Arc<Mutex<Vec<Arc<ReplIndexTask>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let task = ReplIndexTask::launch(
            rt,
            shard,
            "square_points",
            Vec::new(),
            Domain::new_1d(0, 15),
            |point| {
                let x = point.coord(0);
                (x * x).to_le_bytes().to_vec()
            },
            None,
        )
        .unwrap();
        sink.lock().push(task);
    });

    // shards 0,1 on node 0; shards 2,3 on node 1
    let manager = cluster.launch(
        task_id,
        vec![NodeId::new(0), NodeId::new(0), NodeId::new(1), NodeId::new(1)],
    );
    wait_event(&manager.commit_event());

    let tasks = launched.lock();
    assert_eq!(tasks.len(), 4);

    // each shard owns exactly the points congruent to its id mod 4
    for task in tasks.iter() {
        let shard = task.owned_points();
        assert_eq!(shard.len(), 4);
    }
    let mut all_owned: Vec<i64> = tasks
        .iter()
        .flat_map(|task| task.owned_points())
        .map(|point| point.coord(0))
        .collect();
    all_owned.sort_unstable();
    assert_eq!(all_owned, (0..16).collect::<Vec<i64>>());

    // the final future map is identical on every shard
    let reference = tasks[0].future_map();
    assert_eq!(reference.len(), 16);
    assert_eq!(reference[&5], 25i64.to_le_bytes().to_vec());
    for task in tasks.iter().skip(1) {
        assert_eq!(task.future_map(), reference);
    }
}

#[test]
fn index_task_reduction_folds_in_shard_order() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(2);
    let launched: Arc<Mutex<Vec<Arc<ReplIndexTask>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let task = ReplIndexTask::launch(
            rt,
            shard,
            "sum_squares",
            Vec::new(),
            Domain::new_1d(0, 7),
            |point| {
                let x = point.coord(0);
                (x * x).to_le_bytes().to_vec()
            },
            Some(sum_i64_fold()),
        )
        .unwrap();
        sink.lock().push(task);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let tasks = launched.lock();
    assert_eq!(tasks.len(), 2);
    let expected: i64 = (0..8).map(|x| x * x).sum();
    for task in tasks.iter() {
        let value = task.reduced_value().expect("reduction incomplete");
        // bitwise identical across shards
        assert_eq!(value, expected.to_le_bytes().to_vec());
    }
}

// INDIVIDUAL TASKS
// ================================================================================================

#[test]
fn individual_task_owner_broadcasts_future() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(3);
    let launched: Arc<Mutex<Vec<Arc<ReplIndividualTask>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let task = ReplIndividualTask::launch(
            rt,
            shard,
            "single_point",
            Vec::new(),
            DomainPoint::new_1d(3),
            Domain::new_1d(0, 15),
            || 0xfeedu64.to_le_bytes().to_vec(),
        )
        .unwrap();
        sink.lock().push(task);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let tasks = launched.lock();
    assert_eq!(tasks.len(), 2);
    for task in tasks.iter() {
        // point 3 mod 2 shards
        assert_eq!(task.owner_shard(), ShardId::new(1));
        assert_eq!(task.future(), Some(0xfeedu64.to_le_bytes().to_vec()));
    }
    // the manager latched the first future on the origin
    assert_eq!(manager.future(), Some(0xfeedu64.to_le_bytes().to_vec()));
}

// MUST EPOCH
// ================================================================================================

/// A mapper that maps must-epochs collectively with shard-dependent
/// weights, to exercise the deterministic tie-break.
struct TieBreakMapper;

impl Mapper for TieBreakMapper {
    fn name(&self) -> &'static str {
        "tie-break"
    }

    fn select_must_epoch_sharding_functor(&self, _op: &MappableDesc) -> MustEpochShardingOutput {
        MustEpochShardingOutput {
            chosen_functor: tessera_core::ShardingId::new(0),
            collective_map_must_epoch: true,
        }
    }

    fn map_must_epoch(&self, input: &MustEpochMapInput) -> MustEpochMapOutput {
        let shard = input.local_shard.as_raw();
        // constraint 0: shards 1 and 2 both claim weight 5; shard 0 stays
        // at weight 1. constraint 1: all shards tie at weight 0.
        let weight0 = if shard == 0 { 1 } else { 5 };
        MustEpochMapOutput {
            task_processors: (0..input.tasks.len() as u64).collect(),
            constraint_mappings: vec![100 + shard as u64, 200 + shard as u64],
            weights: vec![weight0, 0],
        }
    }
}

#[test]
fn must_epoch_tie_breaks_by_weight_then_shard() {
    let cluster = Cluster::new(2);
    for node in &cluster.nodes {
        node.rt.register_mapper(MapperId::new(0), Arc::new(TieBreakMapper));
    }
    let task_id = TaskId::new(4);
    let launched: Arc<Mutex<Vec<Arc<ReplMustEpochOp>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let op = ReplMustEpochOp::launch(
            rt,
            shard,
            vec!["epoch_a", "epoch_b", "epoch_c"],
            2,
            Domain::new_1d(0, 2),
            |point| point.coord(0).to_le_bytes().to_vec(),
        )
        .unwrap();
        sink.lock().push(op);
    });

    let manager =
        cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let ops = launched.lock();
    assert_eq!(ops.len(), 3);
    let reference = ops[0].constraint_mappings();

    // constraint 0: shards 1 and 2 tie at weight 5; the lower shard id wins
    assert_eq!(reference[&0].weight, 5);
    assert_eq!(reference[&0].origin_shard, 1);
    assert_eq!(reference[&0].mapping, 101);
    // constraint 1: full tie at weight 0 resolves to shard 0
    assert_eq!(reference[&1].origin_shard, 0);
    assert_eq!(reference[&1].mapping, 200);

    for op in ops.iter().skip(1) {
        assert_eq!(op.constraint_mappings(), reference);
        assert_eq!(op.point_owners(), ops[0].point_owners());
    }

    // every point is owned by exactly one shard, per the modulo functor
    let owners = ops[0].point_owners();
    assert_eq!(owners.len(), 3);
    for (point, owner) in owners {
        assert_eq!(point % 3, owner as u64);
    }
}

// DELETIONS AND TIMING
// ================================================================================================

#[test]
fn replicated_deletion_mutates_shard_zero_node_once() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(5);
    let target = tessera_core::LogicalRegion::new(1, 77, 1);

    cluster.register_task_everywhere(task_id, move |rt, shard| {
        ReplDeletionOp::launch(rt, shard, DeletionTarget::Region(target)).unwrap();
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    // the destructive mutation ran exactly once, on shard zero's node
    assert_eq!(cluster.nodes[0].forest.destroyed_regions(), vec![target]);
    assert!(cluster.nodes[1].forest.destroyed_regions().is_empty());
}

#[test]
fn replicated_timing_observes_one_measurement() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(6);
    let launched: Arc<Mutex<Vec<Arc<ReplTimingOp>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let op = ReplTimingOp::launch(rt, shard, TimingKind::NanoSeconds, Vec::new()).unwrap();
        sink.lock().push(op);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let ops = launched.lock();
    assert_eq!(ops.len(), 2);
    let reference = ops[0].result().expect("timing incomplete");
    // shard zero measured; every shard observes the same value
    assert_eq!(ops[1].result(), Some(reference));
}

// DEPENDENT PARTITIONS
// ================================================================================================

#[test]
fn by_field_partition_merges_descriptors_on_every_shard() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(7);
    let parent = tessera_core::LogicalRegion::new(1, 1, 1);

    cluster.register_task_everywhere(task_id, move |rt, shard| {
        // each shard contributes a descriptor only it knows about
        let descriptor = FieldDescriptor {
            instance: RegionInstanceId(100 + shard.shard_id().as_raw() as u64),
            field: FieldId::new(0),
        };
        ReplDependentPartitionOp::launch(
            rt,
            shard,
            PartitionThunk::ByField,
            parent,
            Domain::new_1d(0, 1),
            vec![descriptor],
        )
        .unwrap();
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    // every node invoked the primitive with the full merged descriptor set
    for node in &cluster.nodes {
        let partitions = node.forest.created_partitions();
        assert_eq!(partitions.len(), 1);
        let (kind, recorded_parent, descriptors) = &partitions[0];
        assert_eq!(*kind, DependentPartitionKind::ByField);
        assert_eq!(*recorded_parent, parent);
        let instances: Vec<u64> =
            descriptors.iter().map(|desc| desc.instance.0).collect();
        assert_eq!(instances, vec![100, 101]);
    }
}

#[test]
fn by_image_partition_computes_on_target_shard_only() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(8);
    let parent = tessera_core::LogicalRegion::new(1, 2, 1);

    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let descriptor = FieldDescriptor {
            instance: RegionInstanceId(300 + shard.shard_id().as_raw() as u64),
            field: FieldId::new(1),
        };
        ReplDependentPartitionOp::launch(
            rt,
            shard,
            PartitionThunk::ByImage { range: false },
            parent,
            Domain::new_1d(0, 1),
            vec![descriptor],
        )
        .unwrap();
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    // only the designated shard's node ran the partition primitive, with
    // the gathered descriptors
    let partitions = cluster.nodes[0].forest.created_partitions();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].0, DependentPartitionKind::ByImage);
    assert_eq!(partitions[0].2.len(), 2);
    assert!(cluster.nodes[1].forest.created_partitions().is_empty());
}

#[test]
fn pending_partition_slices_colors_without_collectives() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(14);
    let parent = tessera_core::LogicalRegion::new(1, 3, 1);
    let launched: Arc<Mutex<Vec<Arc<ReplPendingPartitionOp>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&launched);
    cluster.register_task_everywhere(task_id, move |rt, shard| {
        let op = ReplPendingPartitionOp::launch(
            rt,
            shard,
            PendingPartitionKind::Equal,
            parent,
            Domain::new_1d(0, 7),
        )
        .unwrap();
        sink.lock().push(op);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    // each shard computed exactly its round-robin slice, locally
    let ops = launched.lock();
    assert_eq!(ops.len(), 2);
    let mut all_colors: Vec<i64> = ops
        .iter()
        .flat_map(|op| op.owned_colors())
        .map(|color| color.coord(0))
        .collect();
    all_colors.sort_unstable();
    assert_eq!(all_colors, (0..8).collect::<Vec<i64>>());

    for (node_idx, node) in cluster.nodes.iter().enumerate() {
        let computed = node.forest.pending_partition_computations();
        assert_eq!(computed.len(), 1, "one slice per node's shard");
        let (kind, recorded_parent, colors) = &computed[0];
        assert_eq!(*kind, PendingPartitionKind::Equal);
        assert_eq!(*recorded_parent, parent);
        let coords: Vec<i64> = colors.iter().map(|color| color.coord(0)).collect();
        let expected: Vec<i64> =
            (0..8).filter(|color| (*color as usize) % 2 == node_idx).collect();
        assert_eq!(coords, expected);
    }
    // no descriptor exchange happened anywhere
    assert!(cluster.nodes[0].forest.created_partitions().is_empty());
    assert!(cluster.nodes[1].forest.created_partitions().is_empty());
}

// COLLECTIVE PRIMITIVES
// ================================================================================================

#[test]
fn single_shard_all_gather_completes_without_messages() {
    let cluster = Cluster::new(1);
    let task_id = TaskId::new(9);
    let observed = Arc::new(Mutex::new(false));

    let sink = Arc::clone(&observed);
    cluster.register_task_everywhere(task_id, move |_rt, shard| {
        let exchange = FutureExchange::new(shard, vec![1, 2, 3]);
        exchange.perform();
        // a lone shard completes immediately, no messages involved
        assert!(exchange.done_event().has_triggered());
        let folded = exchange.reduce_futures(|acc, item| acc.extend_from_slice(item));
        assert_eq!(folded, vec![1, 2, 3]);
        *sink.lock() = true;
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0)]);
    wait_event(&manager.commit_event());
    assert!(*observed.lock());
}

#[test]
fn barrier_exchange_publishes_identical_windows() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(10);
    let windows: Arc<Mutex<Vec<Vec<u64>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&windows);
    cluster.register_task_everywhere(task_id, move |_rt, shard| {
        let exchange = BarrierExchange::new(shard, 4);
        exchange.exchange_barriers_async();
        let barriers = exchange.wait_for_barrier_exchange();
        let tokens: Vec<u64> = barriers.iter().map(|bar| bar.token().id).collect();
        sink.lock().push(tokens);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let windows = windows.lock();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].len(), 4);
    assert_eq!(windows[0], windows[1], "all shards hold the same barrier window");
}

#[test]
fn cross_product_gathers_nonempty_partition_handles() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(12);
    let results: Arc<Mutex<Vec<Vec<u64>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&results);
    cluster.register_task_everywhere(task_id, move |_rt, shard| {
        // each shard knows only the non-empty partitions it produced
        let mut local = crate::PartitionHandleSet::default();
        local.handles.insert(500 + shard.shard_id().as_raw() as u64);
        let exchange: Arc<crate::CrossProductCollective> =
            crate::AllGather::new(shard, local);
        exchange.perform();
        let merged: Vec<u64> = exchange.wait_result().handles.into_iter().collect();
        sink.lock().push(merged);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    let results = results.lock();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], vec![500, 501]);
    assert_eq!(results[0], results[1]);
}

#[test]
fn shard_sync_tree_rendezvouses_all_shards() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(13);
    let arrived = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let counter = Arc::clone(&arrived);
    cluster.register_task_everywhere(task_id, move |_rt, shard| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let sync = crate::ShardSyncTree::new(shard);
        sync.synchronize();
        // nobody leaves the rendezvous until everyone has entered it
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    });

    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());
    assert_eq!(arrived.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn top_view_creation_hashes_across_local_shards() {
    let cluster = Cluster::new(1);
    let task_id = TaskId::new(15);

    cluster.register_task_everywhere(task_id, |_rt, _shard| {});
    // both shards on one node, so the did hash picks between them
    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(0)]);
    wait_event(&manager.commit_event());

    let shards = manager.local_shards();
    assert_eq!(shards.len(), 2);

    for _ in 0..4 {
        let did = cluster.nodes[0].rt.allocate_distributed_id();
        manager.create_instance_top_view(did, NodeId::new(0));
        let expected_shard = (did.as_raw() as usize) % shards.len();
        let view = manager.find_top_view(did).expect("top view not recorded");
        // the chosen shard materialized this view; the other did not
        assert!(
            shards[expected_shard]
                .created_top_views()
                .iter()
                .any(|(manager_did, view_did)| *manager_did == did && *view_did == view),
            "view not created through the hashed shard"
        );
        assert!(
            !shards[1 - expected_shard]
                .created_top_views()
                .iter()
                .any(|(manager_did, _)| *manager_did == did)
        );
    }
}

#[test]
fn top_view_requests_route_to_the_owning_node() {
    let cluster = Cluster::new(2);
    let task_id = TaskId::new(11);

    cluster.register_task_everywhere(task_id, |_rt, _shard| {});
    let manager = cluster.launch(task_id, vec![NodeId::new(0), NodeId::new(1)]);
    wait_event(&manager.commit_event());

    // a manager-owned id on node 0, requested from node 1's manager copy
    let remote_manager = cluster.nodes[1]
        .service
        .find_manager(manager.repl_id())
        .expect("remote constituent missing");
    let did = cluster.nodes[0].rt.allocate_distributed_id();
    let ready = remote_manager.top_view_ready(did);
    remote_manager.create_instance_top_view(did, NodeId::new(1));
    wait_event(&ready);

    let view = remote_manager.find_top_view(did).expect("top view not recorded");
    // the view id was minted on the owning node
    assert_eq!(NodeId::new((view.as_raw() >> 48) as u16), NodeId::new(0));
}
