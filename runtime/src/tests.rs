use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use pretty_assertions::assert_eq;
use tessera_core::{
    CoherenceMode, Event, FieldId, FieldMask, LogicalRegion, NodeId, PrivilegeMode,
    RegionRequirement, TraceId, UserEvent,
};

use crate::{
    ContextConfig, InMemoryForest, LocalCluster, OpStatus, Runtime, RuntimeConfig,
    RuntimeError, TaskContext,
    operation::{ArcOp, launch_operation},
    ops::{
        CopyOp, CopyPayload, DeletionOp, DeletionTarget, FenceKind, FenceOp, FillOp,
        IndexTaskOp, TaskOp, TimingKind, TimingOp, begin_trace, end_trace,
    },
};

// HARNESS
// ================================================================================================

struct TestNode {
    cluster: LocalCluster,
    rt: Arc<Runtime>,
    forest: Arc<InMemoryForest>,
}

impl TestNode {
    fn new() -> Self {
        Self::with_config(RuntimeConfig::new())
    }

    fn with_config(config: RuntimeConfig) -> Self {
        let cluster = LocalCluster::new(1);
        let node = NodeId::new(0);
        let forest = Arc::new(InMemoryForest::new());
        let rt = Runtime::new(
            node,
            cluster.endpoint(node),
            forest.clone(),
            cluster.barrier_space(),
            config,
        );
        cluster.register_node(node, rt.clone());
        Self { cluster, rt, forest }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.rt.shutdown();
        self.cluster.shutdown();
    }
}

fn region(tree: u32, space: u64) -> LogicalRegion {
    LogicalRegion::new(tree, space, 1)
}

fn write_req(r: LogicalRegion) -> RegionRequirement {
    RegionRequirement::new(
        r,
        FieldMask::from_field(FieldId::new(0)),
        PrivilegeMode::ReadWrite,
        CoherenceMode::Exclusive,
    )
}

fn read_req(r: LogicalRegion) -> RegionRequirement {
    RegionRequirement::new(
        r,
        FieldMask::from_field(FieldId::new(0)),
        PrivilegeMode::ReadOnly,
        CoherenceMode::Exclusive,
    )
}

/// Launches a fill whose mapping is gated on an external event, keeping it
/// outstanding until the gate triggers.
fn gated_fill(
    node: &TestNode,
    ctx: &Arc<dyn TaskContext>,
    req: RegionRequirement,
    gate: Event,
) -> ArcOp {
    let op: ArcOp = Arc::new(FillOp::new(
        &node.rt,
        ctx.context_id(),
        vec![req],
        vec![0u8; 4],
    ));
    op.core().add_mapping_precondition(gate);
    launch_operation(&node.rt, op.clone(), Event::NO_EVENT).unwrap();
    op
}

// CHILD BOOKKEEPING
// ================================================================================================

#[test]
fn children_progress_through_lifecycle() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    let op = FillOp::launch(&node.rt, ctx.context_id(), vec![write_req(region(1, 1))], vec![1])
        .unwrap();
    // the pipeline for an ungated fill runs to commit synchronously
    assert_eq!(op.core().status(), OpStatus::Committed);
    assert!(op.core().mapped_event().has_triggered());
    assert!(op.core().completion_event().has_triggered());
    assert!(op.core().committed_event().has_triggered());

    assert_eq!(ctx.total_children(), 1);
    assert_eq!(ctx.committed_children(), 1);
    assert_eq!(ctx.children_counts(), (0, 0, 0));
}

#[test]
fn children_sets_balance_against_totals() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let ops: Vec<ArcOp> = (0..4)
        .map(|_| gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event()))
        .collect();

    // all four are registered but held before mapping
    let (executing, executed, complete) = ctx.children_counts();
    assert_eq!(
        (executing + executed + complete) as u64,
        ctx.total_children() - ctx.committed_children()
    );
    assert_eq!(executing, 4);

    gate.trigger();
    for op in &ops {
        assert_eq!(op.core().status(), OpStatus::Committed);
    }
    let (executing, executed, complete) = ctx.children_counts();
    assert_eq!(
        (executing + executed + complete) as u64,
        ctx.total_children() - ctx.committed_children()
    );
    assert_eq!(ctx.committed_children(), 4);
}

#[test]
fn unregistered_child_releases_its_slot() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let held = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    assert_eq!(ctx.children_counts(), (1, 0, 0));

    ctx.unregister_child_operation(&held);
    assert_eq!(held.core().status(), OpStatus::Gone);
    assert_eq!(ctx.children_counts(), (0, 0, 0));

    // the cancelled child's pipeline may still drain without disturbing
    // the context's bookkeeping
    gate.trigger();
    assert_eq!(ctx.children_counts(), (0, 0, 0));
}

#[test]
fn window_admission_blocks_until_children_drain() {
    let mut config = RuntimeConfig::new();
    config.context = ContextConfig {
        max_window_size: 2,
        hysteresis_percentage: 50,
        ..ContextConfig::default()
    };
    let node = TestNode::with_config(config);
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let _held_a = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let _held_b = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());

    // the third registration must block until the window reopens
    let rt = node.rt.clone();
    let ctx_id = ctx.context_id();
    let (done_tx, done_rx) = mpsc::channel();
    let blocked = thread::spawn(move || {
        FillOp::launch(&rt, ctx_id, vec![write_req(region(1, 1))], vec![2]).unwrap();
        done_tx.send(()).unwrap();
    });

    assert!(
        done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "registration should block while the window is full"
    );

    gate.trigger();
    done_rx.recv_timeout(Duration::from_secs(10)).expect("window never reopened");
    blocked.join().unwrap();
    assert_eq!(ctx.committed_children(), 3);
}

// DEPENDENCE ANALYSIS
// ================================================================================================

#[test]
fn overlapping_writes_create_true_dependence() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let writer = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let reader = FillOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], vec![0])
        .unwrap();

    let edges = reader.core().dependences();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target, writer.core().unique_id());
    assert_eq!(edges[0].dtype, tessera_core::DependenceType::TrueDependence);

    // the reader cannot map before the writer does
    assert!(!reader.core().mapped_event().has_triggered());
    gate.trigger();
    assert!(reader.core().mapped_event().has_triggered());
    assert_eq!(reader.core().status(), OpStatus::Committed);
}

#[test]
fn disjoint_regions_do_not_depend() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let _writer = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let other = FillOp::launch(&node.rt, ctx.context_id(), vec![write_req(region(1, 2))], vec![0])
        .unwrap();

    assert!(other.core().dependences().is_empty());
    assert_eq!(other.core().status(), OpStatus::Committed);
    gate.trigger();
}

#[test]
fn subregion_writes_depend_through_ancestry() {
    let node = TestNode::new();
    node.forest.declare_index_space(1, None, None);
    node.forest.declare_index_space(2, Some(1), None);
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let parent_writer = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let child_writer =
        FillOp::launch(&node.rt, ctx.context_id(), vec![write_req(region(1, 2))], vec![0])
            .unwrap();

    let edges = child_writer.core().dependences();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target, parent_writer.core().unique_id());
    gate.trigger();
}

#[test]
fn fence_orders_children_on_both_sides() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let before = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let fence = FenceOp::launch(&node.rt, ctx.context_id(), FenceKind::Mapping).unwrap();

    // the fence depends on the still-executing child
    let fence_edges = fence.core().dependences();
    assert!(fence_edges.iter().any(|edge| edge.target == before.core().unique_id()));
    assert!(!fence.core().mapped_event().has_triggered());

    // a later child depends only on the fence, not on `before`
    let after = FillOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], vec![0])
        .unwrap();
    let after_edges = after.core().dependences();
    assert_eq!(after_edges.len(), 1);
    assert_eq!(after_edges[0].target, fence.core().unique_id());

    gate.trigger();
    assert_eq!(after.core().status(), OpStatus::Committed);
}

#[test]
fn poisoned_gate_fails_the_operation_at_commit() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let op = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    gate.poison();

    assert_eq!(op.core().status(), OpStatus::Committed);
    assert!(op.core().is_poisoned());
    assert!(op.core().completion_event().is_poisoned());
    // poison propagated through the mapped event to would-be dependents
    assert!(op.core().mapped_event().is_poisoned());
}

// TASKS AND CONTEXT TREES
// ================================================================================================

#[test]
fn task_completes_after_its_children() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let (gate_tx, gate_rx) = mpsc::channel::<UserEvent>();

    let task = TaskOp::launch(&node.rt, ctx.context_id(), "parent_task", Vec::new(), false, {
        move |rt, child_ctx| {
            let gate = UserEvent::new();
            let op: ArcOp = Arc::new(FillOp::new(
                rt,
                child_ctx.context_id(),
                vec![write_req(region(1, 1))],
                vec![3],
            ));
            op.core().add_mapping_precondition(gate.event());
            launch_operation(rt, op, Event::NO_EVENT).unwrap();
            gate_tx.send(gate).unwrap();
        }
    })
    .unwrap();

    let gate = gate_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // the body has returned, but the gated child holds completion open
    assert_eq!(task.core().status(), OpStatus::Executed);
    assert!(!task.core().completion_event().has_triggered());

    gate.trigger();
    assert_eq!(task.core().status(), OpStatus::Committed);
    assert!(task.core().completion_event().has_triggered());
}

#[test]
fn privilege_outside_parent_region_is_rejected() {
    let node = TestNode::new();
    node.forest.declare_index_space(1, None, None);
    node.forest.declare_index_space(2, Some(1), None);
    let ctx = node.rt.create_top_level_context("main");

    // privileges rooted at a region that is not an ancestor of the target
    let mut req = write_req(region(1, 1));
    req.parent = region(1, 2);
    let result = FillOp::launch(&node.rt, ctx.context_id(), vec![req], vec![0]);
    assert!(matches!(
        result,
        Err(RuntimeError::PrivilegeViolation { index: 0, .. })
    ));
    // the rejected operation never registered
    assert_eq!(ctx.total_children(), 0);

    // rooting at a real ancestor is accepted
    let mut req = write_req(region(1, 2));
    req.parent = region(1, 1);
    FillOp::launch(&node.rt, ctx.context_id(), vec![req], vec![0]).unwrap();
}

#[test]
fn leaf_context_refuses_children() {
    let node = TestNode::new();
    let leaf = node.rt.create_leaf_context(
        node.rt.allocate_unique_id(),
        "leaf_task".to_string(),
        1,
        None,
    );
    let result = FillOp::launch(&node.rt, leaf.context_id(), Vec::new(), vec![0]);
    assert!(matches!(result, Err(RuntimeError::LeafContextViolation { .. })));
}

#[test]
fn local_fields_are_visible_down_the_parent_chain() {
    let node = TestNode::new();
    let top = node.rt.create_top_level_context("main");
    top.add_local_field(1, FieldId::new(3), 8, 0).unwrap();

    let inner = node.rt.create_inner_context(
        node.rt.allocate_unique_id(),
        "inner".to_string(),
        1,
        Some(top.context_id()),
    );
    inner.add_local_field(1, FieldId::new(4), 16, 0).unwrap();

    let mut fields = Vec::new();
    inner.find_enclosing_local_fields(&mut fields);
    let fids: Vec<u32> = fields.iter().map(|f| f.fid.as_raw()).collect();
    assert_eq!(fids, vec![3, 4], "outermost fields come first");
}

#[test]
fn inline_mapping_conflicts_are_detected() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    ctx.register_inline_mapping(write_req(region(1, 1)));
    let conflict = ctx.has_conflicting_regions(&[read_req(region(1, 2)), read_req(region(1, 1))]);
    assert_eq!(conflict, Some((1, false)));

    // read-read does not conflict
    ctx.register_inline_mapping(read_req(region(1, 5)));
    assert!(ctx.has_conflicting_regions(&[read_req(region(1, 5))]).is_none());

    ctx.unregister_inline_mapping(region(1, 1));
    assert!(ctx.has_conflicting_regions(&[read_req(region(1, 1))]).is_none());
}

// TRACES
// ================================================================================================

#[test]
fn trace_replay_reproduces_recorded_edges() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let tid = TraceId::new(7);

    // capture: writer -> reader with one true dependence
    begin_trace(&node.rt, ctx.context_id(), tid).unwrap();
    let gate = UserEvent::new();
    let writer = gated_fill(&node, &ctx, write_req(region(1, 1)), gate.event());
    let reader = FillOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], vec![0])
        .unwrap();
    assert_eq!(reader.core().dependences().len(), 1);
    end_trace(&node.rt, ctx.context_id(), tid).unwrap();
    gate.trigger();

    let trace = ctx.find_trace(tid).unwrap();
    assert!(trace.is_fixed());
    assert!(!trace.is_tracing());
    assert_eq!(trace.recorded_len(), 2);

    // replay the same shape; edges come from the recording
    begin_trace(&node.rt, ctx.context_id(), tid).unwrap();
    let writer2 =
        FillOp::launch(&node.rt, ctx.context_id(), vec![write_req(region(1, 1))], vec![1])
            .unwrap();
    let reader2 =
        FillOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], vec![0])
            .unwrap();
    end_trace(&node.rt, ctx.context_id(), tid).unwrap();

    let edges = reader2.core().dependences();
    assert_eq!(edges.len(), 1, "replay issues exactly the recorded edges");
    assert_eq!(edges[0].target, writer2.core().unique_id());
    assert_eq!(edges[0].dtype, tessera_core::DependenceType::TrueDependence);
    // a second writer generation must not alias the first
    assert_ne!(writer2.core().unique_id(), writer.core().unique_id());
}

#[test]
#[should_panic(expected = "trace violation")]
fn trace_replay_with_wrong_kind_is_fatal() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let tid = TraceId::new(9);

    // capture [copy, task, copy]
    begin_trace(&node.rt, ctx.context_id(), tid).unwrap();
    CopyOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], None).unwrap();
    TaskOp::launch(&node.rt, ctx.context_id(), "traced_task", vec![write_req(region(1, 1))],
        false, |_, _| {})
    .unwrap();
    CopyOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], None).unwrap();
    end_trace(&node.rt, ctx.context_id(), tid).unwrap();

    // replay [copy, fill, copy]: index 1 has the wrong kind
    begin_trace(&node.rt, ctx.context_id(), tid).unwrap();
    CopyOp::launch(&node.rt, ctx.context_id(), vec![read_req(region(1, 1))], None).unwrap();
    let _ = FillOp::launch(&node.rt, ctx.context_id(), vec![write_req(region(1, 1))], vec![0]);
}

#[test]
fn begin_trace_twice_is_an_error() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    begin_trace(&node.rt, ctx.context_id(), TraceId::new(1)).unwrap();
    let err = begin_trace(&node.rt, ctx.context_id(), TraceId::new(2));
    assert!(matches!(err, Err(RuntimeError::NestedTrace { .. })));
}

// COPIES, DELETIONS, TIMING
// ================================================================================================

#[test]
fn copy_op_moves_bytes_through_the_dma_pipeline() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    let src = node.rt.create_system_memory(4096);
    let dst = node.rt.create_system_memory(4096);
    node.rt.pool().get(src).unwrap().write(0, &[0x5a; 4096]).unwrap();

    let copy = CopyOp::launch(
        &node.rt,
        ctx.context_id(),
        vec![read_req(region(1, 1)), write_req(region(1, 2))],
        Some(CopyPayload {
            src_mem: src,
            dst_mem: dst,
            src_iter: tessera_transfer::IteratorDesc::Linear { base: 0, total: 4096 },
            dst_iter: tessera_transfer::IteratorDesc::Linear { base: 0, total: 4096 },
            kind: tessera_transfer::XferKind::MemCpy,
        }),
    )
    .unwrap();

    assert!(!copy.core().completion_event().wait());
    assert_eq!(node.rt.pool().get(dst).unwrap().read(0, 4096).unwrap(), vec![0x5a; 4096]);
}

#[test]
fn deletion_op_mutates_the_forest() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    let target = region(1, 42);
    DeletionOp::launch(&node.rt, ctx.context_id(), DeletionTarget::Region(target)).unwrap();
    assert_eq!(node.forest.destroyed_regions(), vec![target]);

    DeletionOp::launch(
        &node.rt,
        ctx.context_id(),
        DeletionTarget::Fields {
            field_space: 1,
            fields: FieldMask::from_field(FieldId::new(2)),
        },
    )
    .unwrap();
    assert_eq!(node.forest.freed_fields().len(), 1);
}

#[test]
fn timing_op_waits_for_preconditions() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let gate = UserEvent::new();

    let timing =
        TimingOp::launch(&node.rt, ctx.context_id(), TimingKind::MicroSeconds, vec![gate.event()])
            .unwrap();
    assert!(timing.result().is_none());
    gate.trigger();
    assert!(timing.result().is_some());
}

#[test]
fn index_task_builds_a_future_map() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");
    let domain = tessera_core::Domain::new_1d(0, 7);

    let task = IndexTaskOp::launch(
        &node.rt,
        ctx.context_id(),
        "square_points",
        Vec::new(),
        domain,
        Arc::new(|point| {
            let x = point.coord(0);
            (x * x).to_le_bytes().to_vec()
        }),
    )
    .unwrap();

    let map = task.future_map();
    assert_eq!(map.len(), 8);
    assert_eq!(map[&3], 9i64.to_le_bytes().to_vec());
}

// CONTEXT VARIANTS AND FRAMES
// ================================================================================================

#[test]
fn inline_context_redirects_to_enclosing() {
    let node = TestNode::new();
    let top = node.rt.create_top_level_context("main");
    top.add_local_field(1, FieldId::new(9), 4, 0).unwrap();

    let inline = crate::InlineContext::new(
        top.clone(),
        node.rt.allocate_unique_id(),
        "inlined_task".to_string(),
    );
    assert_eq!(inline.context_id(), top.context_id());
    assert_eq!(inline.task_name(), "inlined_task");

    // children registered through the inline context land in the enclosing
    // context
    let op = FillOp::launch(&node.rt, inline.context_id(), Vec::new(), vec![0]).unwrap();
    assert_eq!(op.core().status(), OpStatus::Committed);
    assert_eq!(top.total_children(), 1);

    let mut fields = Vec::new();
    inline.find_enclosing_local_fields(&mut fields);
    assert_eq!(fields.len(), 1);
}

#[test]
fn remote_context_snapshot_carries_local_fields() {
    let node = TestNode::new();
    let top = node.rt.create_top_level_context("main");
    top.add_local_field(2, FieldId::new(1), 8, 3).unwrap();
    top.add_local_field(2, FieldId::new(2), 16, 0).unwrap();

    use tessera_core::utils::{Deserializable, Serializable};
    let snapshot = crate::RemoteContextSnapshot::capture(top.as_ref(), NodeId::new(0));
    let bytes = snapshot.to_bytes();
    let shipped = crate::RemoteContextSnapshot::read_from_bytes(&bytes).unwrap();
    assert_eq!(shipped.task_name, "main");
    assert_eq!(shipped.enclosing_fields.len(), 2);

    let remote = node.rt.create_remote_context(shipped);
    let mut fields = Vec::new();
    remote.find_enclosing_local_fields(&mut fields);
    let fids: Vec<u32> = fields.iter().map(|f| f.fid.as_raw()).collect();
    assert_eq!(fids, vec![1, 2]);

    // remote contexts accept children like any inner context
    let op = FillOp::launch(&node.rt, remote.context_id(), Vec::new(), vec![0]).unwrap();
    assert_eq!(op.core().status(), OpStatus::Committed);
}

#[test]
fn frame_op_opens_and_closes_a_frame() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    let frame = crate::ops::FrameOp::launch(&node.rt, ctx.context_id()).unwrap();
    assert_eq!(frame.core().status(), OpStatus::Committed);
    // the frame released its admission slot on completion
    let frame2 = crate::ops::FrameOp::launch(&node.rt, ctx.context_id()).unwrap();
    assert_eq!(frame2.core().status(), OpStatus::Committed);
}

// CONTEXT ACTIVATION
// ================================================================================================

#[test]
fn pending_subtasks_keep_the_context_active() {
    let node = TestNode::new();
    let ctx = node.rt.create_top_level_context("main");

    assert!(!ctx.is_active_context());
    ctx.increment_outstanding();
    assert!(ctx.is_active_context());
    ctx.increment_pending();
    ctx.decrement_outstanding();
    // a transiently idle parent stays active while a child is still
    // materializing its own work
    assert!(ctx.is_active_context());
    ctx.decrement_pending();
    ctx.increment_outstanding();
    ctx.decrement_outstanding();
    assert!(!ctx.is_active_context());
}
