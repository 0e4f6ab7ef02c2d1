use std::collections::HashMap;

use parking_lot::Mutex;
use tessera_core::{ContextId, DependenceType, FieldMask, TraceId, UniqueId};
use tracing::{debug, trace};

use crate::{
    RuntimeError,
    operation::{ArcOp, OpKind},
};

// DEPENDENCE RECORD
// ================================================================================================

/// One memoized dependence edge: the index of the earlier operation in the
/// trace, the region requirement indexes on both sides (−1 for unqualified
/// dependences), the dependence type and the overlapping fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependenceRecord {
    pub operation_idx: usize,
    pub prev_idx: i32,
    pub next_idx: i32,
    pub validates: bool,
    pub dtype: DependenceType,
    pub dependent_mask: FieldMask,
}

impl DependenceRecord {
    fn unqualified(operation_idx: usize) -> Self {
        Self {
            operation_idx,
            prev_idx: -1,
            next_idx: -1,
            validates: false,
            dtype: DependenceType::TrueDependence,
            dependent_mask: FieldMask::EMPTY,
        }
    }
}

/// Region-requirement aliasing recorded for an operation so replays can
/// restore the same privilege paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasedChildren {
    pub req_index: usize,
    pub depth: u32,
    pub mask: FieldMask,
}

// OPERATION INFO
// ================================================================================================

/// Metadata recorded per traced operation, used to verify that a replay
/// issues the same sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OperationInfo {
    kind: OpKind,
    region_count: usize,
}

// TRACE
// ================================================================================================

type OpKey = (UniqueId, u64);

struct TraceState {
    tracing: bool,
    fixed: bool,
    /// Operations of the current pass, capture or replay.
    operations: Vec<(ArcOp, u64)>,
    op_map: HashMap<OpKey, usize>,
    /// Memoized dependences per operation index.
    dependences: Vec<Vec<DependenceRecord>>,
    /// Dependences of internal operations, attributed to their creator on
    /// replay.
    internal_dependences: HashMap<OpKey, Vec<DependenceRecord>>,
    op_info: Vec<OperationInfo>,
    aliased_children: HashMap<usize, Vec<AliasedChildren>>,
}

/// A replay cache of dependence edges across repeated operation sequences.
///
/// While `tracing` is true every registered operation appends itself and its
/// dependences; after the capture ends, re-registering the same sequence
/// replays the recorded edges instead of re-running dependence analysis. A
/// divergent replay (different kind or region count at any index) is a fatal
/// trace violation.
pub struct Trace {
    tid: TraceId,
    ctx: ContextId,
    task_name: String,
    owner_uid: UniqueId,
    state: Mutex<TraceState>,
}

impl Trace {
    pub fn new(tid: TraceId, ctx: ContextId, task_name: String, owner_uid: UniqueId) -> Self {
        Self {
            tid,
            ctx,
            task_name,
            owner_uid,
            state: Mutex::new(TraceState {
                tracing: true,
                fixed: false,
                operations: Vec::new(),
                op_map: HashMap::new(),
                dependences: Vec::new(),
                internal_dependences: HashMap::new(),
                op_info: Vec::new(),
                aliased_children: HashMap::new(),
            }),
        }
    }

    // PUBLIC ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    pub fn context_id(&self) -> ContextId {
        self.ctx
    }

    pub fn is_tracing(&self) -> bool {
        self.state.lock().tracing
    }

    pub fn is_fixed(&self) -> bool {
        self.state.lock().fixed
    }

    /// Number of operations recorded during capture.
    pub fn recorded_len(&self) -> usize {
        self.state.lock().dependences.len()
    }

    // PHASE TRANSITIONS
    // --------------------------------------------------------------------------------------------

    /// Pins the trace so later `end_trace` calls replay it.
    pub fn fix_trace(&self) {
        self.state.lock().fixed = true;
    }

    /// Ends the capture pass; subsequent registrations replay.
    pub fn end_trace_capture(&self) {
        let mut state = self.state.lock();
        debug!(target: "tessera::trace", tid = %self.tid, ops = state.operations.len(),
            "trace capture complete");
        state.tracing = false;
        state.operations.clear();
        state.op_map.clear();
    }

    /// Ends one replay pass and resets for the next.
    pub fn end_trace_execution(&self) {
        let mut state = self.state.lock();
        state.operations.clear();
        state.op_map.clear();
    }

    // REGISTRATION
    // --------------------------------------------------------------------------------------------

    /// Registers an operation with the trace.
    ///
    /// During capture this appends the operation and starts a fresh
    /// dependence vector. During replay it verifies the operation against
    /// the recording and materializes the memoized edges; a mismatch is a
    /// fatal trace violation.
    pub fn register_operation(&self, op: &ArcOp) -> Result<(), RuntimeError> {
        let r#gen = op.core().generation();
        let key = (op.core().unique_id(), r#gen);
        let mut state = self.state.lock();
        let index = state.operations.len();

        if state.tracing {
            if !op.is_internal_op() {
                state.operations.push((op.clone(), r#gen));
                state.op_map.insert(key, index);
                state.dependences.push(Vec::new());
                state.op_info.push(OperationInfo {
                    kind: op.kind(),
                    region_count: op.region_count(),
                });
            } else {
                state.internal_dependences.entry(key).or_default();
            }
            return Ok(());
        }

        // replay
        if !op.is_internal_op() {
            if index >= state.dependences.len() {
                return Err(RuntimeError::TraceLengthViolation {
                    tid: self.tid,
                    task: self.task_name.clone(),
                    uid: self.owner_uid,
                    recorded: state.dependences.len(),
                    issued: index + 1,
                });
            }
            let info = state.op_info[index];
            if info.kind != op.kind() {
                return Err(RuntimeError::TraceKindViolation {
                    tid: self.tid,
                    task: self.task_name.clone(),
                    uid: self.owner_uid,
                    index,
                    recorded: info.kind,
                    replayed: op.kind(),
                });
            }
            if info.region_count != op.region_count() {
                return Err(RuntimeError::TraceRegionCountViolation {
                    tid: self.tid,
                    task: self.task_name.clone(),
                    uid: self.owner_uid,
                    index,
                    recorded: info.region_count,
                    replayed: op.region_count(),
                });
            }

            state.operations.push((op.clone(), r#gen));
            state.op_map.insert(key, index);
            let records = state.dependences[index].clone();
            for record in &records {
                debug_assert!(record.operation_idx < state.operations.len());
                let (target, _tgen) = &state.operations[record.operation_idx];
                if record.prev_idx == -1 || record.next_idx == -1 {
                    op.core().register_dependence(target);
                } else {
                    op.core().register_region_dependence(
                        record.next_idx as usize,
                        target,
                        record.prev_idx as usize,
                        record.dtype,
                        record.dependent_mask,
                    );
                }
            }
            trace!(target: "tessera::trace", tid = %self.tid, index, edges = records.len(),
                "replayed dependences");
        } else {
            // internal operations replay the edges of their creator that
            // name their internal index
            debug_assert!(index > 0);
            let records = state.dependences[index - 1].clone();
            let internal_index = 0i32;
            for record in &records {
                if record.next_idx != internal_index {
                    continue;
                }
                let (target, _tgen) = &state.operations[record.operation_idx];
                op.core().register_dependence(target);
            }
        }
        Ok(())
    }

    // DEPENDENCE RECORDING
    // --------------------------------------------------------------------------------------------

    /// Records an unqualified dependence from `source` (the most recently
    /// registered operation) on `target`.
    pub fn record_dependence(&self, target: &ArcOp, source: &ArcOp) {
        let mut state = self.state.lock();
        debug_assert!(state.tracing);
        let target_key = (target.core().unique_id(), target.core().generation());
        let source_is_internal = source.is_internal_op();

        if let Some(&target_index) = state.op_map.get(&target_key) {
            if !source_is_internal {
                state
                    .dependences
                    .last_mut()
                    .expect("dependence recorded before any operation")
                    .push(DependenceRecord::unqualified(target_index));
            } else {
                let last = state.operations.last().map(|(op, r#gen)| (op.core().unique_id(), *r#gen));
                if last != Some(target_key) {
                    let source_key = (source.core().unique_id(), source.core().generation());
                    state
                        .internal_dependences
                        .entry(source_key)
                        .or_default()
                        .push(DependenceRecord::unqualified(target_index));
                }
            }
        } else if target.is_internal_op() {
            // dependences through an internal operation transfer to its
            // recorded antecedents
            let internal_key = (target.core().unique_id(), target.core().generation());
            let internal: Vec<DependenceRecord> = state
                .internal_dependences
                .get(&internal_key)
                .cloned()
                .unwrap_or_default();
            let target_deps =
                state.dependences.last_mut().expect("dependence recorded before any operation");
            for record in internal {
                target_deps.push(DependenceRecord::unqualified(record.operation_idx));
            }
        }
    }

    /// Records a region dependence from `source` on `target`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_region_dependence(
        &self,
        target: &ArcOp,
        source: &ArcOp,
        target_idx: usize,
        source_idx: usize,
        dtype: DependenceType,
        validates: bool,
        dep_mask: FieldMask,
    ) {
        let mut state = self.state.lock();
        debug_assert!(state.tracing);
        let target_key = (target.core().unique_id(), target.core().generation());
        let source_is_internal = source.is_internal_op();

        if let Some(&target_index) = state.op_map.get(&target_key) {
            let record = DependenceRecord {
                operation_idx: target_index,
                prev_idx: target_idx as i32,
                next_idx: source_idx as i32,
                validates,
                dtype,
                dependent_mask: dep_mask,
            };
            if !source_is_internal {
                state
                    .dependences
                    .last_mut()
                    .expect("dependence recorded before any operation")
                    .push(record);
            } else {
                let last = state.operations.last().map(|(op, r#gen)| (op.core().unique_id(), *r#gen));
                if last != Some(target_key) {
                    let source_key = (source.core().unique_id(), source.core().generation());
                    state.internal_dependences.entry(source_key).or_default().push(record);
                }
            }
        } else if target.is_internal_op() {
            let internal_key = (target.core().unique_id(), target.core().generation());
            let internal: Vec<DependenceRecord> = state
                .internal_dependences
                .get(&internal_key)
                .cloned()
                .unwrap_or_default();
            if !source_is_internal {
                let mut translated = Vec::new();
                for record in internal {
                    let overlap = record.dependent_mask.overlap(&dep_mask);
                    if overlap.is_empty() {
                        continue;
                    }
                    translated.push(DependenceRecord {
                        operation_idx: record.operation_idx,
                        prev_idx: record.prev_idx,
                        next_idx: source_idx as i32,
                        validates: record.validates,
                        dtype: record.dtype,
                        dependent_mask: overlap,
                    });
                }
                state
                    .dependences
                    .last_mut()
                    .expect("dependence recorded before any operation")
                    .extend(translated);
            } else {
                let source_key = (source.core().unique_id(), source.core().generation());
                let mut translated = Vec::new();
                for record in internal {
                    let overlap = record.dependent_mask.overlap(&dep_mask);
                    if overlap.is_empty() {
                        continue;
                    }
                    translated.push(DependenceRecord {
                        operation_idx: record.operation_idx,
                        prev_idx: record.prev_idx,
                        next_idx: source_idx as i32,
                        validates: record.validates,
                        dtype: record.dtype,
                        dependent_mask: overlap,
                    });
                }
                state.internal_dependences.entry(source_key).or_default().extend(translated);
            }
        }
    }

    /// Records aliased region-requirement children for the most recently
    /// registered operation.
    pub fn record_aliased_children(&self, req_index: usize, depth: u32, mask: FieldMask) {
        let mut state = self.state.lock();
        let index = state.operations.len().saturating_sub(1);
        state
            .aliased_children
            .entry(index)
            .or_default()
            .push(AliasedChildren { req_index, depth, mask });
    }

    /// Returns the aliased-children records for an operation index, for
    /// replaying privilege paths.
    pub fn aliased_children(&self, index: usize) -> Vec<AliasedChildren> {
        self.state.lock().aliased_children.get(&index).cloned().unwrap_or_default()
    }

    /// Returns the recorded dependences for an operation index.
    pub fn recorded_dependences(&self, index: usize) -> Vec<DependenceRecord> {
        self.state.lock().dependences.get(index).cloned().unwrap_or_default()
    }
}
