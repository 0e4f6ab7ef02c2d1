use tessera_core::{ContextId, FieldId, TraceId, UniqueId};

use crate::operation::OpKind;

// RUNTIME ERROR
// ================================================================================================

/// User-facing errors from the runtime core.
///
/// Errors that can only arise from a broken mapper are fatal under control
/// replication, since shards must agree; they are still surfaced as values so
/// the front end can report them with context before aborting.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("leaf task {task} (UID {uid}) attempted to launch child operations")]
    LeafContextViolation { task: String, uid: UniqueId },

    #[error("context {0} is not registered with this runtime")]
    UnknownContext(ContextId),

    #[error(
        "trace violation: recorded {recorded} operations in trace {tid} of task {task} \
         (UID {uid}) but {issued} operations have now been issued"
    )]
    TraceLengthViolation { tid: TraceId, task: String, uid: UniqueId, recorded: usize, issued: usize },

    #[error(
        "trace violation: operation at index {index} of trace {tid} in task {task} (UID {uid}) \
         was recorded as {recorded:?} but replayed as {replayed:?}"
    )]
    TraceKindViolation {
        tid: TraceId,
        task: String,
        uid: UniqueId,
        index: usize,
        recorded: OpKind,
        replayed: OpKind,
    },

    #[error(
        "trace violation: operation at index {index} of trace {tid} in task {task} (UID {uid}) \
         was recorded with {recorded} regions but replayed with {replayed}"
    )]
    TraceRegionCountViolation {
        tid: TraceId,
        task: String,
        uid: UniqueId,
        index: usize,
        recorded: usize,
        replayed: usize,
    },

    #[error("task {task} (UID {uid}) ended a trace {tid} that was never begun")]
    UnmatchedEndTrace { tid: TraceId, task: String, uid: UniqueId },

    #[error("task {task} (UID {uid}) began trace {tid} while another trace is active")]
    NestedTrace { tid: TraceId, task: String, uid: UniqueId },

    #[error(
        "invalid mapper output from mapper {mapper}: failed to pick a valid sharding functor \
         for {kind:?} operation {task} (UID {uid})"
    )]
    InvalidShardingFunctor { mapper: String, kind: OpKind, task: String, uid: UniqueId },

    #[error(
        "invalid mapper output from mapper {mapper}: shards disagree on the sharding functor \
         for {kind:?} operation {task} (UID {uid})"
    )]
    InconsistentShardingFunctor { mapper: String, kind: OpKind, task: String, uid: UniqueId },

    #[error("local field {fid} exceeds the per-context local field limit")]
    LocalFieldLimit { fid: FieldId },

    #[error("privilege check failed for region requirement {index} of {task} (UID {uid})")]
    PrivilegeViolation { task: String, uid: UniqueId, index: usize },

    #[error("operation precondition was poisoned; {task} (UID {uid}) fails at commit")]
    PoisonedPrecondition { task: String, uid: UniqueId },
}
