use std::{
    collections::HashMap,
    sync::{Arc, mpsc},
    thread,
};

use parking_lot::Mutex;
use tessera_core::{BarrierSpace, MessageFabric, MessageHandler, MessageKind, NodeId};
use tracing::{info, warn};

// LOCAL CLUSTER
// ================================================================================================

struct Envelope {
    from: NodeId,
    kind: MessageKind,
    payload: Vec<u8>,
}

struct ClusterState {
    senders: HashMap<NodeId, mpsc::Sender<Envelope>>,
    threads: Vec<thread::JoinHandle<()>>,
}

struct ClusterCore {
    node_count: usize,
    barrier_space: Arc<BarrierSpace>,
    state: Mutex<ClusterState>,
}

/// An in-process machine: one delivery thread per node, ordered delivery
/// per target, and a shared barrier space standing in for the machine-level
/// barrier service.
///
/// This is the harness the runtime uses for single-process multi-node
/// execution and for tests; a distributed deployment would substitute a real
/// network fabric behind the same [`MessageFabric`] trait.
pub struct LocalCluster {
    core: Arc<ClusterCore>,
}

impl LocalCluster {
    pub fn new(node_count: usize) -> Self {
        Self {
            core: Arc::new(ClusterCore {
                node_count,
                barrier_space: Arc::new(BarrierSpace::new()),
                state: Mutex::new(ClusterState {
                    senders: HashMap::new(),
                    threads: Vec::new(),
                }),
            }),
        }
    }

    pub fn node_count(&self) -> usize {
        self.core.node_count
    }

    /// The barrier space shared by every node of this cluster.
    pub fn barrier_space(&self) -> Arc<BarrierSpace> {
        Arc::clone(&self.core.barrier_space)
    }

    /// Returns the fabric endpoint for one node.
    pub fn endpoint(&self, node: NodeId) -> Arc<dyn MessageFabric> {
        assert!((node.as_raw() as usize) < self.core.node_count, "node out of range");
        Arc::new(NodeEndpoint { node, core: Arc::clone(&self.core) })
    }

    /// Attaches a node's message handler and starts its delivery thread.
    pub fn register_node(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        let (sender, receiver) = mpsc::channel::<Envelope>();
        let thread = thread::Builder::new()
            .name(format!("fabric-{node}"))
            .spawn(move || {
                while let Ok(envelope) = receiver.recv() {
                    handler.handle_message(envelope.from, envelope.kind, &envelope.payload);
                }
                info!(target: "tessera::fabric", %node, "delivery thread stopped");
            })
            .expect("failed to spawn fabric delivery thread");
        let mut state = self.core.state.lock();
        state.senders.insert(node, sender);
        state.threads.push(thread);
    }

    /// Stops delivery threads after draining in-flight messages.
    pub fn shutdown(&self) {
        let threads = {
            let mut state = self.core.state.lock();
            state.senders.clear();
            core::mem::take(&mut state.threads)
        };
        for thread in threads {
            let _ = thread.join();
        }
    }
}

struct NodeEndpoint {
    node: NodeId,
    core: Arc<ClusterCore>,
}

impl MessageFabric for NodeEndpoint {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn node_count(&self) -> usize {
        self.core.node_count
    }

    fn send(&self, target: NodeId, kind: MessageKind, payload: Vec<u8>) {
        let sender = self.core.state.lock().senders.get(&target).cloned();
        match sender {
            Some(sender) => {
                let _ = sender.send(Envelope { from: self.node, kind, payload });
            },
            None => {
                warn!(target: "tessera::fabric", %target, ?kind,
                    "message dropped: node not registered");
            },
        }
    }
}
