use std::{
    collections::BTreeMap,
    sync::Arc,
};

use parking_lot::Mutex;
use tessera_core::{
    Barrier, BarrierToken, CollectiveId, Event, ShardId, UserEvent,
    utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, SliceReader,
        read_blob, write_blob,
    },
};
use tracing::trace;

use crate::manager::ShardContext;

// PAYLOAD TRAITS
// ================================================================================================

/// A value that can ride a collective message.
pub trait CollectiveItem: Clone + Send + Sync + 'static {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, DeserializationError>
    where
        Self: Sized;
}

impl<T> CollectiveItem for T
where
    T: Serializable + Deserializable + Clone + Send + Sync + 'static,
{
    fn encode(&self) -> Vec<u8> {
        self.to_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DeserializationError> {
        Self::read_from_bytes(bytes)
    }
}

/// The accumulated state of an all-gather; merging must be commutative and
/// idempotent so stages may arrive in any order.
pub trait ExchangePayload: CollectiveItem {
    fn merge(&mut self, other: Self);
}

// COLLECTIVE TRAIT
// ================================================================================================

/// A registered collective endpoint on one shard; the shard manager routes
/// incoming collective messages here.
pub trait Collective: Send + Sync {
    fn collective_id(&self) -> CollectiveId;
    fn handle_collective_message(&self, payload: &[u8]);
}

// INDEX CONVERSION
// ================================================================================================

/// Rotates shard ids so that `origin` sits at index 0 of the tree.
pub(crate) fn convert_to_index(id: ShardId, origin: ShardId, total: u32) -> u32 {
    (id.as_raw() + total - origin.as_raw()) % total
}

/// Inverse of [`convert_to_index`].
pub(crate) fn convert_to_shard(index: u32, origin: ShardId, total: u32) -> ShardId {
    ShardId::new((index + origin.as_raw()) % total)
}

// BROADCAST
// ================================================================================================

/// Tree broadcast from an origin shard: the origin sends to `radix`
/// children, every other shard receives exactly once, forwards to its own
/// children, then triggers its done event.
pub struct Broadcast<T: CollectiveItem> {
    ctx: Arc<ShardContext>,
    id: CollectiveId,
    origin: ShardId,
    radix: u32,
    value: Mutex<Option<T>>,
    done: UserEvent,
}

impl<T: CollectiveItem> Broadcast<T> {
    pub fn new(ctx: &Arc<ShardContext>, origin: ShardId) -> Arc<Self> {
        let id = ctx.next_collective_id();
        Self::with_id(ctx, id, origin)
    }

    pub fn with_id(ctx: &Arc<ShardContext>, id: CollectiveId, origin: ShardId) -> Arc<Self> {
        let collective = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            origin,
            radix: ctx.collective_radix(),
            value: Mutex::new(None),
            done: UserEvent::new(),
        });
        ctx.manager().register_collective(ctx.shard_id(), &(collective.clone() as Arc<dyn Collective>));
        collective
    }

    pub fn done_event(&self) -> Event {
        self.done.event()
    }

    /// Origin side: publishes the value and fans out.
    pub fn broadcast(&self, value: T) {
        assert_eq!(self.ctx.shard_id(), self.origin, "broadcast from a non-origin shard");
        *self.value.lock() = Some(value);
        self.send_messages();
        self.done.trigger();
    }

    /// Blocks until the value is available on this shard.
    pub fn wait_value(&self) -> T {
        self.done.event().wait();
        self.value.lock().clone().expect("broadcast completed without a value")
    }

    fn send_messages(&self) {
        let total = self.ctx.total_shards();
        let value = self.value.lock().clone().expect("broadcast fan-out without a value");
        let local_index = convert_to_index(self.ctx.shard_id(), self.origin, total);
        for child in 1..=self.radix {
            let target_index = local_index * self.radix + child;
            if target_index >= total {
                break;
            }
            let target = convert_to_shard(target_index, self.origin, total);
            self.ctx.manager().send_collective_message(target, self.id, value.encode());
        }
    }
}

impl<T: CollectiveItem> Collective for Broadcast<T> {
    fn collective_id(&self) -> CollectiveId {
        self.id
    }

    fn handle_collective_message(&self, payload: &[u8]) {
        debug_assert_ne!(self.ctx.shard_id(), self.origin);
        let value = T::decode(payload).expect("malformed broadcast payload");
        *self.value.lock() = Some(value);
        self.send_messages();
        self.done.trigger();
    }
}

// GATHER
// ================================================================================================

struct GatherState<T> {
    items: Vec<T>,
    received: u32,
}

/// Inverse-tree gather to a target shard: every shard contributes once,
/// interior shards forward their accumulated set upward once all of their
/// children have reported.
pub struct Gather<T: CollectiveItem> {
    ctx: Arc<ShardContext>,
    id: CollectiveId,
    target: ShardId,
    radix: u32,
    expected: u32,
    state: Mutex<GatherState<T>>,
    done: UserEvent,
}

impl<T: CollectiveItem> Gather<T> {
    pub fn new(ctx: &Arc<ShardContext>, target: ShardId) -> Arc<Self> {
        let id = ctx.next_collective_id();
        Self::with_id(ctx, id, target)
    }

    pub fn with_id(ctx: &Arc<ShardContext>, id: CollectiveId, target: ShardId) -> Arc<Self> {
        let total = ctx.total_shards();
        let radix = ctx.collective_radix();
        // one arrival for ourselves plus one per direct child in the tree
        let index = convert_to_index(ctx.shard_id(), target, total);
        let mut expected = 1;
        for child in 1..=radix {
            if index * radix + child < total {
                expected += 1;
            }
        }
        let collective = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            target,
            radix,
            expected,
            state: Mutex::new(GatherState { items: Vec::new(), received: 0 }),
            done: UserEvent::new(),
        });
        ctx.manager().register_collective(ctx.shard_id(), &(collective.clone() as Arc<dyn Collective>));
        collective
    }

    pub fn done_event(&self) -> Event {
        self.done.event()
    }

    /// Contributes this shard's item.
    pub fn contribute(&self, item: T) {
        let finished = {
            let mut state = self.state.lock();
            state.items.push(item);
            state.received += 1;
            debug_assert!(state.received <= self.expected);
            state.received == self.expected
        };
        if finished {
            self.finish();
        }
    }

    /// Target side: blocks until every shard has contributed.
    pub fn wait_items(&self) -> Vec<T> {
        debug_assert_eq!(self.ctx.shard_id(), self.target);
        self.done.event().wait();
        self.state.lock().items.clone()
    }

    fn finish(&self) {
        if self.ctx.shard_id() != self.target {
            let total = self.ctx.total_shards();
            let index = convert_to_index(self.ctx.shard_id(), self.target, total);
            let parent_index = (index - 1) / self.radix;
            let parent = convert_to_shard(parent_index, self.target, total);
            let blobs: Vec<Vec<u8>> =
                self.state.lock().items.iter().map(CollectiveItem::encode).collect();
            self.ctx.manager().send_collective_message(parent, self.id, write_nested_blobs(&blobs));
        }
        self.done.trigger();
    }
}

impl<T: CollectiveItem> Collective for Gather<T> {
    fn collective_id(&self) -> CollectiveId {
        self.id
    }

    fn handle_collective_message(&self, payload: &[u8]) {
        let blobs = read_nested_blobs(payload).expect("malformed gather payload");
        let incoming: Vec<T> = blobs
            .iter()
            .map(|blob| T::decode(blob).expect("malformed gather item"))
            .collect();
        let finished = {
            let mut state = self.state.lock();
            state.items.extend(incoming);
            state.received += 1;
            debug_assert!(state.received <= self.expected);
            state.received == self.expected
        };
        if finished {
            self.finish();
        }
    }
}

// ALL-GATHER
// ================================================================================================

struct AllGatherState<S> {
    value: S,
    current_stage: i32,
    current_notifications: u32,
    pending_notifications: BTreeMap<i32, u32>,
    prefix_stage_notification: bool,
}

/// Radix-k butterfly all-gather.
///
/// Shards inside the largest power-of-radix prefix exchange their
/// accumulated state in `log_radix(participating)` stages; shards outside
/// it contribute through a participating partner in a pre-step (stage −1)
/// and receive the final result in a post-step. After completion every
/// shard holds an identical merged state.
pub struct AllGather<S: ExchangePayload> {
    ctx: Arc<ShardContext>,
    id: CollectiveId,
    radix: u32,
    log_radix: u32,
    stages: i32,
    participating_count: u32,
    participating: bool,
    state: Mutex<AllGatherState<S>>,
    done: UserEvent,
}

impl<S: ExchangePayload> AllGather<S> {
    pub fn new(ctx: &Arc<ShardContext>, initial: S) -> Arc<Self> {
        let id = ctx.next_collective_id();
        Self::with_id(ctx, id, initial)
    }

    pub fn with_id(ctx: &Arc<ShardContext>, id: CollectiveId, initial: S) -> Arc<Self> {
        let total = ctx.total_shards();
        let radix = ctx.collective_radix().max(2);
        debug_assert!(radix.is_power_of_two(), "butterfly stages address partners by xor");
        let log_radix = radix.ilog2();
        // the butterfly runs over the largest power-of-radix prefix
        let mut participating_count = 1u32;
        let mut stages = 0i32;
        while participating_count * radix <= total {
            participating_count *= radix;
            stages += 1;
        }
        let participating = ctx.shard_id().as_raw() < participating_count;
        let collective = Arc::new(Self {
            ctx: Arc::clone(ctx),
            id,
            radix,
            log_radix,
            stages,
            participating_count,
            participating,
            state: Mutex::new(AllGatherState {
                value: initial,
                current_stage: -1,
                current_notifications: 0,
                pending_notifications: BTreeMap::new(),
                prefix_stage_notification: false,
            }),
            done: UserEvent::new(),
        });
        ctx.manager().register_collective(ctx.shard_id(), &(collective.clone() as Arc<dyn Collective>));
        collective
    }

    pub fn done_event(&self) -> Event {
        self.done.event()
    }

    /// Starts the exchange with this shard's contribution already merged
    /// into the initial state.
    pub fn perform(&self) {
        let total = self.ctx.total_shards();
        if total <= 1 {
            // a single shard completes immediately with no messages
            self.done.trigger();
            return;
        }
        if self.participating {
            let has_prefix_partner = self.ctx.shard_id().as_raw()
                < total - self.participating_count;
            if !has_prefix_partner {
                let mut stage = 0;
                while self.send_stage(stage) {
                    stage += 1;
                }
            } else {
                // wait for the pre-step contribution before entering stage 0
                let proceed = {
                    let mut state = self.state.lock();
                    self.arrive_stage(&mut state, -1)
                };
                if proceed {
                    let mut stage = 0;
                    while self.send_stage(stage) {
                        stage += 1;
                    }
                }
            }
        } else {
            self.send_stage(-1);
        }
    }

    /// Blocks until the exchange is complete, returning the merged state.
    pub fn wait_result(&self) -> S {
        self.done.event().wait();
        self.state.lock().value.clone()
    }

    fn construct_payload(&self, stage: i32) -> Vec<u8> {
        let blob = self.state.lock().value.encode();
        let mut payload = Vec::with_capacity(blob.len() + 4);
        payload.extend_from_slice(&(stage as u32).to_le_bytes());
        payload.extend_from_slice(&blob);
        payload
    }

    fn send_stage(&self, stage: i32) -> bool {
        let total = self.ctx.total_shards();
        let local = self.ctx.shard_id().as_raw();
        if stage == -1 {
            if self.participating {
                // post-step: return the final result to our partner
                let target = ShardId::new(local + self.participating_count);
                debug_assert!(target.as_raw() < total);
                let payload = self.construct_payload(stage);
                self.ctx.manager().send_collective_message(target, self.id, payload);
                let mut state = self.state.lock();
                self.arrive_stage(&mut state, stage)
            } else {
                // pre-step: contribute through a participating partner
                let target = ShardId::new(local % self.participating_count);
                let payload = self.construct_payload(stage);
                self.ctx.manager().send_collective_message(target, self.id, payload);
                false
            }
        } else if stage == self.stages {
            self.complete_exchange();
            false
        } else {
            for r in 1..self.radix {
                let target = ShardId::new(local ^ (r << (stage as u32 * self.log_radix)));
                debug_assert!(target.as_raw() < self.participating_count);
                let payload = self.construct_payload(stage);
                self.ctx.manager().send_collective_message(target, self.id, payload);
            }
            self.update_current_stage(stage)
        }
    }

    fn arrive_stage(&self, state: &mut AllGatherState<S>, stage: i32) -> bool {
        debug_assert!(self.participating);
        if stage == -1 {
            // rendezvous between our own readiness and the partner's
            // contribution; whichever lands second proceeds
            if !state.prefix_stage_notification {
                state.prefix_stage_notification = true;
                false
            } else {
                true
            }
        } else if stage != state.current_stage {
            // out-of-order arrival for a future stage
            *state.pending_notifications.entry(stage).or_insert(0) += 1;
            false
        } else {
            state.current_notifications += 1;
            debug_assert!(state.current_notifications <= self.radix);
            state.current_notifications == self.radix
        }
    }

    fn update_current_stage(&self, stage: i32) -> bool {
        let mut state = self.state.lock();
        debug_assert_eq!(state.current_stage + 1, stage, "stages must advance in order");
        state.current_stage = stage;
        state.current_notifications = state.pending_notifications.remove(&stage).unwrap_or(0);
        self.arrive_stage(&mut state, stage)
    }

    fn unpack_stage(&self, stage: i32, payload: &[u8]) -> bool {
        let incoming = S::decode(payload).expect("malformed all-gather payload");
        let mut state = self.state.lock();
        state.value.merge(incoming);
        if stage < 0 && !self.participating {
            return false;
        }
        self.arrive_stage(&mut state, stage)
    }

    fn complete_exchange(&self) {
        let total = self.ctx.total_shards();
        let local = self.ctx.shard_id().as_raw();
        if total > self.participating_count && local < total - self.participating_count {
            self.send_stage(-1);
        }
        trace!(target: "tessera::repl", shard = local, id = %self.id, "all-gather complete");
        self.done.trigger();
    }
}

impl<S: ExchangePayload> Collective for AllGather<S> {
    fn collective_id(&self) -> CollectiveId {
        self.id
    }

    fn handle_collective_message(&self, payload: &[u8]) {
        let stage =
            u32::from_le_bytes(payload[0..4].try_into().expect("malformed all-gather stage"))
                as i32;
        debug_assert!(self.participating || stage == -1);
        let mut send_next = self.unpack_stage(stage, &payload[4..]);
        if self.participating {
            let mut stage = stage;
            while send_next {
                stage += 1;
                send_next = self.send_stage(stage);
            }
        } else {
            // the post-step result arrived; we are done
            self.done.trigger();
        }
    }
}

// BARRIER EXCHANGE
// ================================================================================================

/// The all-gather payload of a barrier exchange: window slots mapped to the
/// barrier tokens their owning shard allocated.
#[derive(Clone, Default)]
pub struct BarrierWindow {
    pub slots: BTreeMap<u32, BarrierToken>,
}

impl Serializable for BarrierWindow {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.slots.len() as u32);
        for (slot, token) in &self.slots {
            target.write_u32(*slot);
            token.write_into(target);
        }
    }
}

impl Deserializable for BarrierWindow {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let count = source.read_u32()? as usize;
        let mut slots = BTreeMap::new();
        for _ in 0..count {
            let slot = source.read_u32()?;
            slots.insert(slot, BarrierToken::read_from(source)?);
        }
        Ok(Self { slots })
    }
}

impl ExchangePayload for BarrierWindow {
    fn merge(&mut self, other: Self) {
        self.slots.extend(other.slots);
    }
}

/// Pre-publishes a window of freshly allocated phase barriers to every
/// shard: each shard allocates the slots it owns (round-robin), then an
/// all-gather distributes the full window.
pub struct BarrierExchange {
    exchange: Arc<AllGather<BarrierWindow>>,
    ctx: Arc<ShardContext>,
    window_size: u32,
}

impl BarrierExchange {
    pub fn new(ctx: &Arc<ShardContext>, window_size: u32) -> Self {
        let total = ctx.total_shards();
        let local = ctx.shard_id().as_raw();
        let mut window = BarrierWindow::default();
        for slot in (0..window_size).filter(|slot| slot % total == local) {
            let barrier = ctx.manager().barrier_space().create_barrier(total as usize);
            window.slots.insert(slot, barrier.token());
        }
        let exchange = AllGather::new(ctx, window);
        Self { exchange, ctx: Arc::clone(ctx), window_size }
    }

    pub fn exchange_barriers_async(&self) {
        self.exchange.perform();
    }

    /// Blocks until every slot of the window is filled, returning the
    /// barriers in slot order.
    pub fn wait_for_barrier_exchange(&self) -> Vec<Barrier> {
        let window = self.exchange.wait_result();
        assert_eq!(window.slots.len() as u32, self.window_size, "barrier window incomplete");
        window
            .slots
            .values()
            .map(|token| {
                self.ctx
                    .manager()
                    .barrier_space()
                    .resolve(*token)
                    .expect("barrier token from an unknown space")
            })
            .collect()
    }
}

// HELPERS
// ================================================================================================

/// Splits a collective payload that carries nested blobs.
pub(crate) fn read_nested_blobs(payload: &[u8]) -> Result<Vec<Vec<u8>>, DeserializationError> {
    let mut reader = SliceReader::new(payload);
    let count = reader.read_u32()? as usize;
    let mut blobs = Vec::with_capacity(count);
    for _ in 0..count {
        blobs.push(read_blob(&mut reader)?);
    }
    Ok(blobs)
}

/// Inverse of [`read_nested_blobs`].
pub(crate) fn write_nested_blobs(blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.write_u32(blobs.len() as u32);
    for blob in blobs {
        write_blob(&mut payload, blob);
    }
    payload
}
