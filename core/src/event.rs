use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

use crate::utils::{
    ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable,
};

// EVENT WAITER
// ================================================================================================

/// A continuation resumed when an [`Event`] triggers.
///
/// Blocking inside a runtime stage is expressed by registering a waiter and
/// returning; the waiter re-enqueues the stage when the event fires. Waiters
/// run on the thread that triggers the event, so they must be short.
pub trait EventWaiter: Send {
    fn event_triggered(self: Box<Self>, poisoned: bool);
}

impl<F: FnOnce(bool) + Send> EventWaiter for F {
    fn event_triggered(self: Box<Self>, poisoned: bool) {
        self(poisoned)
    }
}

// EVENT
// ================================================================================================

struct EventState {
    triggered: bool,
    poisoned: bool,
    waiters: Vec<Box<dyn EventWaiter>>,
}

struct EventImpl {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventImpl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EventState {
                triggered: false,
                poisoned: false,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn trigger(&self, poisoned: bool) {
        let waiters = {
            let mut state = self.state.lock();
            assert!(!state.triggered, "event triggered twice");
            state.triggered = true;
            state.poisoned = poisoned;
            self.cond.notify_all();
            core::mem::take(&mut state.waiters)
        };
        // run waiters outside the lock so they may register further waiters
        for waiter in waiters {
            waiter.event_triggered(poisoned);
        }
    }
}

/// An opaque asynchronous completion.
///
/// Events are cheap to clone and share. The default event
/// ([`Event::NO_EVENT`]) has always triggered. A poisoned event carries a
/// failure which propagates through [`Event::merge`].
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventImpl>>,
}

impl Event {
    /// The always-triggered event.
    pub const NO_EVENT: Event = Event { inner: None };

    /// Returns true if the event has triggered (possibly poisoned).
    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.state.lock().triggered,
        }
    }

    /// Returns true if the event has triggered with poison.
    pub fn is_poisoned(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let state = inner.state.lock();
                state.triggered && state.poisoned
            },
        }
    }

    /// Blocks the calling thread until the event triggers. Returns the
    /// poison status.
    pub fn wait(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let mut state = inner.state.lock();
                while !state.triggered {
                    inner.cond.wait(&mut state);
                }
                state.poisoned
            },
        }
    }

    /// Registers a waiter to run when the event triggers. If the event has
    /// already triggered the waiter runs immediately on the calling thread.
    pub fn add_waiter(&self, waiter: Box<dyn EventWaiter>) {
        match &self.inner {
            None => waiter.event_triggered(false),
            Some(inner) => {
                let run_now = {
                    let mut state = inner.state.lock();
                    if state.triggered {
                        Some(state.poisoned)
                    } else {
                        state.waiters.push(waiter);
                        return;
                    }
                };
                if let Some(poisoned) = run_now {
                    waiter.event_triggered(poisoned);
                }
            },
        }
    }

    /// Merges a set of events into one that triggers when all of them have
    /// triggered. Poison in any input poisons the result.
    pub fn merge(events: &[Event]) -> Event {
        let pending: Vec<&Event> = events.iter().filter(|ev| !ev.has_triggered()).collect();
        if pending.is_empty() {
            if events.iter().any(|ev| ev.is_poisoned()) {
                let user = UserEvent::new();
                user.poison();
                return user.event();
            }
            return Event::NO_EVENT;
        }

        let result = UserEvent::new();
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let any_poison = Arc::new(AtomicBool::new(events.iter().any(|ev| ev.is_poisoned())));
        for event in pending {
            let result = result.clone();
            let remaining = Arc::clone(&remaining);
            let any_poison = Arc::clone(&any_poison);
            event.add_waiter(Box::new(move |poisoned: bool| {
                if poisoned {
                    any_poison.store(true, Ordering::Relaxed);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if any_poison.load(Ordering::Relaxed) {
                        result.poison();
                    } else {
                        result.trigger();
                    }
                }
            }));
        }
        result.event()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.inner {
            None => write!(f, "Event(no-event)"),
            Some(inner) => {
                let state = inner.state.lock();
                write!(f, "Event(triggered: {}, poisoned: {})", state.triggered, state.poisoned)
            },
        }
    }
}

// USER EVENT
// ================================================================================================

/// An [`Event`] with an explicit trigger owned by its creator.
#[derive(Clone)]
pub struct UserEvent {
    inner: Arc<EventImpl>,
}

impl UserEvent {
    pub fn new() -> Self {
        Self { inner: EventImpl::new() }
    }

    /// Returns the waitable view of this event.
    pub fn event(&self) -> Event {
        Event { inner: Some(Arc::clone(&self.inner)) }
    }

    pub fn has_triggered(&self) -> bool {
        self.inner.state.lock().triggered
    }

    /// Triggers the event successfully. Panics if already triggered.
    pub fn trigger(&self) {
        self.inner.trigger(false);
    }

    /// Triggers the event with poison. Panics if already triggered.
    pub fn poison(&self) {
        self.inner.trigger(true);
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "UserEvent(triggered: {})", self.has_triggered())
    }
}

// BARRIER
// ================================================================================================

struct BarrierGen {
    remaining: usize,
    event: UserEvent,
}

struct BarrierState {
    // generations are created lazily on first arrival or wait
    generations: BTreeMap<u64, BarrierGen>,
}

struct BarrierImpl {
    id: u64,
    arrivals: usize,
    state: Mutex<BarrierState>,
}

impl BarrierImpl {
    fn generation_event(&self, r#gen: u64) -> Event {
        let mut state = self.state.lock();
        let entry = state.generations.entry(r#gen).or_insert_with(|| BarrierGen {
            remaining: self.arrivals,
            event: UserEvent::new(),
        });
        entry.event.event()
    }

    fn arrive(&self, r#gen: u64, count: usize) {
        let trigger = {
            let mut state = self.state.lock();
            let entry = state.generations.entry(r#gen).or_insert_with(|| BarrierGen {
                remaining: self.arrivals,
                event: UserEvent::new(),
            });
            assert!(entry.remaining >= count, "too many barrier arrivals");
            entry.remaining -= count;
            (entry.remaining == 0).then(|| entry.event.clone())
        };
        if let Some(event) = trigger {
            event.trigger();
        }
    }
}

/// A phase barrier: a fixed number of arrivals per generation, with the
/// generation's event triggering once all arrivals are in. [`Barrier::advance`]
/// returns the handle for the next generation.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierImpl>,
    r#gen: u64,
}

impl Barrier {
    /// Returns the number of arrivals needed per generation.
    pub fn total_arrivals(&self) -> usize {
        self.inner.arrivals
    }

    /// Returns the generation this handle names.
    pub fn generation(&self) -> u64 {
        self.r#gen
    }

    /// Records `count` arrivals at this generation.
    pub fn arrive(&self, count: usize) {
        self.inner.arrive(self.r#gen, count);
    }

    /// Returns the completion event for this generation.
    pub fn completion(&self) -> Event {
        self.inner.generation_event(self.r#gen)
    }

    pub fn has_triggered(&self) -> bool {
        self.completion().has_triggered()
    }

    /// Blocks until all arrivals for this generation are in.
    pub fn wait(&self) {
        self.completion().wait();
    }

    /// Returns the handle for the next generation of this barrier.
    pub fn advance(&self) -> Barrier {
        Barrier { inner: Arc::clone(&self.inner), r#gen: self.r#gen + 1 }
    }

    /// Returns a wire token naming this barrier and generation. The token
    /// resolves through the [`BarrierSpace`] it was created from.
    pub fn token(&self) -> BarrierToken {
        BarrierToken { id: self.inner.id, r#gen: self.r#gen }
    }
}

impl core::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Barrier(id: {}, gen: {})", self.inner.id, self.r#gen)
    }
}

/// Wire-serializable name for a [`Barrier`] generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierToken {
    pub id: u64,
    pub r#gen: u64,
}

impl Serializable for BarrierToken {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.id);
        target.write_u64(self.r#gen);
    }
}

impl Deserializable for BarrierToken {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self { id: source.read_u64()?, r#gen: source.read_u64()? })
    }
}

// BARRIER SPACE
// ================================================================================================

/// Allocates barriers and resolves [`BarrierToken`]s back to them.
///
/// One space is shared by all nodes of a cluster; it stands in for the
/// machine-level barrier service that distributes barrier names at launch.
#[derive(Default)]
pub struct BarrierSpace {
    next_id: AtomicU64,
    table: Mutex<BTreeMap<u64, Arc<BarrierImpl>>>,
}

impl BarrierSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a barrier requiring `arrivals` arrivals per generation.
    pub fn create_barrier(&self, arrivals: usize) -> Barrier {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(BarrierImpl {
            id,
            arrivals,
            state: Mutex::new(BarrierState { generations: BTreeMap::new() }),
        });
        self.table.lock().insert(id, Arc::clone(&inner));
        Barrier { inner, r#gen: 0 }
    }

    /// Resolves a token minted by a barrier from this space.
    pub fn resolve(&self, token: BarrierToken) -> Option<Barrier> {
        let table = self.table.lock();
        table.get(&token.id).map(|inner| Barrier { inner: Arc::clone(inner), r#gen: token.r#gen })
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_event_has_always_triggered() {
        assert!(Event::NO_EVENT.has_triggered());
        assert!(!Event::NO_EVENT.is_poisoned());
        assert!(!Event::NO_EVENT.wait());
    }

    #[test]
    fn user_event_triggers_waiters() {
        let user = UserEvent::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        user.event().add_waiter(Box::new(move |poisoned: bool| {
            assert!(!poisoned);
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(!fired.load(Ordering::SeqCst));
        user.trigger();
        assert!(fired.load(Ordering::SeqCst));
        assert!(user.event().has_triggered());
    }

    #[test]
    fn merge_waits_for_all_inputs() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge(&[a.event(), b.event()]);
        assert!(!merged.has_triggered());
        a.trigger();
        assert!(!merged.has_triggered());
        b.trigger();
        assert!(merged.has_triggered());
        assert!(!merged.is_poisoned());
    }

    #[test]
    fn merge_propagates_poison() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge(&[a.event(), b.event()]);
        a.poison();
        b.trigger();
        assert!(merged.has_triggered());
        assert!(merged.is_poisoned());
    }

    #[test]
    fn merge_of_triggered_events_is_immediate() {
        let merged = Event::merge(&[Event::NO_EVENT, Event::NO_EVENT]);
        assert!(merged.has_triggered());
    }

    #[test]
    fn barrier_generations_advance() {
        let space = BarrierSpace::new();
        let bar = space.create_barrier(2);
        assert!(!bar.has_triggered());
        bar.arrive(1);
        assert!(!bar.has_triggered());
        bar.arrive(1);
        assert!(bar.has_triggered());

        let next = bar.advance();
        assert_eq!(next.generation(), 1);
        assert!(!next.has_triggered());
        next.arrive(2);
        assert!(next.has_triggered());
    }

    #[test]
    fn barrier_token_resolves_through_space() {
        let space = BarrierSpace::new();
        let bar = space.create_barrier(1);
        let token = bar.advance().token();
        let resolved = space.resolve(token).unwrap();
        assert_eq!(resolved.generation(), 1);
        resolved.arrive(1);
        assert!(bar.advance().has_triggered());
    }
}
