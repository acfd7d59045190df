use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::address::RoutingContext;
use crate::WorkerId;

/// One logical connection flowing through a tunnel chain
///
/// A line is created when a connection is accepted (or dialed) and carries
/// everything the chain's nodes need per connection: a routing context and
/// one private state slot per node, indexed by the node's chain position.
/// Lines are `!Send`; every signal and payload for a line executes on the
/// worker thread that created it, so slot access needs no locking.
///
/// Chain calls can re-enter: a node's handler may indirectly close the very
/// line it is processing (a write error surfacing during a payload, say).
/// Callers therefore hold a [`LineGuard`] across chain calls; `destroy`
/// while guards exist only marks the line dead, and the per-node state is
/// torn down when the last guard drops.
pub struct Line {
    id: u64,
    worker: WorkerId,
    guards: Cell<u32>,
    alive: Cell<bool>,
    destroy_pending: Cell<bool>,
    slots: Vec<RefCell<Option<Box<dyn Any>>>>,
    routing: RefCell<RoutingContext>,
}

impl Line {
    /// Create a line with one empty state slot per chain node
    pub fn new(id: u64, worker: WorkerId, slots: usize) -> Rc<Self> {
        Rc::new(Self {
            id,
            worker,
            guards: Cell::new(0),
            alive: Cell::new(true),
            destroy_pending: Cell::new(false),
            slots: (0..slots).map(|_| RefCell::new(None)).collect(),
            routing: RefCell::new(RoutingContext::default()),
        })
    }

    /// Unique id within the owning worker
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The worker thread this line is affine to
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Whether the line has not been destroyed
    ///
    /// Drivers check this after re-entrant chain calls before touching the
    /// line again.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Hold the line across a re-entrant chain call
    pub fn guard(self: &Rc<Self>) -> LineGuard {
        self.guards.set(self.guards.get() + 1);
        LineGuard { line: self.clone() }
    }

    /// Mark the line dead and tear down per-node state
    ///
    /// With guards outstanding the teardown is deferred to the last guard
    /// drop, so a call stack that triggered its own destruction can unwind
    /// over intact memory. Calling this twice is a no-op.
    pub fn destroy(&self) {
        if !self.alive.replace(false) {
            return;
        }
        if self.guards.get() == 0 {
            self.clear_slots();
        } else {
            self.destroy_pending.set(true);
        }
    }

    /// Store a node's per-line state in its slot
    pub fn set_state<S: Any>(&self, index: usize, state: S) {
        *self.slots[index].borrow_mut() = Some(Box::new(state));
    }

    /// Remove and return a node's per-line state
    ///
    /// Returns `None` when the slot is already empty, which is how a node
    /// recognizes (and absorbs) a second `Finish`.
    pub fn take_state<S: Any>(&self, index: usize) -> Option<Box<S>> {
        let boxed = self.slots[index].borrow_mut().take()?;
        match boxed.downcast() {
            Ok(state) => Some(state),
            Err(_) => panic!("slot {index} of line {} holds a foreign state type", self.id),
        }
    }

    /// Borrow a node's per-line state mutably
    ///
    /// Returns `None` when the slot is empty — a payload arriving after
    /// `Finish` takes this path and must be dropped by the caller.
    pub fn state_mut<S: Any>(&self, index: usize) -> Option<RefMut<'_, S>> {
        let slot = self.slots[index].borrow_mut();
        RefMut::filter_map(slot, |s| {
            s.as_mut().and_then(|boxed| boxed.downcast_mut::<S>())
        })
        .ok()
    }

    /// Whether a node's slot currently holds state
    pub fn has_state(&self, index: usize) -> bool {
        self.slots[index].borrow().is_some()
    }

    /// Borrow the routing context
    pub fn routing(&self) -> Ref<'_, RoutingContext> {
        self.routing.borrow()
    }

    /// Borrow the routing context mutably
    pub fn routing_mut(&self) -> RefMut<'_, RoutingContext> {
        self.routing.borrow_mut()
    }

    fn clear_slots(&self) {
        for slot in &self.slots {
            slot.borrow_mut().take();
        }
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("alive", &self.alive.get())
            .field("guards", &self.guards.get())
            .finish()
    }
}

/// Keeps a [`Line`]'s state alive across a re-entrant chain call
///
/// Not a mutex: lines are single-threaded. The guard only prevents the
/// line's slots from being freed out from under the current call stack when
/// something inside it triggers `destroy`.
pub struct LineGuard {
    line: Rc<Line>,
}

impl Drop for LineGuard {
    fn drop(&mut self) {
        let remaining = self.line.guards.get() - 1;
        self.line.guards.set(remaining);
        if remaining == 0 && self.line.destroy_pending.replace(false) {
            trace!(line = self.line.id, "deferred line teardown");
            self.line.clear_slots();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_slot_roundtrip() {
        let line = Line::new(1, WorkerId(0), 2);
        line.set_state(0, 41u32);
        *line.state_mut::<u32>(0).unwrap() += 1;
        assert_eq!(*line.take_state::<u32>(0).unwrap(), 42);
        assert!(line.take_state::<u32>(0).is_none());
        assert!(!line.has_state(1));
    }

    #[test]
    fn empty_slot_borrow_is_none() {
        let line = Line::new(1, WorkerId(0), 1);
        assert!(line.state_mut::<u32>(0).is_none());
    }

    #[test]
    fn destroy_with_guard_defers_teardown() {
        let line = Line::new(7, WorkerId(0), 1);
        line.set_state(0, String::from("resource"));
        {
            let _guard = line.guard();
            line.destroy();
            assert!(!line.is_alive());
            // state survives while the call stack is still unwinding
            assert!(line.has_state(0));
        }
        assert!(!line.has_state(0));
    }

    #[test]
    fn destroy_twice_is_noop() {
        let line = Line::new(7, WorkerId(0), 1);
        line.set_state(0, 1u8);
        line.destroy();
        line.destroy();
        assert!(!line.has_state(0));
    }

    #[test]
    fn nested_guards() {
        let line = Line::new(9, WorkerId(0), 1);
        line.set_state(0, 1u8);
        let outer = line.guard();
        {
            let _inner = line.guard();
            line.destroy();
        }
        assert!(line.has_state(0));
        drop(outer);
        assert!(!line.has_state(0));
    }
}
