//! Typed publish/subscribe shared by every stateful entity.
//!
//! Entities own an [`Emitter`] and expose `add_listener`/`remove_listener`
//! passthroughs; only the owner can dispatch. Handlers are plain `Fn(&E)`
//! closures. Dispatch works on a snapshot of the registered handlers, so a
//! handler holding a [`Listeners`] handle may add or remove listeners (itself
//! included) while an event is being delivered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

/// An event payload that can be routed by kind.
pub trait Event {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Rc<dyn Fn(&E)>;

struct Registry<E: Event> {
    next_id: u64,
    handlers: HashMap<E::Kind, Vec<(ListenerId, Handler<E>)>>,
}

impl<E: Event> Registry<E> {
    fn add(&mut self, kind: E::Kind, handler: Handler<E>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    fn remove(&mut self, kind: E::Kind, id: ListenerId) -> bool {
        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(listener, _)| *listener != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.handlers.remove(&kind);
        }
        removed
    }
}

/// Subscription side of an emitter. Cheap to clone; handlers may keep one to
/// (un)subscribe from inside a dispatch.
pub struct Listeners<E: Event> {
    registry: Rc<RefCell<Registry<E>>>,
}

impl<E: Event> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: Event> Listeners<E> {
    pub fn add(&self, kind: E::Kind, handler: impl Fn(&E) + 'static) -> ListenerId {
        self.registry.borrow_mut().add(kind, Rc::new(handler))
    }

    /// Returns false if the listener was not registered for `kind`.
    pub fn remove(&self, kind: E::Kind, id: ListenerId) -> bool {
        self.registry.borrow_mut().remove(kind, id)
    }

    pub fn count(&self, kind: E::Kind) -> usize {
        self.registry
            .borrow()
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

pub struct Emitter<E: Event> {
    listeners: Listeners<E>,
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Listeners {
                registry: Rc::new(RefCell::new(Registry {
                    next_id: 0,
                    handlers: HashMap::new(),
                })),
            },
        }
    }

    pub fn listeners(&self) -> &Listeners<E> {
        &self.listeners
    }

    pub(crate) fn dispatch(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = {
            let registry = self.listeners.registry.borrow();
            match registry.handlers.get(&event.kind()) {
                Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            handler(event);
        }
    }
}

impl<E: Event> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.listeners.registry.borrow();
        let count: usize = registry.handlers.values().map(Vec::len).sum();
        f.debug_struct("Emitter").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Signal(Kind);

    impl Event for Signal {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn delivers_only_to_matching_kind() {
        let emitter = Emitter::<Signal>::new();
        let pings = Rc::new(Cell::new(0));
        let pongs = Rc::new(Cell::new(0));

        let p = pings.clone();
        emitter.listeners().add(Kind::Ping, move |_| p.set(p.get() + 1));
        let p = pongs.clone();
        emitter.listeners().add(Kind::Pong, move |_| p.set(p.get() + 1));

        emitter.dispatch(&Signal(Kind::Ping));
        emitter.dispatch(&Signal(Kind::Ping));

        assert_eq!(pings.get(), 2);
        assert_eq!(pongs.get(), 0);
    }

    #[test]
    fn multiple_handlers_per_kind() {
        let emitter = Emitter::<Signal>::new();
        let hits = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            emitter.listeners().add(Kind::Ping, move |_| h.set(h.get() + 1));
        }

        emitter.dispatch(&Signal(Kind::Ping));
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn removing_unknown_listener_is_a_no_op() {
        let emitter = Emitter::<Signal>::new();
        let id = emitter.listeners().add(Kind::Ping, |_| {});

        assert!(!emitter.listeners().remove(Kind::Pong, id));
        assert!(emitter.listeners().remove(Kind::Ping, id));
        assert!(!emitter.listeners().remove(Kind::Ping, id));
        assert_eq!(emitter.listeners().count(Kind::Ping), 0);
    }

    #[test]
    fn handler_can_unsubscribe_itself_during_dispatch() {
        let emitter = Emitter::<Signal>::new();
        let hits = Rc::new(Cell::new(0));
        let own_id = Rc::new(Cell::new(None));

        let listeners = emitter.listeners().clone();
        let h = hits.clone();
        let slot = own_id.clone();
        let id = emitter.listeners().add(Kind::Ping, move |_| {
            h.set(h.get() + 1);
            if let Some(id) = slot.get() {
                listeners.remove(Kind::Ping, id);
            }
        });
        own_id.set(Some(id));

        emitter.dispatch(&Signal(Kind::Ping));
        emitter.dispatch(&Signal(Kind::Ping));

        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn listener_added_during_dispatch_waits_for_next_event() {
        let emitter = Emitter::<Signal>::new();
        let late_hits = Rc::new(Cell::new(0));

        let listeners = emitter.listeners().clone();
        let late = late_hits.clone();
        emitter.listeners().add(Kind::Ping, move |_| {
            let late = late.clone();
            listeners.add(Kind::Ping, move |_| late.set(late.get() + 1));
        });

        emitter.dispatch(&Signal(Kind::Ping));
        assert_eq!(late_hits.get(), 0);

        emitter.dispatch(&Signal(Kind::Ping));
        assert_eq!(late_hits.get(), 1);
    }
}
