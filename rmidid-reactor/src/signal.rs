//! Signal/slot event bus.
//!
//! A [`Signal`] broadcasts a value to its subscribers in subscription
//! order. Subscribing returns a [`SignalToken`]; dropping the token
//! disconnects. Connections and disconnections made while an emission is in
//! flight take effect on the next emission, so subscribers are free to
//! touch the registry from inside their own callback. Emission performs no
//! per-call allocation: each slot's callback is briefly taken out of its
//! slot while it runs.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

struct Slot<T> {
    id: u64,
    callback: Option<Box<dyn FnMut(&T)>>,
    dead: bool,
}

struct SignalInner<T> {
    slots: RefCell<Vec<Slot<T>>>,
    next_id: Cell<u64>,
    /// Emission nesting depth; removals are deferred while it is non-zero.
    emitting: Cell<u32>,
}

/// Back-reference interface a token uses to unregister without knowing the
/// signal's value type.
trait Disconnect {
    fn disconnect(&self, id: u64);
}

impl<T> Disconnect for SignalInner<T> {
    fn disconnect(&self, id: u64) {
        if self.emitting.get() > 0 {
            if let Some(slot) = self.slots.borrow_mut().iter_mut().find(|s| s.id == id) {
                slot.dead = true;
            }
        } else {
            self.slots.borrow_mut().retain(|s| s.id != id);
        }
    }
}

/// A cloneable emitter handle for values of type `T`.
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SignalInner {
                slots: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                emitting: Cell::new(0),
            }),
        }
    }

    /// Subscribes `callback`; it stays connected until the returned token
    /// is dropped.
    #[must_use = "dropping the token disconnects the subscriber"]
    pub fn connect(&self, callback: impl FnMut(&T) + 'static) -> SignalToken {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.slots.borrow_mut().push(Slot {
            id,
            callback: Some(Box::new(callback)),
            dead: false,
        });
        let target: Rc<dyn Disconnect> = self.inner.clone();
        SignalToken {
            target: Rc::downgrade(&target),
            id,
        }
    }

    /// Invokes every currently connected subscriber with `value`.
    pub fn emit(&self, value: &T) {
        let inner = &self.inner;
        inner.emitting.set(inner.emitting.get() + 1);
        let count = inner.slots.borrow().len();
        for index in 0..count {
            let taken = {
                let mut slots = inner.slots.borrow_mut();
                slots
                    .get_mut(index)
                    .and_then(|slot| slot.callback.take().map(|cb| (slot.id, cb)))
            };
            let Some((id, mut callback)) = taken else {
                continue;
            };
            callback(value);
            let mut slots = inner.slots.borrow_mut();
            if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                slot.callback = Some(callback);
            }
        }
        inner.emitting.set(inner.emitting.get() - 1);
        if inner.emitting.get() == 0 {
            inner.slots.borrow_mut().retain(|s| !s.dead);
        }
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.borrow().iter().filter(|s| !s.dead).count()
    }
}

/// Connection handle returned by [`Signal::connect`]; disconnects on drop.
pub struct SignalToken {
    target: Weak<dyn Disconnect>,
    id: u64,
}

impl Drop for SignalToken {
    fn drop(&mut self) {
        if let Some(target) = self.target.upgrade() {
            target.disconnect(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_in_subscription_order() {
        let signal = Signal::<u32>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = seen.clone();
        let _t1 = signal.connect(move |v| s1.borrow_mut().push(("first", *v)));
        let s2 = seen.clone();
        let _t2 = signal.connect(move |v| s2.borrow_mut().push(("second", *v)));

        signal.emit(&7);
        assert_eq!(&*seen.borrow(), &[("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_token_drop_disconnects() {
        let signal = Signal::<()>::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let token = signal.connect(move |_| h.set(h.get() + 1));
        signal.emit(&());
        assert_eq!(hits.get(), 1);

        drop(token);
        assert_eq!(signal.subscriber_count(), 0);
        signal.emit(&());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_connect_during_emission_takes_effect_next_time() {
        let signal = Signal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let late_tokens = Rc::new(RefCell::new(Vec::new()));

        let sig = signal.clone();
        let h = hits.clone();
        let stash = late_tokens.clone();
        let _t = signal.connect(move |_| {
            let h2 = h.clone();
            stash
                .borrow_mut()
                .push(sig.connect(move |_| h2.set(h2.get() + 1)));
        });

        signal.emit(&());
        assert_eq!(hits.get(), 0, "late subscriber must not run this emission");
        signal.emit(&());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_self_disconnect_during_emission() {
        let signal = Signal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let token_cell: Rc<RefCell<Option<SignalToken>>> = Rc::new(RefCell::new(None));

        let h = hits.clone();
        let cell = token_cell.clone();
        let token = signal.connect(move |_| {
            h.set(h.get() + 1);
            cell.borrow_mut().take();
        });
        *token_cell.borrow_mut() = Some(token);

        signal.emit(&());
        signal.emit(&());
        assert_eq!(hits.get(), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_disconnect_other_during_emission() {
        let signal = Signal::<()>::new();
        let second_hits = Rc::new(Cell::new(0));
        let second_token: Rc<RefCell<Option<SignalToken>>> = Rc::new(RefCell::new(None));

        let cell = second_token.clone();
        let _t1 = signal.connect(move |_| {
            cell.borrow_mut().take();
        });
        let h = second_hits.clone();
        *second_token.borrow_mut() = Some(signal.connect(move |_| h.set(h.get() + 1)));

        // The first subscriber kills the second mid-emission; the
        // disconnect only takes effect on the next emission, so the second
        // still runs once.
        signal.emit(&());
        assert_eq!(second_hits.get(), 1);
        assert_eq!(signal.subscriber_count(), 1);
        signal.emit(&());
        assert_eq!(second_hits.get(), 1);
    }

    #[test]
    fn test_token_outliving_signal_is_harmless() {
        let signal = Signal::<()>::new();
        let token = signal.connect(|_| {});
        drop(signal);
        drop(token);
    }
}
