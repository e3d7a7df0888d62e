//! Ordered, de-duplicated subscriber list that any module can publish on.

use std::cell::RefCell;
use std::rc::Rc;

use crate::events::{dispatcher::emit_module_event, LogLevel};
use crate::module_host::{Context, ModuleId, ModuleResult};

/// Subscribers are identified by the `Rc` allocation, not by behaviour: two
/// separately created closures with the same body are distinct subscribers.
pub type Callback<E> = Rc<dyn Fn(&mut Context<'_>, &E) -> ModuleResult<()>>;

/// Wrap a closure as a [`Callback`].
pub fn callback<E, F>(f: F) -> Callback<E>
where
    E: ?Sized,
    F: Fn(&mut Context<'_>, &E) -> ModuleResult<()> + 'static,
{
    Rc::new(f)
}

fn same_callback<E: ?Sized>(a: &Callback<E>, b: &Callback<E>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

struct Subscription<E: ?Sized> {
    /// Context restored around every delivery; no lifetime control implied.
    owner: Option<ModuleId>,
    callback: Callback<E>,
}

impl<E: ?Sized> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            callback: self.callback.clone(),
        }
    }
}

pub struct CallbackBus<E: ?Sized> {
    name: &'static str,
    subscriptions: RefCell<Vec<Subscription<E>>>,
}

impl<E: ?Sized> CallbackBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    /// Append `callback`, owned by the current context. Returns false if the
    /// same callback is already subscribed.
    pub fn subscribe(&self, ctx: &Context<'_>, callback: &Callback<E>) -> bool {
        let mut subs = self.subscriptions.borrow_mut();
        if subs.iter().any(|s| same_callback(&s.callback, callback)) {
            return false;
        }
        subs.push(Subscription {
            owner: ctx.current(),
            callback: callback.clone(),
        });
        true
    }

    /// Remove the first matching subscription; absent match is a no-op.
    pub fn unsubscribe(&self, callback: &Callback<E>) -> bool {
        let mut subs = self.subscriptions.borrow_mut();
        match subs.iter().position(|s| same_callback(&s.callback, callback)) {
            Some(idx) => {
                subs.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every subscriber in subscription order, each under
    /// its owner's context. The list is snapshotted first: subscriptions
    /// added or removed by a callback take effect from the next publish.
    /// Returns the number of deliveries.
    pub fn publish(&self, ctx: &mut Context<'_>, event: &E) -> usize {
        let snapshot: Vec<Subscription<E>> = self.subscriptions.borrow().clone();
        for sub in &snapshot {
            let result = ctx.with_context(sub.owner, |ctx| (sub.callback)(ctx, event));
            if let Err(e) = result {
                let owner = sub
                    .owner
                    .and_then(|id| ctx.module_name(id))
                    .unwrap_or("host");
                emit_module_event(
                    "bus",
                    LogLevel::Warn,
                    owner,
                    "callback_failed",
                    Some(format!("bus={} error={}", self.name, e)),
                );
            }
        }
        snapshot.len()
    }

    /// Owner of each subscription, in order.
    pub fn owners(&self) -> Vec<Option<ModuleId>> {
        self.subscriptions.borrow().iter().map(|s| s.owner).collect()
    }

    pub fn clear(&self) {
        self.subscriptions.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.borrow().is_empty()
    }
}
