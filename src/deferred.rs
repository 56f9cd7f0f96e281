//! Deferred Results
//!
//! Every synchronous channel request returns a [`Deferred`] handle. The
//! request is answered on a later `parse` call, at which point the deferred
//! fires its success callback with the decoded reply; server errors fire the
//! error callback instead, and the finalize callback runs in either case.
//!
//! Callbacks may be installed after the outcome has already arrived; they
//! then fire immediately. Each slot fires at most once. A callback is always
//! *taken out* of the shared state before being invoked, so a callback may
//! re-enter the library (and even this very deferred) freely.
//!
//! # Examples
//!
//! ```rust
//! use warren_amqp::deferred::Deferred;
//!
//! let deferred: Deferred<u32> = Deferred::new();
//! deferred.clone().on_success(|count| println!("{} messages purged", count));
//! deferred.resolve(3);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::message::Message;

struct DeferredState<T> {
    outcome: Option<Result<T, Error>>,
    on_success: Option<Box<dyn FnOnce(T)>>,
    on_error: Option<Box<dyn FnOnce(Error)>>,
    on_finalize: Option<Box<dyn FnOnce()>>,
    finalized: bool,
}

impl<T> Default for DeferredState<T> {
    fn default() -> Self {
        DeferredState {
            outcome: None,
            on_success: None,
            on_error: None,
            on_finalize: None,
            finalized: false,
        }
    }
}

/// A handle to the eventual result of one request.
///
/// Cloning is cheap and every clone observes the same outcome.
pub struct Deferred<T> {
    state: Rc<RefCell<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred { state: Rc::clone(&self.state) }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").finish()
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Deferred<T> {
    /// A deferred with no outcome yet.
    pub fn new() -> Self {
        Deferred { state: Rc::new(RefCell::new(DeferredState::default())) }
    }

    /// A deferred that has already succeeded, used by `no-wait` requests.
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    /// A deferred that has already failed, used for requests rejected
    /// locally.
    pub fn failed(error: Error) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Install the success callback. Fires immediately if the reply already
    /// arrived.
    pub fn on_success(self, callback: impl FnOnce(T) + 'static) -> Self {
        let mut callback: Option<Box<dyn FnOnce(T)>> = Some(Box::new(callback));
        let ready = {
            let mut state = self.state.borrow_mut();
            match state.outcome.take() {
                Some(Ok(value)) => Some(value),
                other => {
                    state.outcome = other;
                    state.on_success = callback.take();
                    None
                }
            }
        };
        if let Some(value) = ready {
            if let Some(cb) = callback.take() {
                cb(value);
            }
            self.run_finalize();
        }
        self
    }

    /// Install the error callback. Fires immediately if the request already
    /// failed.
    pub fn on_error(self, callback: impl FnOnce(Error) + 'static) -> Self {
        let mut callback: Option<Box<dyn FnOnce(Error)>> = Some(Box::new(callback));
        let ready = {
            let mut state = self.state.borrow_mut();
            match state.outcome.take() {
                Some(Err(error)) => Some(error),
                other => {
                    state.outcome = other;
                    state.on_error = callback.take();
                    None
                }
            }
        };
        if let Some(error) = ready {
            if let Some(cb) = callback.take() {
                cb(error);
            }
            self.run_finalize();
        }
        self
    }

    /// Install the finalize callback, which fires after either outcome.
    pub fn on_finalize(self, callback: impl FnOnce() + 'static) -> Self {
        let mut callback = Some(callback);
        let fire_now = {
            let mut state = self.state.borrow_mut();
            if state.finalized {
                true
            } else {
                state.on_finalize = Some(Box::new(callback.take().unwrap()));
                false
            }
        };
        if fire_now {
            if let Some(cb) = callback.take() {
                cb();
            }
        }
        self
    }

    /// Whether an outcome (either way) has been recorded or delivered.
    pub fn is_settled(&self) -> bool {
        let state = self.state.borrow();
        state.finalized || state.outcome.is_some()
    }

    /// Record success and fire callbacks.
    pub fn resolve(&self, value: T) {
        let mut value = Some(value);
        let callback = {
            let mut state = self.state.borrow_mut();
            if state.finalized || state.outcome.is_some() {
                return;
            }
            match state.on_success.take() {
                Some(cb) => Some(cb),
                None => {
                    state.outcome = value.take().map(Ok);
                    None
                }
            }
        };
        if let (Some(cb), Some(value)) = (callback, value.take()) {
            cb(value);
        }
        self.run_finalize();
    }

    /// Record failure and fire callbacks.
    pub fn reject(&self, error: Error) {
        let mut error = Some(error);
        let callback = {
            let mut state = self.state.borrow_mut();
            if state.finalized || state.outcome.is_some() {
                return;
            }
            match state.on_error.take() {
                Some(cb) => Some(cb),
                None => {
                    state.outcome = error.take().map(Err);
                    None
                }
            }
        };
        if let (Some(cb), Some(error)) = (callback, error.take()) {
            cb(error);
        }
        self.run_finalize();
    }

    fn run_finalize(&self) {
        let callback = {
            let mut state = self.state.borrow_mut();
            state.finalized = true;
            state.on_finalize.take()
        };
        if let Some(cb) = callback {
            cb();
        }
    }
}

/// The reply to `queue.declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclared {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Outcome of one confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
}

/// Per-consumer callbacks, installed through [`DeferredConsumer`] and kept
/// by the channel for the lifetime of the subscription.
#[derive(Default)]
pub(crate) struct ConsumerHooks {
    pub on_message: Option<Box<dyn FnMut(Message)>>,
    pub on_cancelled: Option<Box<dyn FnMut(String)>>,
    pub on_begin: Option<Box<dyn FnMut()>>,
    pub on_size: Option<Box<dyn FnMut(u64)>>,
    pub on_data: Option<Box<dyn FnMut(&[u8])>>,
    pub on_complete: Option<Box<dyn FnMut()>>,
}

/// Result handle for `basic.consume`.
///
/// The success callback receives the consumer tag; the message callback
/// fires once per reassembled delivery, in delivery order. The optional
/// begin/size/data/complete callbacks observe reassembly of each delivery
/// as its frames arrive.
pub struct DeferredConsumer {
    pub(crate) started: Deferred<String>,
    pub(crate) hooks: Rc<RefCell<ConsumerHooks>>,
}

impl Clone for DeferredConsumer {
    fn clone(&self) -> Self {
        DeferredConsumer {
            started: self.started.clone(),
            hooks: Rc::clone(&self.hooks),
        }
    }
}

impl DeferredConsumer {
    pub(crate) fn new() -> Self {
        DeferredConsumer {
            started: Deferred::new(),
            hooks: Rc::new(RefCell::new(ConsumerHooks::default())),
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        DeferredConsumer {
            started: Deferred::failed(error),
            hooks: Rc::new(RefCell::new(ConsumerHooks::default())),
        }
    }

    /// Fires with the consumer tag once the subscription is active.
    pub fn on_success(self, callback: impl FnOnce(String) + 'static) -> Self {
        DeferredConsumer {
            started: self.started.on_success(callback),
            hooks: self.hooks,
        }
    }

    /// Fires if the subscription could not be established.
    pub fn on_error(self, callback: impl FnOnce(Error) + 'static) -> Self {
        DeferredConsumer {
            started: self.started.on_error(callback),
            hooks: self.hooks,
        }
    }

    /// Fires once per delivered message.
    pub fn on_message(self, callback: impl FnMut(Message) + 'static) -> Self {
        self.hooks.borrow_mut().on_message = Some(Box::new(callback));
        self
    }

    /// Fires when the server cancels the consumer.
    pub fn on_cancelled(self, callback: impl FnMut(String) + 'static) -> Self {
        self.hooks.borrow_mut().on_cancelled = Some(Box::new(callback));
        self
    }

    /// Fires when a delivery's method frame arrives, before any content.
    pub fn on_begin(self, callback: impl FnMut() + 'static) -> Self {
        self.hooks.borrow_mut().on_begin = Some(Box::new(callback));
        self
    }

    /// Fires with the announced body size when the header frame arrives.
    pub fn on_size(self, callback: impl FnMut(u64) + 'static) -> Self {
        self.hooks.borrow_mut().on_size = Some(Box::new(callback));
        self
    }

    /// Fires for every body frame chunk.
    pub fn on_data(self, callback: impl FnMut(&[u8]) + 'static) -> Self {
        self.hooks.borrow_mut().on_data = Some(Box::new(callback));
        self
    }

    /// Fires when the body is complete, before the message callback.
    pub fn on_complete(self, callback: impl FnMut() + 'static) -> Self {
        self.hooks.borrow_mut().on_complete = Some(Box::new(callback));
        self
    }
}

#[derive(Default)]
struct GetSlots {
    on_message: Option<Box<dyn FnOnce(Message)>>,
    on_empty: Option<Box<dyn FnOnce()>>,
}

/// Result handle for `basic.get`: a message, or word that the queue is
/// empty.
pub struct DeferredGet {
    pub(crate) inner: Deferred<Option<Message>>,
    slots: Rc<RefCell<GetSlots>>,
}

impl Clone for DeferredGet {
    fn clone(&self) -> Self {
        DeferredGet {
            inner: self.inner.clone(),
            slots: Rc::clone(&self.slots),
        }
    }
}

impl DeferredGet {
    pub(crate) fn new() -> Self {
        let slots: Rc<RefCell<GetSlots>> = Rc::new(RefCell::new(GetSlots::default()));
        let dispatch = Rc::clone(&slots);
        let inner = Deferred::new().on_success(move |got: Option<Message>| {
            let slot = match &got {
                Some(_) => dispatch.borrow_mut().on_message.take().map(SlotEither::Message),
                None => dispatch.borrow_mut().on_empty.take().map(SlotEither::Empty),
            };
            match (slot, got) {
                (Some(SlotEither::Message(cb)), Some(message)) => cb(message),
                (Some(SlotEither::Empty(cb)), None) => cb(),
                _ => {}
            }
        });
        DeferredGet { inner, slots }
    }

    pub(crate) fn failed(error: Error) -> Self {
        DeferredGet {
            inner: Deferred::failed(error),
            slots: Rc::new(RefCell::new(GetSlots::default())),
        }
    }

    /// Fires with the message when the queue had one.
    pub fn on_message(self, callback: impl FnOnce(Message) + 'static) -> Self {
        self.slots.borrow_mut().on_message = Some(Box::new(callback));
        self
    }

    /// Fires when the queue was empty.
    pub fn on_empty(self, callback: impl FnOnce() + 'static) -> Self {
        self.slots.borrow_mut().on_empty = Some(Box::new(callback));
        self
    }

    /// Fires on failure.
    pub fn on_error(self, callback: impl FnOnce(Error) + 'static) -> Self {
        DeferredGet {
            inner: self.inner.on_error(callback),
            slots: self.slots,
        }
    }
}

enum SlotEither {
    Message(Box<dyn FnOnce(Message)>),
    Empty(Box<dyn FnOnce()>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_callback_installed_before_resolution() {
        let seen = Rc::new(Cell::new(0u32));
        let seen2 = Rc::clone(&seen);

        let deferred: Deferred<u32> = Deferred::new();
        let deferred = deferred.on_success(move |v| seen2.set(v));
        assert!(!deferred.is_settled());

        deferred.resolve(12);
        assert_eq!(seen.get(), 12);
        assert!(deferred.is_settled());
    }

    #[test]
    fn test_callback_installed_after_resolution_fires_immediately() {
        let seen = Rc::new(Cell::new(0u32));
        let seen2 = Rc::clone(&seen);

        let deferred: Deferred<u32> = Deferred::new();
        deferred.resolve(7);
        deferred.clone().on_success(move |v| seen2.set(v));
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_error_path_and_finalize_order() {
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        let l2 = Rc::clone(&log);
        let l3 = Rc::clone(&log);

        let deferred: Deferred<()> = Deferred::new();
        let deferred = deferred
            .on_success(move |_| l1.borrow_mut().push("success"))
            .on_error(move |_| l2.borrow_mut().push("error"))
            .on_finalize(move || l3.borrow_mut().push("finalize"));

        deferred.reject(Error::channel(404, "NOT_FOUND"));
        assert_eq!(*log.borrow(), vec!["error", "finalize"]);
    }

    #[test]
    fn test_each_slot_fires_at_most_once() {
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);

        let deferred: Deferred<u32> = Deferred::new();
        let deferred = deferred.on_success(move |_| c.set(c.get() + 1));
        deferred.resolve(1);
        deferred.resolve(2);
        deferred.reject(Error::usage("late"));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_already_resolved_constructor() {
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        Deferred::resolved(()).on_success(move |_| s.set(true));
        assert!(seen.get());
    }

    #[test]
    fn test_callback_may_reenter_the_deferred() {
        let deferred: Deferred<u32> = Deferred::new();
        let clone = deferred.clone();
        let deferred = deferred.on_success(move |_| {
            // a second resolve from inside the callback is a quiet no-op
            clone.resolve(99);
        });
        deferred.resolve(1);
        assert!(deferred.is_settled());
    }

    #[test]
    fn test_deferred_get_empty_path() {
        let empty = Rc::new(Cell::new(false));
        let e = Rc::clone(&empty);

        let get = DeferredGet::new();
        let get = get
            .on_message(|_| panic!("no message expected"))
            .on_empty(move || e.set(true));
        get.inner.resolve(None);
        assert!(empty.get());
    }
}
