//! Publisher Confirms
//!
//! After `confirm.select`, the channel numbers outbound publishes with
//! sequential delivery tags starting at 1 and the broker answers each one
//! with `basic.ack` or `basic.nack`. A `multiple` flag acknowledges every
//! outstanding tag up to and including the named one.
//!
//! [`Confirms`] is the per-channel tag ledger. [`Throttle`] is an optional
//! layer that holds publishes back once too many are outstanding, releasing
//! them as confirms arrive.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::channel::{Channel, PublishFlags};
use crate::deferred::{Confirm, Deferred};
use crate::error::{Error, Result};
use crate::message::Envelope;

/// The per-channel confirm ledger.
#[derive(Default)]
pub(crate) struct Confirms {
    enabled: bool,
    next_tag: u64,
    pending: BTreeMap<u64, Deferred<Confirm>>,
}

impl Confirms {
    pub fn new() -> Self {
        Confirms::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch the ledger on; the next publish gets tag 1.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.next_tag = 1;
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Assign the next delivery tag to a publish and remember its deferred.
    pub fn register(&mut self) -> (u64, Deferred<Confirm>) {
        let tag = self.next_tag;
        self.next_tag += 1;
        let deferred = Deferred::new();
        self.pending.insert(tag, deferred.clone());
        (tag, deferred)
    }

    /// Detach the deferreds a `basic.ack` or `basic.nack` settles, in
    /// ascending tag order.
    ///
    /// The caller resolves them *after* releasing its borrow of this
    /// ledger, so confirm callbacks may publish again. A tag with nothing
    /// outstanding is a protocol error.
    pub fn settle(&mut self, delivery_tag: u64, multiple: bool) -> Result<Vec<Deferred<Confirm>>> {
        let settled: Vec<Deferred<Confirm>> = if multiple {
            let keys: Vec<u64> = self.pending.range(..=delivery_tag).map(|(k, _)| *k).collect();
            keys.into_iter()
                .filter_map(|k| self.pending.remove(&k))
                .collect()
        } else {
            self.pending.remove(&delivery_tag).into_iter().collect()
        };

        if settled.is_empty() {
            return Err(Error::protocol(format!(
                "confirm for delivery tag {} with nothing outstanding",
                delivery_tag
            )));
        }
        Ok(settled)
    }

    /// Detach every outstanding publish, in ascending tag order, for the
    /// caller to fail once its borrow is released.
    pub fn drain(&mut self) -> Vec<Deferred<Confirm>> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

struct QueuedPublish {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    flags: PublishFlags,
    confirm: Deferred<Confirm>,
}

struct ThrottleState {
    outstanding: usize,
    queued: VecDeque<QueuedPublish>,
}

/// Holds publishes back once more than `limit` are awaiting confirmation.
///
/// Queued publishes are released in order as confirms (either outcome)
/// arrive. The channel must already be in confirm mode.
pub struct Throttle {
    channel: Channel,
    limit: usize,
    state: Rc<RefCell<ThrottleState>>,
}

impl Throttle {
    pub fn new(channel: &Channel, limit: usize) -> Self {
        Throttle {
            channel: channel.clone(),
            limit: limit.max(1),
            state: Rc::new(RefCell::new(ThrottleState {
                outstanding: 0,
                queued: VecDeque::new(),
            })),
        }
    }

    /// How many publishes are waiting for a confirm right now.
    pub fn outstanding(&self) -> usize {
        self.state.borrow().outstanding
    }

    /// How many publishes are queued locally, not yet on the wire.
    pub fn queued(&self) -> usize {
        self.state.borrow().queued.len()
    }

    /// Publish through the throttle.
    ///
    /// The returned deferred resolves with the broker's verdict once the
    /// publish has actually been sent and confirmed.
    pub fn publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
        flags: PublishFlags,
    ) -> Deferred<Confirm> {
        let confirm = Deferred::new();
        let request = QueuedPublish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            envelope,
            flags,
            confirm: confirm.clone(),
        };

        let ready = {
            let mut state = self.state.borrow_mut();
            if state.outstanding < self.limit && state.queued.is_empty() {
                state.outstanding += 1;
                Some(request)
            } else {
                state.queued.push_back(request);
                None
            }
        };
        if let Some(request) = ready {
            self.send(request);
        }
        confirm
    }

    fn send(&self, request: QueuedPublish) {
        let QueuedPublish {
            exchange,
            routing_key,
            envelope,
            flags,
            confirm,
        } = request;

        let published = self
            .channel
            .publish(exchange.as_str(), routing_key.as_str(), envelope, flags);
        match published {
            Ok(publication) => {
                let on_settle = confirm.clone();
                let throttle = self.shallow_clone();
                let on_fail = self.shallow_clone();
                publication
                    .on_confirm(move |outcome| {
                        on_settle.resolve(outcome);
                        throttle.release();
                    })
                    .on_error(move |error| {
                        confirm.reject(error);
                        on_fail.release();
                    });
            }
            Err(error) => {
                self.state.borrow_mut().outstanding -= 1;
                confirm.reject(error);
            }
        }
    }

    fn release(&self) {
        let next = {
            let mut state = self.state.borrow_mut();
            state.outstanding -= 1;
            if state.outstanding < self.limit {
                let next = state.queued.pop_front();
                if next.is_some() {
                    state.outstanding += 1;
                }
                next
            } else {
                None
            }
        };
        if let Some(request) = next {
            self.send(request);
        }
    }

    fn shallow_clone(&self) -> Throttle {
        Throttle {
            channel: self.channel.clone(),
            limit: self.limit,
            state: Rc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_register_assigns_sequential_tags_from_one() {
        let mut confirms = Confirms::new();
        confirms.enable();
        assert_eq!(confirms.register().0, 1);
        assert_eq!(confirms.register().0, 2);
        assert_eq!(confirms.register().0, 3);
        assert_eq!(confirms.outstanding(), 3);
    }

    #[test]
    fn test_single_ack_settles_only_that_tag() {
        let mut confirms = Confirms::new();
        confirms.enable();
        let (_, first) = confirms.register();
        let (tag, second) = confirms.register();

        let outcome = Rc::new(Cell::new(None));
        let o = Rc::clone(&outcome);
        second.on_success(move |c| o.set(Some(c)));

        for deferred in confirms.settle(tag, false).unwrap() {
            deferred.resolve(Confirm::Ack);
        }
        assert_eq!(outcome.get(), Some(Confirm::Ack));
        assert_eq!(confirms.outstanding(), 1);
        assert!(!first.is_settled());
    }

    #[test]
    fn test_multiple_ack_settles_everything_up_to_tag_in_order() {
        let mut confirms = Confirms::new();
        confirms.enable();
        let order: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let mut deferreds = Vec::new();
        for _ in 0..3 {
            let (tag, deferred) = confirms.register();
            let order = Rc::clone(&order);
            deferreds.push(deferred.on_success(move |_| order.borrow_mut().push(tag)));
        }

        for deferred in confirms.settle(2, true).unwrap() {
            deferred.resolve(Confirm::Ack);
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(confirms.outstanding(), 1);
    }

    #[test]
    fn test_nack_resolves_with_nack() {
        let mut confirms = Confirms::new();
        confirms.enable();
        let (tag, deferred) = confirms.register();

        let outcome = Rc::new(Cell::new(None));
        let o = Rc::clone(&outcome);
        deferred.on_success(move |c| o.set(Some(c)));

        for deferred in confirms.settle(tag, false).unwrap() {
            deferred.resolve(Confirm::Nack);
        }
        assert_eq!(outcome.get(), Some(Confirm::Nack));
    }

    #[test]
    fn test_confirm_without_outstanding_tag_is_a_protocol_error() {
        let mut confirms = Confirms::new();
        confirms.enable();
        let err = confirms.settle(5, false).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_drain_detaches_every_outstanding_publish() {
        let mut confirms = Confirms::new();
        confirms.enable();
        let failures = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let (_, deferred) = confirms.register();
            let failures = Rc::clone(&failures);
            deferred.on_error(move |_| failures.set(failures.get() + 1));
        }

        for deferred in confirms.drain() {
            deferred.reject(Error::channel(404, "NOT_FOUND"));
        }
        assert_eq!(failures.get(), 3);
        assert_eq!(confirms.outstanding(), 0);
    }
}
