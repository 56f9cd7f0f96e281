//! AMQP 0-9-1 Channel Engine
//!
//! A channel is a lightweight multiplex over one connection with its own
//! state machine. This module implements the per-channel request queue with
//! synchronous gating, the consumer table, message reassembly across
//! method/header/body frames, publish fragmentation, and publisher confirms.
//!
//! # Synchronous gating
//!
//! Most management methods are synchronous: the channel may have at most one
//! of them awaiting its `*-ok` reply at any time. While a reply is
//! outstanding, further synchronous frames wait in an outbound backlog;
//! asynchronous frames (publishes, acks) bypass the backlog and go straight
//! out. Replies therefore arrive in request order and resolve the deferred
//! at the head of the pending queue.
//!
//! # Examples
//!
//! ```rust,no_run
//! use warren_amqp::channel::QueueDeclareFlags;
//! # fn demo(channel: warren_amqp::channel::Channel) {
//! channel
//!     .queue_declare("jobs", QueueDeclareFlags::new().durable(), Default::default())
//!     .on_success(|declared| {
//!         println!("{} has {} messages", declared.queue, declared.message_count);
//!     });
//! # }
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::confirms::Confirms;
use crate::connection::ConnectionInner;
use crate::deferred::{
    Confirm, ConsumerHooks, Deferred, DeferredConsumer, DeferredGet, QueueDeclared,
};
use crate::error::{Error, Result};
use crate::frame::{Frame, FRAME_OVERHEAD};
use crate::message::{BasicProperties, DeliveryKind, Envelope, Message};
use crate::method::{class, Method};
use crate::types::FieldTable;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Usable; requests may still be queued behind the open handshake.
    Open,
    /// `channel.close` sent, awaiting `close-ok`.
    Closing,
    /// Detached; every operation fails locally.
    Closed,
}

/// Flags for `exchange.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeDeclareFlags {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
}

impl ExchangeDeclareFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Flags for `exchange.delete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeDeleteFlags {
    pub if_unused: bool,
    pub no_wait: bool,
}

impl ExchangeDeleteFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_unused(mut self) -> Self {
        self.if_unused = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Flags for `queue.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeclareFlags {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
}

impl QueueDeclareFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Flags for `queue.delete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeleteFlags {
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

impl QueueDeleteFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_unused(mut self) -> Self {
        self.if_unused = true;
        self
    }

    pub fn if_empty(mut self) -> Self {
        self.if_empty = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Flags for `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeFlags {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl ConsumeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Flags for `basic.publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

impl PublishFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

/// Handle to one accepted publish.
///
/// In confirm mode it carries the assigned delivery tag and a deferred that
/// resolves with the broker's [`Confirm`] verdict; outside confirm mode both
/// are absent and the callbacks never fire.
pub struct Publication {
    delivery_tag: Option<u64>,
    confirm: Option<Deferred<Confirm>>,
}

impl Publication {
    /// The sequence number assigned in confirm mode.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    /// Fires with the broker's ack/nack verdict (confirm mode only).
    pub fn on_confirm(self, callback: impl FnOnce(Confirm) + 'static) -> Self {
        Publication {
            delivery_tag: self.delivery_tag,
            confirm: self.confirm.map(|c| c.on_success(callback)),
        }
    }

    /// Fires if the channel dies before the verdict arrives.
    pub fn on_error(self, callback: impl FnOnce(Error) + 'static) -> Self {
        Publication {
            delivery_tag: self.delivery_tag,
            confirm: self.confirm.map(|c| c.on_error(callback)),
        }
    }
}

/// One entry of the expected-reply FIFO.
enum Pending {
    Open(Deferred<()>),
    Close(Deferred<()>),
    Flow(Deferred<bool>),
    ExchangeDeclare(Deferred<()>),
    ExchangeDelete(Deferred<()>),
    ExchangeBind(Deferred<()>),
    ExchangeUnbind(Deferred<()>),
    QueueDeclare(Deferred<QueueDeclared>),
    QueueBind(Deferred<()>),
    QueuePurge(Deferred<u32>),
    QueueDelete(Deferred<u32>),
    QueueUnbind(Deferred<()>),
    Qos(Deferred<()>),
    Consume(DeferredConsumer),
    Cancel(Deferred<String>),
    Get(DeferredGet),
    Recover(Deferred<()>),
    ConfirmSelect(Deferred<()>),
    TxSelect(Deferred<()>),
    TxCommit(Deferred<()>),
    TxRollback(Deferred<()>),
}

impl Pending {
    fn reject(self, error: Error) {
        match self {
            Pending::Open(d) | Pending::Close(d) | Pending::ExchangeDeclare(d)
            | Pending::ExchangeDelete(d) | Pending::ExchangeBind(d)
            | Pending::ExchangeUnbind(d) | Pending::QueueBind(d) | Pending::QueueUnbind(d)
            | Pending::Qos(d) | Pending::Recover(d) | Pending::ConfirmSelect(d)
            | Pending::TxSelect(d) | Pending::TxCommit(d) | Pending::TxRollback(d) => {
                d.reject(error)
            }
            Pending::Flow(d) => d.reject(error),
            Pending::QueueDeclare(d) => d.reject(error),
            Pending::QueuePurge(d) | Pending::QueueDelete(d) => d.reject(error),
            Pending::Consume(d) => d.started.reject(error),
            Pending::Cancel(d) => d.reject(error),
            Pending::Get(d) => d.inner.reject(error),
        }
    }
}

/// A frame (or contiguous frame group) parked behind the gating flag.
struct Backlogged {
    bytes: BytesMut,
    starts_wait: bool,
}

/// A message being rebuilt from method + header + body frames.
struct Assembly {
    kind: AssemblyKind,
    header_seen: bool,
    body_size: u64,
    body: BytesMut,
    properties: BasicProperties,
}

enum AssemblyKind {
    Deliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    Get {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
        deferred: DeferredGet,
    },
    Return {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
}

pub(crate) struct ChannelInner {
    id: u16,
    connection: Weak<ConnectionInner>,
    state: Cell<ChannelState>,
    /// True while a synchronous reply is outstanding.
    waiting: Cell<bool>,
    pending: RefCell<VecDeque<Pending>>,
    backlog: RefCell<VecDeque<Backlogged>>,
    consumers: RefCell<HashMap<String, Rc<RefCell<ConsumerHooks>>>>,
    assembly: RefCell<Option<Assembly>>,
    confirms: RefCell<Confirms>,
    opened: Deferred<()>,
    on_error: RefCell<Option<Box<dyn FnMut(Error)>>>,
    on_return: RefCell<Option<Box<dyn FnMut(Message)>>>,
}

/// Main entry point for AMQP operations.
///
/// Obtained from [`Connection::open_channel`]. Cloning hands out another
/// handle to the same channel.
///
/// [`Connection::open_channel`]: crate::connection::Connection::open_channel
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

impl Channel {
    pub(crate) fn open(connection: &Rc<ConnectionInner>, id: u16) -> Channel {
        let inner = Rc::new(ChannelInner {
            id,
            connection: Rc::downgrade(connection),
            state: Cell::new(ChannelState::Open),
            waiting: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            backlog: RefCell::new(VecDeque::new()),
            consumers: RefCell::new(HashMap::new()),
            assembly: RefCell::new(None),
            confirms: RefCell::new(Confirms::new()),
            opened: Deferred::new(),
            on_error: RefCell::new(None),
            on_return: RefCell::new(None),
        });
        inner.send_sync(Method::ChannelOpen, Pending::Open(inner.opened.clone()));
        Channel { inner }
    }

    /// Install a callback for the moment the server acknowledges the
    /// channel open.
    pub fn on_open(&self, callback: impl FnOnce() + 'static) {
        self.inner.opened.clone().on_success(move |_| callback());
    }

    pub(crate) fn internal(&self) -> &Rc<ChannelInner> {
        &self.inner
    }

    /// The channel id on the wire.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    /// Install the channel-level error callback, fired when the server
    /// closes the channel or the connection fails.
    pub fn on_error(&self, callback: impl FnMut(Error) + 'static) {
        *self.inner.on_error.borrow_mut() = Some(Box::new(callback));
    }

    /// Install the callback for returned mandatory/immediate publishes.
    pub fn on_return(&self, callback: impl FnMut(Message) + 'static) {
        *self.inner.on_return.borrow_mut() = Some(Box::new(callback));
    }

    /// Close the channel and detach it from the connection.
    pub fn close(&self) -> Deferred<()> {
        if self.inner.state.get() != ChannelState::Open {
            return Deferred::failed(Error::usage("channel is already closing or closed"));
        }
        self.inner.state.set(ChannelState::Closing);
        let deferred = Deferred::new();
        self.inner.send_sync(
            Method::ChannelClose {
                reply_code: 0,
                reply_text: String::new(),
                failing_class: 0,
                failing_method: 0,
            },
            Pending::Close(deferred.clone()),
        );
        deferred
    }

    /// Pause or resume delivery on this channel.
    pub fn flow(&self, active: bool) -> Deferred<bool> {
        self.inner
            .request(Method::ChannelFlow { active }, Pending::Flow)
    }

    /// Declare an exchange.
    pub fn exchange_declare(
        &self,
        exchange: impl Into<String>,
        kind: impl Into<String>,
        flags: ExchangeDeclareFlags,
        arguments: FieldTable,
    ) -> Deferred<()> {
        let method = Method::ExchangeDeclare {
            exchange: exchange.into(),
            kind: kind.into(),
            passive: flags.passive,
            durable: flags.durable,
            auto_delete: flags.auto_delete,
            internal: flags.internal,
            no_wait: flags.no_wait,
            arguments,
        };
        if flags.no_wait {
            self.inner.fire_and_forget(method)
        } else {
            self.inner.request(method, Pending::ExchangeDeclare)
        }
    }

    /// Delete an exchange.
    pub fn exchange_delete(
        &self,
        exchange: impl Into<String>,
        flags: ExchangeDeleteFlags,
    ) -> Deferred<()> {
        let method = Method::ExchangeDelete {
            exchange: exchange.into(),
            if_unused: flags.if_unused,
            no_wait: flags.no_wait,
        };
        if flags.no_wait {
            self.inner.fire_and_forget(method)
        } else {
            self.inner.request(method, Pending::ExchangeDelete)
        }
    }

    /// Bind an exchange to an exchange.
    pub fn exchange_bind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Deferred<()> {
        let method = Method::ExchangeBind {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            no_wait,
            arguments,
        };
        if no_wait {
            self.inner.fire_and_forget(method)
        } else {
            self.inner.request(method, Pending::ExchangeBind)
        }
    }

    /// Remove an exchange-to-exchange binding.
    pub fn exchange_unbind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Deferred<()> {
        let method = Method::ExchangeUnbind {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            no_wait,
            arguments,
        };
        if no_wait {
            self.inner.fire_and_forget(method)
        } else {
            self.inner.request(method, Pending::ExchangeUnbind)
        }
    }

    /// Declare a queue. The success callback receives the queue name (which
    /// the server invents when `queue` is empty) and its message and
    /// consumer counts.
    pub fn queue_declare(
        &self,
        queue: impl Into<String>,
        flags: QueueDeclareFlags,
        arguments: FieldTable,
    ) -> Deferred<QueueDeclared> {
        let queue = queue.into();
        let method = Method::QueueDeclare {
            queue: queue.clone(),
            passive: flags.passive,
            durable: flags.durable,
            exclusive: flags.exclusive,
            auto_delete: flags.auto_delete,
            no_wait: flags.no_wait,
            arguments,
        };
        if flags.no_wait {
            let settled = QueueDeclared {
                queue,
                message_count: 0,
                consumer_count: 0,
            };
            self.inner.fire_and_forget_with(method, settled)
        } else {
            self.inner.request(method, Pending::QueueDeclare)
        }
    }

    /// Bind a queue to an exchange.
    pub fn queue_bind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Deferred<()> {
        let method = Method::QueueBind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            no_wait,
            arguments,
        };
        if no_wait {
            self.inner.fire_and_forget(method)
        } else {
            self.inner.request(method, Pending::QueueBind)
        }
    }

    /// Remove a queue binding.
    pub fn queue_unbind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Deferred<()> {
        let method = Method::QueueUnbind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments,
        };
        self.inner.request(method, Pending::QueueUnbind)
    }

    /// Drop every message in a queue. Resolves with the purged count.
    pub fn queue_purge(&self, queue: impl Into<String>, no_wait: bool) -> Deferred<u32> {
        let method = Method::QueuePurge {
            queue: queue.into(),
            no_wait,
        };
        if no_wait {
            self.inner.fire_and_forget_with(method, 0)
        } else {
            self.inner.request(method, Pending::QueuePurge)
        }
    }

    /// Delete a queue. Resolves with the number of messages discarded.
    pub fn queue_delete(&self, queue: impl Into<String>, flags: QueueDeleteFlags) -> Deferred<u32> {
        let method = Method::QueueDelete {
            queue: queue.into(),
            if_unused: flags.if_unused,
            if_empty: flags.if_empty,
            no_wait: flags.no_wait,
        };
        if flags.no_wait {
            self.inner.fire_and_forget_with(method, 0)
        } else {
            self.inner.request(method, Pending::QueueDelete)
        }
    }

    /// Bound the number of unacknowledged deliveries the server pushes.
    pub fn qos(&self, prefetch_count: u16, global: bool) -> Deferred<()> {
        self.inner.request(
            Method::BasicQos {
                prefetch_size: 0,
                prefetch_count,
                global,
            },
            Pending::Qos,
        )
    }

    /// Start a consumer on a queue.
    ///
    /// With an empty `consumer_tag` the server names the subscription,
    /// unless `no_wait` is set, in which case a local tag is generated
    /// (the server would have no way to tell us its choice).
    pub fn consume(
        &self,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        flags: ConsumeFlags,
        arguments: FieldTable,
    ) -> DeferredConsumer {
        let mut consumer_tag = consumer_tag.into();
        if flags.no_wait && consumer_tag.is_empty() {
            consumer_tag = format!("ctag-{}", uuid::Uuid::new_v4());
        }
        let method = Method::BasicConsume {
            queue: queue.into(),
            consumer_tag: consumer_tag.clone(),
            no_local: flags.no_local,
            no_ack: flags.no_ack,
            exclusive: flags.exclusive,
            no_wait: flags.no_wait,
            arguments,
        };

        if let Err(error) = self.inner.ensure_usable() {
            return DeferredConsumer::failed(error);
        }
        let deferred = DeferredConsumer::new();
        if flags.no_wait {
            if let Err(error) = self.inner.send_async_method(method) {
                return DeferredConsumer::failed(error);
            }
            self.inner
                .consumers
                .borrow_mut()
                .insert(consumer_tag.clone(), Rc::clone(&deferred.hooks));
            deferred.started.resolve(consumer_tag);
        } else {
            self.inner.send_sync(method, Pending::Consume(deferred.clone()));
        }
        deferred
    }

    /// Cancel a consumer. Resolves with the cancelled tag.
    pub fn cancel(&self, consumer_tag: impl Into<String>, no_wait: bool) -> Deferred<String> {
        let consumer_tag = consumer_tag.into();
        let method = Method::BasicCancel {
            consumer_tag: consumer_tag.clone(),
            no_wait,
        };
        if no_wait {
            let deferred = self.inner.fire_and_forget_with(method, consumer_tag.clone());
            self.inner.remove_consumer(&consumer_tag);
            deferred
        } else {
            self.inner.request(method, Pending::Cancel)
        }
    }

    /// Publish a message.
    ///
    /// Emits the method frame, a header frame carrying the body size and
    /// property flags, and as many body frames as the negotiated max-frame
    /// requires, contiguously.
    pub fn publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
        flags: PublishFlags,
    ) -> Result<Publication> {
        self.inner.ensure_usable()?;
        let connection = self.inner.upgrade()?;

        let method = Method::BasicPublish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: flags.mandatory,
            immediate: flags.immediate,
        };

        let mut bytes = BytesMut::new();
        Frame::Method {
            channel: self.inner.id,
            method,
        }
        .encode(&mut bytes)?;
        Frame::Header {
            channel: self.inner.id,
            class_id: class::BASIC,
            body_size: envelope.body.len() as u64,
            properties: envelope.properties,
        }
        .encode(&mut bytes)?;

        let chunk_limit = match connection.frame_max() {
            0 => usize::MAX,
            max => (max as usize).saturating_sub(FRAME_OVERHEAD).max(1),
        };
        for chunk in envelope.body.chunks(chunk_limit) {
            Frame::Body {
                channel: self.inner.id,
                payload: chunk.to_vec(),
            }
            .encode(&mut bytes)?;
        }

        connection.send_channel_frames(&bytes)?;
        trace!("channel {} published {} body bytes", self.inner.id, bytes.len());

        let mut confirms = self.inner.confirms.borrow_mut();
        if confirms.is_enabled() {
            let (tag, deferred) = confirms.register();
            Ok(Publication {
                delivery_tag: Some(tag),
                confirm: Some(deferred),
            })
        } else {
            Ok(Publication {
                delivery_tag: None,
                confirm: None,
            })
        }
    }

    /// Fetch a single message without a consumer.
    pub fn get(&self, queue: impl Into<String>, no_ack: bool) -> DeferredGet {
        let method = Method::BasicGet {
            queue: queue.into(),
            no_ack,
        };
        if let Err(error) = self.inner.ensure_usable() {
            return DeferredGet::failed(error);
        }
        let deferred = DeferredGet::new();
        self.inner.send_sync(method, Pending::Get(deferred.clone()));
        deferred
    }

    /// Acknowledge a delivery, or with `multiple` everything up to and
    /// including it. Fire-and-forget.
    pub fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner.send_async_method(Method::BasicAck {
            delivery_tag,
            multiple,
        })
    }

    /// Negatively acknowledge one or more deliveries. Fire-and-forget.
    pub fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner.send_async_method(Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        })
    }

    /// Reject a single delivery. Fire-and-forget.
    pub fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner.send_async_method(Method::BasicReject {
            delivery_tag,
            requeue,
        })
    }

    /// Redeliver unacknowledged messages, waiting for the server to agree.
    pub fn recover(&self, requeue: bool) -> Deferred<()> {
        self.inner
            .request(Method::BasicRecover { requeue }, Pending::Recover)
    }

    /// Legacy fire-and-forget recover; no reply is ever expected.
    pub fn recover_async(&self, requeue: bool) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner
            .send_async_method(Method::BasicRecoverAsync { requeue })
    }

    /// Put the channel in publisher-confirm mode.
    pub fn confirm_select(&self) -> Deferred<()> {
        self.inner.request(
            Method::ConfirmSelect { no_wait: false },
            Pending::ConfirmSelect,
        )
    }

    /// Start a transaction on this channel.
    pub fn tx_select(&self) -> Deferred<()> {
        self.inner.request(Method::TxSelect, Pending::TxSelect)
    }

    /// Commit the open transaction.
    pub fn tx_commit(&self) -> Deferred<()> {
        self.inner.request(Method::TxCommit, Pending::TxCommit)
    }

    /// Roll back the open transaction.
    pub fn tx_rollback(&self) -> Deferred<()> {
        self.inner.request(Method::TxRollback, Pending::TxRollback)
    }
}

impl ChannelInner {
    fn upgrade(&self) -> Result<Rc<ConnectionInner>> {
        self.connection
            .upgrade()
            .ok_or_else(|| Error::usage("connection is gone"))
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state.get() {
            ChannelState::Open => Ok(()),
            ChannelState::Closing => Err(Error::usage("channel is closing")),
            ChannelState::Closed => Err(Error::usage("channel is closed")),
        }
    }

    /// Issue a synchronous request with a typed deferred.
    fn request<T: 'static>(
        &self,
        method: Method,
        wrap: impl FnOnce(Deferred<T>) -> Pending,
    ) -> Deferred<T> {
        if let Err(error) = self.ensure_usable() {
            return Deferred::failed(error);
        }
        let deferred = Deferred::new();
        self.send_sync(method, wrap(deferred.clone()));
        deferred
    }

    /// Send a `no-wait` request: nothing is expected back, the deferred
    /// resolves as soon as the frame is out.
    fn fire_and_forget(&self, method: Method) -> Deferred<()> {
        self.fire_and_forget_with(method, ())
    }

    fn fire_and_forget_with<T: 'static>(&self, method: Method, value: T) -> Deferred<T> {
        if let Err(error) = self.ensure_usable() {
            return Deferred::failed(error);
        }
        match self.send_async_method(method) {
            Ok(()) => Deferred::resolved(value),
            Err(error) => Deferred::failed(error),
        }
    }

    /// Encode and send a synchronous method, or park it behind the gate.
    fn send_sync(&self, method: Method, pending: Pending) {
        let mut bytes = BytesMut::new();
        let encoded = Frame::Method {
            channel: self.id,
            method,
        }
        .encode(&mut bytes);
        if let Err(error) = encoded {
            self.pending_reject_one(pending, error);
            return;
        }

        self.pending.borrow_mut().push_back(pending);
        if self.waiting.get() {
            self.backlog.borrow_mut().push_back(Backlogged {
                bytes,
                starts_wait: true,
            });
            return;
        }
        self.waiting.set(true);
        if let Err(error) = self.transmit(&bytes) {
            self.waiting.set(false);
            let entry = self.pending.borrow_mut().pop_back();
            if let Some(entry) = entry {
                entry.reject(error);
            }
        }
    }

    fn pending_reject_one(&self, pending: Pending, error: Error) {
        pending.reject(error);
    }

    /// Encode and send an asynchronous method immediately.
    fn send_async_method(&self, method: Method) -> Result<()> {
        let mut bytes = BytesMut::new();
        Frame::Method {
            channel: self.id,
            method,
        }
        .encode(&mut bytes)?;
        self.transmit(&bytes)
    }

    fn transmit(&self, bytes: &[u8]) -> Result<()> {
        self.upgrade()?.send_channel_frames(bytes)
    }

    /// The matching reply arrived: let backlogged frames out until the next
    /// synchronous one (or the backlog runs dry).
    fn release_backlog(&self) {
        loop {
            let entry = self.backlog.borrow_mut().pop_front();
            match entry {
                None => {
                    self.waiting.set(false);
                    return;
                }
                Some(entry) => {
                    if self.transmit(&entry.bytes).is_err() {
                        // connection went away; pending entries fail with it
                        self.waiting.set(false);
                        return;
                    }
                    if entry.starts_wait {
                        return;
                    }
                }
            }
        }
    }

    fn remove_consumer(&self, consumer_tag: &str) -> Option<Rc<RefCell<ConsumerHooks>>> {
        self.consumers.borrow_mut().remove(consumer_tag)
    }

    /// Resolve confirm deferreds with the ledger borrow already released,
    /// so a confirm callback may immediately publish again.
    fn settle_confirms(&self, delivery_tag: u64, multiple: bool, outcome: Confirm) -> Result<()> {
        let settled = self.confirms.borrow_mut().settle(delivery_tag, multiple)?;
        for deferred in settled {
            deferred.resolve(outcome);
        }
        Ok(())
    }

    /// Route one inbound frame for this channel.
    pub(crate) fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Method { method, .. } => self.handle_method(method),
            Frame::Header {
                body_size,
                properties,
                ..
            } => self.handle_header(body_size, properties),
            Frame::Body { payload, .. } => self.handle_body(payload),
            Frame::Heartbeat => Err(Error::protocol("heartbeat on a non-zero channel")),
        }
    }

    fn handle_method(&self, method: Method) -> Result<()> {
        match method {
            // server-initiated traffic that bypasses the pending queue
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => self.begin_assembly(AssemblyKind::Deliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            }),
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => self.begin_assembly(AssemblyKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            }),
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => self.settle_confirms(delivery_tag, multiple, Confirm::Ack),
            Method::BasicNack {
                delivery_tag,
                multiple,
                ..
            } => self.settle_confirms(delivery_tag, multiple, Confirm::Nack),
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                debug!("server cancelled consumer {}", consumer_tag);
                if let Some(hooks) = self.remove_consumer(&consumer_tag) {
                    fire_cancel_hook(&hooks, consumer_tag.clone());
                }
                if !no_wait {
                    self.send_async_method(Method::BasicCancelOk { consumer_tag })?;
                }
                Ok(())
            }
            Method::ChannelFlow { active } => {
                self.send_async_method(Method::ChannelFlowOk { active })
            }
            Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                let error = Error::channel(reply_code, reply_text);
                let close_ok = self.send_async_method(Method::ChannelCloseOk);
                self.fail(&error);
                if let Ok(connection) = self.upgrade() {
                    connection.forget_channel(self.id);
                }
                close_ok
            }

            // everything else answers the head of the pending queue
            reply => self.handle_reply(reply),
        }
    }

    fn handle_reply(&self, reply: Method) -> Result<()> {
        let pending = self.pending.borrow_mut().pop_front();
        let Some(pending) = pending else {
            return Err(Error::protocol(format!(
                "reply {:?} with no outstanding request on channel {}",
                reply.method_id(),
                self.id
            )));
        };

        match (pending, reply) {
            (Pending::Open(d), Method::ChannelOpenOk) => d.resolve(()),
            (Pending::Close(d), Method::ChannelCloseOk) => {
                self.state.set(ChannelState::Closed);
                if let Ok(connection) = self.upgrade() {
                    connection.forget_channel(self.id);
                }
                d.resolve(());
            }
            (Pending::Flow(d), Method::ChannelFlowOk { active }) => d.resolve(active),
            (Pending::ExchangeDeclare(d), Method::ExchangeDeclareOk) => d.resolve(()),
            (Pending::ExchangeDelete(d), Method::ExchangeDeleteOk) => d.resolve(()),
            (Pending::ExchangeBind(d), Method::ExchangeBindOk) => d.resolve(()),
            (Pending::ExchangeUnbind(d), Method::ExchangeUnbindOk) => d.resolve(()),
            (Pending::QueueDeclare(d), Method::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            }) => d.resolve(QueueDeclared {
                queue,
                message_count,
                consumer_count,
            }),
            (Pending::QueueBind(d), Method::QueueBindOk) => d.resolve(()),
            (Pending::QueuePurge(d), Method::QueuePurgeOk { message_count }) => {
                d.resolve(message_count)
            }
            (Pending::QueueDelete(d), Method::QueueDeleteOk { message_count }) => {
                d.resolve(message_count)
            }
            (Pending::QueueUnbind(d), Method::QueueUnbindOk) => d.resolve(()),
            (Pending::Qos(d), Method::BasicQosOk) => d.resolve(()),
            (Pending::Consume(d), Method::BasicConsumeOk { consumer_tag }) => {
                self.consumers
                    .borrow_mut()
                    .insert(consumer_tag.clone(), Rc::clone(&d.hooks));
                d.started.resolve(consumer_tag);
            }
            (Pending::Cancel(d), Method::BasicCancelOk { consumer_tag }) => {
                if let Some(hooks) = self.remove_consumer(&consumer_tag) {
                    fire_cancel_hook(&hooks, consumer_tag.clone());
                }
                d.resolve(consumer_tag);
            }
            (Pending::Get(d), Method::BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            }) => {
                // the message itself is still in flight; reassembly resolves it
                self.begin_assembly(AssemblyKind::Get {
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                    message_count,
                    deferred: d,
                })?;
            }
            (Pending::Get(d), Method::BasicGetEmpty) => d.inner.resolve(None),
            (Pending::Recover(d), Method::BasicRecoverOk) => d.resolve(()),
            (Pending::ConfirmSelect(d), Method::ConfirmSelectOk) => {
                self.confirms.borrow_mut().enable();
                d.resolve(());
            }
            (Pending::TxSelect(d), Method::TxSelectOk) => d.resolve(()),
            (Pending::TxCommit(d), Method::TxCommitOk) => d.resolve(()),
            (Pending::TxRollback(d), Method::TxRollbackOk) => d.resolve(()),
            (pending, reply) => {
                pending.reject(Error::protocol("reply does not match the outstanding request"));
                return Err(Error::protocol(format!(
                    "unexpected reply {}/{} on channel {}",
                    reply.class_id(),
                    reply.method_id(),
                    self.id
                )));
            }
        }

        self.release_backlog();
        Ok(())
    }

    fn begin_assembly(&self, kind: AssemblyKind) -> Result<()> {
        if self.assembly.borrow().is_some() {
            return self.content_violation("content method while reassembling a message");
        }
        *self.assembly.borrow_mut() = Some(Assembly {
            kind,
            header_seen: false,
            body_size: 0,
            body: BytesMut::new(),
            properties: BasicProperties::default(),
        });
        if let Some(hooks) = self.active_consumer_hooks() {
            fire_unit_hook(&hooks, HookSlot::Begin);
        }
        Ok(())
    }

    fn handle_header(&self, body_size: u64, properties: BasicProperties) -> Result<()> {
        // the assembly borrow must be released before any callback or
        // violation handling runs
        let accepted: std::result::Result<bool, &'static str> = {
            let mut assembly = self.assembly.borrow_mut();
            match assembly.as_mut() {
                None => Err("header frame without a content method"),
                Some(assembly) if assembly.header_seen => {
                    Err("second header frame for one message")
                }
                Some(assembly) => {
                    assembly.header_seen = true;
                    assembly.body_size = body_size;
                    assembly.properties = properties;
                    Ok(body_size == 0)
                }
            }
        };

        let complete = match accepted {
            Err(violation) => return self.content_violation(violation),
            Ok(complete) => complete,
        };
        if let Some(hooks) = self.active_consumer_hooks() {
            fire_size_hook(&hooks, body_size);
        }
        if complete {
            self.finish_assembly()?;
        }
        Ok(())
    }

    fn handle_body(&self, payload: Vec<u8>) -> Result<()> {
        let accepted: std::result::Result<bool, &'static str> = {
            let mut assembly = self.assembly.borrow_mut();
            match assembly.as_mut() {
                None => Err("body frame without a content method"),
                Some(assembly) if !assembly.header_seen => {
                    Err("body frame before the header frame")
                }
                Some(assembly) => {
                    let received = assembly.body.len() as u64 + payload.len() as u64;
                    if received > assembly.body_size {
                        Err("body exceeds the size the header announced")
                    } else {
                        assembly.body.extend_from_slice(&payload);
                        Ok(received == assembly.body_size)
                    }
                }
            }
        };

        let complete = match accepted {
            Err(violation) => return self.content_violation(violation),
            Ok(complete) => complete,
        };
        if let Some(hooks) = self.active_consumer_hooks() {
            fire_data_hook(&hooks, &payload);
        }
        if complete {
            self.finish_assembly()?;
        }
        Ok(())
    }

    fn finish_assembly(&self) -> Result<()> {
        let assembly = self.assembly.borrow_mut().take();
        let Some(assembly) = assembly else {
            return Err(Error::protocol("no message to complete"));
        };

        let envelope = Envelope {
            properties: assembly.properties,
            body: assembly.body.to_vec(),
        };

        match assembly.kind {
            AssemblyKind::Deliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                let message = Message {
                    envelope,
                    exchange,
                    routing_key,
                    delivery_tag,
                    redelivered,
                    kind: DeliveryKind::Deliver {
                        consumer_tag: consumer_tag.clone(),
                    },
                };
                let hooks = self.consumers.borrow().get(&consumer_tag).cloned();
                match hooks {
                    Some(hooks) => {
                        fire_unit_hook(&hooks, HookSlot::Complete);
                        fire_message_hook(&hooks, message);
                    }
                    None => {
                        warn!(
                            "delivery for unknown consumer {} on channel {}",
                            consumer_tag, self.id
                        );
                    }
                }
            }
            AssemblyKind::Get {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
                deferred,
            } => {
                let message = Message {
                    envelope,
                    exchange,
                    routing_key,
                    delivery_tag,
                    redelivered,
                    kind: DeliveryKind::Get { message_count },
                };
                deferred.inner.resolve(Some(message));
            }
            AssemblyKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                let message = Message {
                    envelope,
                    exchange,
                    routing_key,
                    delivery_tag: 0,
                    redelivered: false,
                    kind: DeliveryKind::Return {
                        reply_code,
                        reply_text,
                    },
                };
                let callback = self.on_return.borrow_mut().take();
                if let Some(mut callback) = callback {
                    callback(message);
                    let mut slot = self.on_return.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                } else {
                    debug!("returned message on channel {} had no return callback", self.id);
                }
            }
        }
        Ok(())
    }

    /// Hooks of the consumer the in-flight delivery belongs to, if any.
    fn active_consumer_hooks(&self) -> Option<Rc<RefCell<ConsumerHooks>>> {
        let assembly = self.assembly.borrow();
        match assembly.as_ref().map(|a| &a.kind) {
            Some(AssemblyKind::Deliver { consumer_tag, .. }) => {
                self.consumers.borrow().get(consumer_tag).cloned()
            }
            _ => None,
        }
    }

    /// A malformed content sequence fails this channel but not the
    /// connection.
    fn content_violation(&self, what: &str) -> Result<()> {
        let error = Error::channel(
            crate::error::reply_code::UNEXPECTED_FRAME,
            what.to_string(),
        );
        self.fail(&error);
        if let Ok(connection) = self.upgrade() {
            connection.forget_channel(self.id);
        }
        Ok(())
    }

    /// Fail every outstanding request (first-to-last), confirms included,
    /// then fire the channel error callback and close the channel.
    pub(crate) fn fail(&self, error: &Error) {
        self.state.set(ChannelState::Closed);
        self.waiting.set(false);
        self.backlog.borrow_mut().clear();
        self.assembly.borrow_mut().take();

        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for entry in pending {
            entry.reject(error.clone());
        }
        let unconfirmed = self.confirms.borrow_mut().drain();
        for deferred in unconfirmed {
            deferred.reject(error.clone());
        }

        let consumers = std::mem::take(&mut *self.consumers.borrow_mut());
        for (tag, hooks) in consumers {
            fire_cancel_hook(&hooks, tag);
        }

        let callback = self.on_error.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback(error.clone());
            let mut slot = self.on_error.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

enum HookSlot {
    Begin,
    Complete,
}

fn fire_unit_hook(hooks: &Rc<RefCell<ConsumerHooks>>, slot: HookSlot) {
    let taken = {
        let mut hooks = hooks.borrow_mut();
        match slot {
            HookSlot::Begin => hooks.on_begin.take(),
            HookSlot::Complete => hooks.on_complete.take(),
        }
    };
    if let Some(mut callback) = taken {
        callback();
        let mut hooks = hooks.borrow_mut();
        let target = match slot {
            HookSlot::Begin => &mut hooks.on_begin,
            HookSlot::Complete => &mut hooks.on_complete,
        };
        if target.is_none() {
            *target = Some(callback);
        }
    }
}

fn fire_size_hook(hooks: &Rc<RefCell<ConsumerHooks>>, size: u64) {
    let taken = hooks.borrow_mut().on_size.take();
    if let Some(mut callback) = taken {
        callback(size);
        let mut hooks = hooks.borrow_mut();
        if hooks.on_size.is_none() {
            hooks.on_size = Some(callback);
        }
    }
}

fn fire_data_hook(hooks: &Rc<RefCell<ConsumerHooks>>, data: &[u8]) {
    let taken = hooks.borrow_mut().on_data.take();
    if let Some(mut callback) = taken {
        callback(data);
        let mut hooks = hooks.borrow_mut();
        if hooks.on_data.is_none() {
            hooks.on_data = Some(callback);
        }
    }
}

fn fire_message_hook(hooks: &Rc<RefCell<ConsumerHooks>>, message: Message) {
    let taken = hooks.borrow_mut().on_message.take();
    if let Some(mut callback) = taken {
        callback(message);
        let mut hooks = hooks.borrow_mut();
        if hooks.on_message.is_none() {
            hooks.on_message = Some(callback);
        }
    }
}

fn fire_cancel_hook(hooks: &Rc<RefCell<ConsumerHooks>>, tag: String) {
    let taken = hooks.borrow_mut().on_cancelled.take();
    if let Some(mut callback) = taken {
        callback(tag);
        let mut hooks = hooks.borrow_mut();
        if hooks.on_cancelled.is_none() {
            hooks.on_cancelled = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{
        establish, establish_with, feed, feed_method, open_test_channel, take_frames,
    };
    use crate::connection::Connection;
    use crate::confirms::Throttle;
    use crate::frame::Frame;

    fn declare_ok(queue: &str, message_count: u32, consumer_count: u32) -> Method {
        Method::QueueDeclareOk {
            queue: queue.into(),
            message_count,
            consumer_count,
        }
    }

    #[test]
    fn test_queue_declare_resolves_with_name_and_counts() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let result: Rc<RefCell<Option<QueueDeclared>>> = Rc::new(RefCell::new(None));
        let errored = Rc::new(Cell::new(false));
        let sink = Rc::clone(&result);
        let err = Rc::clone(&errored);
        channel
            .queue_declare("q1", QueueDeclareFlags::new().durable(), FieldTable::new())
            .on_success(move |declared| *sink.borrow_mut() = Some(declared))
            .on_error(move |_| err.set(true));

        let frames = take_frames(&peer.outbox);
        assert_eq!(
            frames,
            vec![Frame::Method {
                channel: channel.id(),
                method: Method::QueueDeclare {
                    queue: "q1".into(),
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
            }]
        );

        feed_method(&peer.connection, channel.id(), declare_ok("q1", 0, 0));
        let declared = result.borrow_mut().take().unwrap();
        assert_eq!(declared.queue, "q1");
        assert_eq!(declared.message_count, 0);
        assert_eq!(declared.consumer_count, 0);
        assert!(!errored.get());
    }

    #[test]
    fn test_publish_splits_body_at_max_frame() {
        let peer = establish_with(Connection::builder(), 0, 4096, 0);
        let channel = open_test_channel(&peer);

        let body = vec![0xAB; 10_000];
        channel
            .publish("ex", "r", Envelope::new(body.clone()), PublishFlags::new())
            .unwrap();

        let frames = take_frames(&peer.outbox);
        assert_eq!(frames.len(), 5, "method + header + 3 body frames");

        assert_eq!(
            frames[0],
            Frame::Method {
                channel: channel.id(),
                method: Method::BasicPublish {
                    exchange: "ex".into(),
                    routing_key: "r".into(),
                    mandatory: false,
                    immediate: false,
                },
            }
        );
        let Frame::Header {
            class_id,
            body_size,
            ..
        } = &frames[1]
        else {
            panic!("expected header frame");
        };
        assert_eq!(*class_id, class::BASIC);
        assert_eq!(*body_size, 10_000);

        let mut reassembled = Vec::new();
        for frame in &frames[2..] {
            let Frame::Body { payload, .. } = frame else {
                panic!("expected body frame");
            };
            assert!(payload.len() <= 4096 - FRAME_OVERHEAD);
            reassembled.extend_from_slice(payload);
        }
        assert_eq!(reassembled, body);
        assert_eq!(frames[2..].len(), 3);
    }

    #[test]
    fn test_confirm_mode_multiple_ack_then_nack() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        channel.confirm_select();
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::ConfirmSelectOk);

        let outcomes: Rc<RefCell<Vec<(u64, Confirm)>>> = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let sink = Rc::clone(&outcomes);
            let publication = channel
                .publish("ex", "r", Envelope::text("m"), PublishFlags::new())
                .unwrap();
            let tag = publication.delivery_tag().unwrap();
            publication.on_confirm(move |confirm| sink.borrow_mut().push((tag, confirm)));
        }
        take_frames(&peer.outbox);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicAck {
                delivery_tag: 2,
                multiple: true,
            },
        );
        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicNack {
                delivery_tag: 3,
                multiple: false,
                requeue: false,
            },
        );

        assert_eq!(
            *outcomes.borrow(),
            vec![(1, Confirm::Ack), (2, Confirm::Ack), (3, Confirm::Nack)]
        );
    }

    #[test]
    fn test_server_close_fails_deferreds_in_order_and_replies_close_ok() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        let l2 = Rc::clone(&log);
        let l3 = Rc::clone(&log);
        channel
            .queue_declare("a", QueueDeclareFlags::new(), FieldTable::new())
            .on_error(move |e| l1.borrow_mut().push(format!("first:{}", e.reply_text().unwrap())));
        channel
            .queue_declare("b", QueueDeclareFlags::new(), FieldTable::new())
            .on_error(move |e| l2.borrow_mut().push(format!("second:{}", e.reply_text().unwrap())));
        channel.on_error(move |e| l3.borrow_mut().push(format!("channel:{}", e.reply_text().unwrap())));
        take_frames(&peer.outbox);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::ChannelClose {
                reply_code: 404,
                reply_text: "NOT_FOUND".into(),
                failing_class: 60,
                failing_method: 40,
            },
        );

        assert_eq!(
            *log.borrow(),
            vec!["first:NOT_FOUND", "second:NOT_FOUND", "channel:NOT_FOUND"]
        );
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!peer.connection.is_closed());

        let frames = take_frames(&peer.outbox);
        assert_eq!(
            frames,
            vec![Frame::Method {
                channel: channel.id(),
                method: Method::ChannelCloseOk,
            }]
        );
    }

    #[test]
    fn test_synchronous_requests_gate_and_resolve_in_order() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        channel
            .queue_declare("first", QueueDeclareFlags::new(), FieldTable::new())
            .on_success(move |_| o1.borrow_mut().push("first"));
        channel
            .queue_declare("second", QueueDeclareFlags::new(), FieldTable::new())
            .on_success(move |_| o2.borrow_mut().push("second"));

        // only the first request may be on the wire while its reply is out
        let frames = take_frames(&peer.outbox);
        assert_eq!(frames.len(), 1);

        feed_method(&peer.connection, channel.id(), declare_ok("first", 0, 0));
        let frames = take_frames(&peer.outbox);
        assert_eq!(frames.len(), 1, "backlogged request released by the reply");
        assert!(matches!(
            &frames[0],
            Frame::Method {
                method: Method::QueueDeclare { queue, .. },
                ..
            } if queue == "second"
        ));

        feed_method(&peer.connection, channel.id(), declare_ok("second", 0, 0));
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_acks_bypass_the_synchronous_gate() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        channel.queue_declare("q", QueueDeclareFlags::new(), FieldTable::new());
        take_frames(&peer.outbox);

        channel.ack(7, false).unwrap();
        let frames = take_frames(&peer.outbox);
        assert_eq!(
            frames,
            vec![Frame::Method {
                channel: channel.id(),
                method: Method::BasicAck {
                    delivery_tag: 7,
                    multiple: false,
                },
            }]
        );
    }

    #[test]
    fn test_consume_delivery_reassembly_and_hook_order() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let l_begin = Rc::clone(&log);
        let l_size = Rc::clone(&log);
        let l_data = Rc::clone(&log);
        let l_complete = Rc::clone(&log);
        let l_message = Rc::clone(&log);
        let l_started = Rc::clone(&log);
        channel
            .consume("q", "", ConsumeFlags::new(), FieldTable::new())
            .on_success(move |tag| l_started.borrow_mut().push(format!("started:{}", tag)))
            .on_begin(move || l_begin.borrow_mut().push("begin".into()))
            .on_size(move |size| l_size.borrow_mut().push(format!("size:{}", size)))
            .on_data(move |chunk| l_data.borrow_mut().push(format!("data:{}", chunk.len())))
            .on_complete(move || l_complete.borrow_mut().push("complete".into()))
            .on_message(move |message| {
                l_message
                    .borrow_mut()
                    .push(format!("message:{}", message.body_as_text().unwrap()))
            });
        take_frames(&peer.outbox);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicConsumeOk {
                consumer_tag: "amq.ctag-7".into(),
            },
        );
        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicDeliver {
                consumer_tag: "amq.ctag-7".into(),
                delivery_tag: 1,
                redelivered: false,
                exchange: "ex".into(),
                routing_key: "r".into(),
            },
        );
        feed(
            &peer.connection,
            Frame::Header {
                channel: channel.id(),
                class_id: class::BASIC,
                body_size: 11,
                properties: BasicProperties::default(),
            },
        );
        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: b"hello ".to_vec(),
            },
        );
        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: b"world".to_vec(),
            },
        );

        assert_eq!(
            *log.borrow(),
            vec![
                "started:amq.ctag-7",
                "begin",
                "size:11",
                "data:6",
                "data:5",
                "complete",
                "message:hello world"
            ]
        );
    }

    #[test]
    fn test_get_message_and_get_empty() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let got: Rc<RefCell<Option<Message>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&got);
        channel.get("q", false).on_message(move |message| {
            *sink.borrow_mut() = Some(message);
        });
        take_frames(&peer.outbox);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicGetOk {
                delivery_tag: 42,
                redelivered: true,
                exchange: "ex".into(),
                routing_key: "r".into(),
                message_count: 3,
            },
        );
        feed(
            &peer.connection,
            Frame::Header {
                channel: channel.id(),
                class_id: class::BASIC,
                body_size: 2,
                properties: BasicProperties::default(),
            },
        );
        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: b"ok".to_vec(),
            },
        );

        let message = got.borrow_mut().take().unwrap();
        assert_eq!(message.delivery_tag, 42);
        assert!(message.redelivered);
        assert_eq!(message.kind, DeliveryKind::Get { message_count: 3 });
        assert_eq!(message.body_as_text(), Some("ok"));

        let empty = Rc::new(Cell::new(false));
        let flag = Rc::clone(&empty);
        channel.get("q", false).on_empty(move || flag.set(true));
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::BasicGetEmpty);
        assert!(empty.get());
    }

    #[test]
    fn test_zero_length_body_completes_on_header() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let got = Rc::new(Cell::new(false));
        let flag = Rc::clone(&got);
        channel
            .get("q", true)
            .on_message(move |message| flag.set(message.envelope.body.is_empty()));
        take_frames(&peer.outbox);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicGetOk {
                delivery_tag: 1,
                redelivered: false,
                exchange: "".into(),
                routing_key: "r".into(),
                message_count: 0,
            },
        );
        feed(
            &peer.connection,
            Frame::Header {
                channel: channel.id(),
                class_id: class::BASIC,
                body_size: 0,
                properties: BasicProperties::default(),
            },
        );
        assert!(got.get());
    }

    #[test]
    fn test_returned_publish_reaches_return_callback() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let returned: Rc<RefCell<Option<Message>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&returned);
        channel.on_return(move |message| *sink.borrow_mut() = Some(message));

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicReturn {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
                exchange: "ex".into(),
                routing_key: "nowhere".into(),
            },
        );
        feed(
            &peer.connection,
            Frame::Header {
                channel: channel.id(),
                class_id: class::BASIC,
                body_size: 4,
                properties: BasicProperties::default(),
            },
        );
        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: b"lost".to_vec(),
            },
        );

        let message = returned.borrow_mut().take().unwrap();
        assert_eq!(
            message.kind,
            DeliveryKind::Return {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
            }
        );
        assert_eq!(message.routing_key, "nowhere");
        assert_eq!(message.body_as_text(), Some("lost"));
    }

    #[test]
    fn test_body_overflow_fails_the_channel_not_the_connection() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let errored = Rc::new(Cell::new(false));
        let flag = Rc::clone(&errored);
        channel.on_error(move |_| flag.set(true));

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicDeliver {
                consumer_tag: "t".into(),
                delivery_tag: 1,
                redelivered: false,
                exchange: "ex".into(),
                routing_key: "r".into(),
            },
        );
        feed(
            &peer.connection,
            Frame::Header {
                channel: channel.id(),
                class_id: class::BASIC,
                body_size: 1,
                properties: BasicProperties::default(),
            },
        );
        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: vec![1, 2],
            },
        );

        assert!(errored.get());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!peer.connection.is_closed());
    }

    #[test]
    fn test_body_frame_without_header_fails_the_channel() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let errored = Rc::new(Cell::new(false));
        let flag = Rc::clone(&errored);
        channel.on_error(move |_| flag.set(true));

        feed(
            &peer.connection,
            Frame::Body {
                channel: channel.id(),
                payload: vec![1],
            },
        );
        assert!(errored.get());
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_no_wait_consume_generates_a_local_tag() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let tag: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&tag);
        channel
            .consume("q", "", ConsumeFlags::new().no_wait(), FieldTable::new())
            .on_success(move |t| *sink.borrow_mut() = Some(t));

        let tag = tag.borrow_mut().take().expect("tag resolves immediately");
        assert!(tag.starts_with("ctag-"));

        let frames = take_frames(&peer.outbox);
        assert!(matches!(
            &frames[0],
            Frame::Method {
                method: Method::BasicConsume { consumer_tag, no_wait: true, .. },
                ..
            } if *consumer_tag == tag
        ));
    }

    #[test]
    fn test_server_cancel_notifies_and_unregisters_the_consumer() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let cancelled: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&cancelled);
        channel
            .consume("q", "tag-1", ConsumeFlags::new(), FieldTable::new())
            .on_cancelled(move |tag| *sink.borrow_mut() = Some(tag));
        take_frames(&peer.outbox);
        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicConsumeOk {
                consumer_tag: "tag-1".into(),
            },
        );

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicCancel {
                consumer_tag: "tag-1".into(),
                no_wait: false,
            },
        );

        assert_eq!(cancelled.borrow_mut().take().as_deref(), Some("tag-1"));
        let frames = take_frames(&peer.outbox);
        assert_eq!(
            frames,
            vec![Frame::Method {
                channel: channel.id(),
                method: Method::BasicCancelOk {
                    consumer_tag: "tag-1".into(),
                },
            }]
        );
    }

    #[test]
    fn test_recover_and_tx_round_trips() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        channel.recover(true).on_success(move |_| l1.borrow_mut().push("recovered"));
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::BasicRecoverOk);

        let l2 = Rc::clone(&log);
        channel.tx_select().on_success(move |_| l2.borrow_mut().push("tx"));
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::TxSelectOk);

        let l3 = Rc::clone(&log);
        channel.tx_commit().on_success(move |_| l3.borrow_mut().push("commit"));
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::TxCommitOk);

        assert_eq!(*log.borrow(), vec!["recovered", "tx", "commit"]);
    }

    #[test]
    fn test_server_flow_is_echoed() {
        let peer = establish();
        let channel = open_test_channel(&peer);

        feed_method(
            &peer.connection,
            channel.id(),
            Method::ChannelFlow { active: false },
        );
        let frames = take_frames(&peer.outbox);
        assert_eq!(
            frames,
            vec![Frame::Method {
                channel: channel.id(),
                method: Method::ChannelFlowOk { active: false },
            }]
        );
    }

    #[test]
    fn test_operations_on_a_closed_channel_fail_locally() {
        let peer = establish();
        let channel = open_test_channel(&peer);
        channel.close();
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::ChannelCloseOk);

        let errored = Rc::new(Cell::new(false));
        let flag = Rc::clone(&errored);
        channel
            .queue_declare("q", QueueDeclareFlags::new(), FieldTable::new())
            .on_error(move |e| flag.set(matches!(e, Error::Usage(_))));
        assert!(errored.get());
        assert!(channel.publish("e", "r", Envelope::text("x"), PublishFlags::new()).is_err());
        assert!(take_frames(&peer.outbox).is_empty(), "nothing reaches the wire");
    }

    #[test]
    fn test_throttle_holds_publishes_over_the_limit() {
        let peer = establish();
        let channel = open_test_channel(&peer);
        channel.confirm_select();
        take_frames(&peer.outbox);
        feed_method(&peer.connection, channel.id(), Method::ConfirmSelectOk);

        let throttle = Throttle::new(&channel, 2);
        for _ in 0..3 {
            throttle.publish("ex", "r", Envelope::text("m"), PublishFlags::new());
        }
        assert_eq!(throttle.outstanding(), 2);
        assert_eq!(throttle.queued(), 1);

        let frames = take_frames(&peer.outbox);
        let publishes = frames
            .iter()
            .filter(|f| matches!(f, Frame::Method { method: Method::BasicPublish { .. }, .. }))
            .count();
        assert_eq!(publishes, 2, "third publish is held back");

        feed_method(
            &peer.connection,
            channel.id(),
            Method::BasicAck {
                delivery_tag: 1,
                multiple: false,
            },
        );
        assert_eq!(throttle.outstanding(), 2);
        assert_eq!(throttle.queued(), 0);

        let frames = take_frames(&peer.outbox);
        let publishes = frames
            .iter()
            .filter(|f| matches!(f, Frame::Method { method: Method::BasicPublish { .. }, .. }))
            .count();
        assert_eq!(publishes, 1, "the held publish is released by the confirm");
    }
}
