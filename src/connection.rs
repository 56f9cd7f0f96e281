//! AMQP 0-9-1 Connection Core
//!
//! This module implements the connection state machine: the protocol
//! header, the start/secure/tune/open handshake with downward negotiation,
//! heartbeat scheduling, channel allocation and frame dispatch, the blocked
//! flag, and both directions of the close handshake.
//!
//! # Driving the connection
//!
//! The connection owns no socket. The host feeds inbound bytes through
//! [`Connection::parse`] (which reports how many bytes it consumed —
//! unconsumed bytes are re-presented later) and advances the heartbeat
//! clock through [`Connection::tick`]. Outbound bytes leave through the
//! [`ConnectionHandler`] the connection was built with. Every callback runs
//! on the thread that called `parse` or `tick`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use warren_amqp::auth::Credentials;
//! use warren_amqp::connection::Connection;
//! use warren_amqp::transport::ConnectionHandler;
//!
//! struct Stdout;
//! impl ConnectionHandler for Stdout {
//!     fn on_data(&mut self, data: &[u8]) {
//!         // hand bytes to the socket
//!         let _ = data;
//!     }
//! }
//!
//! let connection = Connection::builder()
//!     .credentials(Credentials::new("guest", "guest"))
//!     .vhost("/")
//!     .heartbeat(30)
//!     .build(Stdout);
//! let channel = connection.open_channel().unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::auth::Credentials;
use crate::channel::{Channel, ChannelInner};
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::frame::{self, Frame, Parsed, PROTOCOL_HEADER};
use crate::method::Method;
use crate::transport::ConnectionHandler;
use crate::types::{FieldTable, FieldValue};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, nothing sent yet.
    New,
    /// The 8-byte protocol header is out, awaiting `connection.start`.
    ProtocolHeaderSent,
    /// In the start/secure/tune exchange.
    Tuning,
    /// `connection.open` sent, awaiting `open-ok`.
    Opening,
    /// Fully open; channels flow.
    Connected,
    /// Client sent `connection.close`, awaiting `close-ok`.
    Closing,
    /// Dead. Every subsequent byte is ignored.
    Closed,
}

/// Tunables for a connection, all negotiated downward with the server.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Login presented in `start-ok`.
    pub credentials: Credentials,
    /// Virtual host named in `connection.open`.
    pub vhost: String,
    /// Proposed channel ceiling; 0 leaves the choice to the server.
    pub channel_max: u16,
    /// Proposed max-frame in bytes; 0 means no limit.
    pub frame_max: u32,
    /// Proposed heartbeat interval in seconds; 0 disables heartbeats.
    pub heartbeat: u16,
    /// Extra client properties merged into `start-ok`.
    pub properties: FieldTable,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            credentials: Credentials::default(),
            vhost: "/".into(),
            channel_max: 0,
            frame_max: 131_072,
            heartbeat: 60,
            properties: FieldTable::new(),
        }
    }
}

/// Builder for [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    options: ConnectionOptions,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.options.credentials = credentials;
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.options.vhost = vhost.into();
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.options.channel_max = channel_max;
        self
    }

    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.options.frame_max = frame_max;
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.options.heartbeat = seconds;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.options.properties.insert(name, value);
        self
    }

    /// Build the connection and immediately emit the protocol header
    /// through `handler`.
    pub fn build(self, handler: impl ConnectionHandler + 'static) -> Connection {
        Connection::with_options(self.options, Box::new(handler))
    }
}

/// Maximum frame size assumed until the server's `tune` arrives.
const INITIAL_FRAME_MAX: u32 = 4096;

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    handler: RefCell<Box<dyn ConnectionHandler>>,
    state: Cell<ConnectionState>,
    channels: RefCell<HashMap<u16, Rc<ChannelInner>>>,
    next_channel: Cell<u16>,
    channel_max: Cell<u16>,
    frame_max: Cell<u32>,
    heartbeat: Cell<u16>,
    blocked: RefCell<Option<String>>,
    outgoing: RefCell<BytesMut>,
    /// Channel frames produced before `open-ok`, flushed on connect.
    held: RefCell<BytesMut>,
    pumping: Cell<bool>,
    last_inbound: Cell<Instant>,
    last_outbound: Cell<Instant>,
    close_deferred: RefCell<Option<Deferred<()>>>,
}

/// An AMQP connection, multiplexing any number of channels over one byte
/// stream.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    fn with_options(options: ConnectionOptions, handler: Box<dyn ConnectionHandler>) -> Connection {
        let now = Instant::now();
        let inner = Rc::new(ConnectionInner {
            options,
            handler: RefCell::new(handler),
            state: Cell::new(ConnectionState::New),
            channels: RefCell::new(HashMap::new()),
            next_channel: Cell::new(1),
            channel_max: Cell::new(0),
            frame_max: Cell::new(INITIAL_FRAME_MAX),
            heartbeat: Cell::new(0),
            blocked: RefCell::new(None),
            outgoing: RefCell::new(BytesMut::new()),
            held: RefCell::new(BytesMut::new()),
            pumping: Cell::new(false),
            last_inbound: Cell::new(now),
            last_outbound: Cell::new(now),
            close_deferred: RefCell::new(None),
        });

        inner.outgoing.borrow_mut().extend_from_slice(&PROTOCOL_HEADER);
        inner.state.set(ConnectionState::ProtocolHeaderSent);
        inner.pump();
        debug!("protocol header sent, vhost {}", inner.options.vhost);
        Connection { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == ConnectionState::Closed
    }

    /// The negotiated max-frame size; 0 means unlimited.
    pub fn frame_max(&self) -> u32 {
        self.inner.frame_max.get()
    }

    /// The negotiated heartbeat interval in seconds; 0 means disabled.
    pub fn heartbeat_interval(&self) -> u16 {
        self.inner.heartbeat.get()
    }

    /// The reason the server gave when blocking this connection, if it is
    /// currently blocked.
    pub fn blocked_reason(&self) -> Option<String> {
        self.inner.blocked.borrow().clone()
    }

    /// Feed inbound bytes. Returns how many bytes were consumed; the caller
    /// re-presents the remainder together with new bytes later.
    ///
    /// Never panics across this boundary: malformed input fails the
    /// connection through the handler's error callback, and any further
    /// bytes are reported as consumed and dropped.
    pub fn parse(&self, data: &[u8]) -> usize {
        if self.is_closed() {
            return data.len();
        }
        self.inner.last_inbound.set(Instant::now());

        let mut consumed = 0;
        while consumed < data.len() {
            let rest = &data[consumed..];

            // A raw protocol header back from the server means it rejected
            // our version before speaking frames.
            if self.inner.state.get() == ConnectionState::ProtocolHeaderSent
                && rest.len() >= 4
                && &rest[..4] == b"AMQP"
            {
                self.inner
                    .fatal(&Error::protocol("server rejected the protocol version"));
                return data.len();
            }

            match frame::parse(rest) {
                Ok(Parsed::NeedMore) => break,
                Ok(Parsed::Frame { frame, consumed: n }) => {
                    consumed += n;
                    trace!("received {:?}", frame_kind(&frame));
                    if let Err(error) = self.inner.dispatch(frame) {
                        self.inner.fatal(&error);
                        return data.len();
                    }
                    if self.is_closed() {
                        return data.len();
                    }
                }
                Err(error) => {
                    self.inner.fatal(&error);
                    return data.len();
                }
            }
        }
        consumed
    }

    /// Advance the heartbeat clock.
    ///
    /// Emits a heartbeat when half the negotiated interval has passed with
    /// no outbound traffic, and fails the connection when twice the
    /// interval has passed with no inbound traffic.
    pub fn tick(&self, now: Instant) {
        if self.inner.state.get() != ConnectionState::Connected {
            return;
        }
        let seconds = self.inner.heartbeat.get();
        if seconds == 0 {
            return;
        }
        let interval = Duration::from_secs(u64::from(seconds));

        if now.saturating_duration_since(self.inner.last_inbound.get()) >= interval * 2 {
            self.inner.fatal(&Error::transport(format!(
                "no traffic from server in {} seconds",
                seconds * 2
            )));
            return;
        }
        if now.saturating_duration_since(self.inner.last_outbound.get()) >= interval / 2 {
            let mut bytes = BytesMut::new();
            if Frame::Heartbeat.encode(&mut bytes).is_ok() {
                trace!("emitting heartbeat");
                self.inner.outgoing.borrow_mut().extend_from_slice(&bytes);
                self.inner.pump();
            }
        }
    }

    /// Report a transport-level failure (socket error, TLS failure, EOF).
    pub fn transport_failed(&self, reason: &str) {
        self.inner.fatal(&Error::transport(reason.to_string()));
    }

    /// Open a new channel. Its id is allocated from 1 up to the negotiated
    /// ceiling; ids become reusable once a channel detaches.
    pub fn open_channel(&self) -> Result<Channel> {
        match self.inner.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(Error::usage("connection is closing or closed"))
            }
            _ => {}
        }
        let id = self.inner.allocate_channel_id()?;
        let channel = Channel::open(&self.inner, id);
        self.inner
            .channels
            .borrow_mut()
            .insert(id, Rc::clone(channel.internal()));
        debug!("channel {} opened", id);
        Ok(channel)
    }

    /// Close the connection. Fails every outstanding deferred on every
    /// channel, then awaits the server's `close-ok`.
    pub fn close(&self) -> Deferred<()> {
        match self.inner.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Deferred::failed(Error::usage("connection is already closing or closed"))
            }
            _ => {}
        }

        let deferred = Deferred::new();
        *self.inner.close_deferred.borrow_mut() = Some(deferred.clone());
        let sent = self.inner.send_connection_method(Method::ConnectionClose {
            reply_code: 200,
            reply_text: "Goodbye".into(),
            failing_class: 0,
            failing_method: 0,
        });
        self.inner.state.set(ConnectionState::Closing);
        self.inner
            .fail_channels(&Error::connection(200, "connection closed by client"));

        if let Err(error) = sent {
            self.inner.close_deferred.borrow_mut().take();
            return Deferred::failed(error);
        }
        deferred
    }
}

impl ConnectionInner {
    /// Invoke a handler callback with the pump gated, so the callback may
    /// freely issue sends; whatever it queued is flushed on the way out.
    fn with_handler<R>(&self, f: impl FnOnce(&mut dyn ConnectionHandler) -> R) -> R {
        let was_pumping = self.pumping.replace(true);
        let result = f(&mut **self.handler.borrow_mut());
        self.pumping.set(was_pumping);
        if !was_pumping {
            self.pump();
        }
        result
    }

    fn client_properties(&self) -> FieldTable {
        let mut capabilities = FieldTable::new();
        capabilities.insert("authentication_failure_close", FieldValue::Boolean(true));
        capabilities.insert("publisher_confirms", FieldValue::Boolean(true));
        capabilities.insert("consumer_cancel_notify", FieldValue::Boolean(true));
        capabilities.insert("connection.blocked", FieldValue::Boolean(true));

        let mut properties = FieldTable::new();
        properties.insert("product", FieldValue::long_string(env!("CARGO_PKG_NAME")));
        properties.insert("version", FieldValue::long_string(env!("CARGO_PKG_VERSION")));
        properties.insert("platform", FieldValue::long_string("Rust"));
        properties.insert("capabilities", FieldValue::Table(capabilities));
        for (name, value) in self.options.properties.iter() {
            properties.insert(name.clone(), value.clone());
        }
        properties
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Heartbeat => {
                self.with_handler(|handler| handler.on_heartbeat());
                Ok(())
            }
            Frame::Method { channel: 0, method } => self.handle_connection_method(method),
            Frame::Header { channel: 0, .. } | Frame::Body { channel: 0, .. } => {
                Err(Error::protocol("content frame on channel 0"))
            }
            frame => {
                let id = frame.channel();
                let channel = self.channels.borrow().get(&id).cloned();
                match channel {
                    Some(channel) => channel.handle_frame(frame),
                    None => Err(Error::protocol(format!("frame for unknown channel {}", id))),
                }
            }
        }
    }

    fn handle_connection_method(&self, method: Method) -> Result<()> {
        match method {
            Method::ConnectionStart {
                version_major,
                version_minor,
                mechanisms,
                ..
            } => {
                if self.state.get() != ConnectionState::ProtocolHeaderSent {
                    return Err(Error::protocol("connection.start out of sequence"));
                }
                if (version_major, version_minor) != (0, 9) {
                    return Err(Error::protocol(format!(
                        "server speaks AMQP {}.{}, need 0.9",
                        version_major, version_minor
                    )));
                }
                let mechanism = self.options.credentials.select_mechanism(&mechanisms)?;
                let start_ok = Method::ConnectionStartOk {
                    client_properties: self.client_properties(),
                    mechanism: mechanism.into(),
                    response: self.options.credentials.plain_response(),
                    locale: "en_US".into(),
                };
                self.state.set(ConnectionState::Tuning);
                self.send_connection_method(start_ok)
            }

            Method::ConnectionSecure { .. } => {
                if self.state.get() != ConnectionState::Tuning {
                    return Err(Error::protocol("connection.secure out of sequence"));
                }
                // PLAIN has no challenge step; repeat the login response
                self.send_connection_method(Method::ConnectionSecureOk {
                    response: self.options.credentials.plain_response(),
                })
            }

            Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                if self.state.get() != ConnectionState::Tuning {
                    return Err(Error::protocol("connection.tune out of sequence"));
                }
                let wire_channel_max = negotiate(self.options.channel_max, channel_max);
                let wire_frame_max = negotiate(self.options.frame_max, frame_max);
                let computed = negotiate_heartbeat(self.options.heartbeat, heartbeat);
                let chosen = self.with_handler(|handler| handler.on_negotiate(computed));

                self.channel_max.set(match wire_channel_max {
                    0 => u16::MAX,
                    n => n,
                });
                self.frame_max.set(wire_frame_max);
                self.heartbeat.set(chosen);
                debug!(
                    "tuned: channel-max {}, frame-max {}, heartbeat {}s",
                    wire_channel_max, wire_frame_max, chosen
                );

                self.send_connection_method(Method::ConnectionTuneOk {
                    channel_max: wire_channel_max,
                    frame_max: wire_frame_max,
                    heartbeat: chosen,
                })?;
                self.state.set(ConnectionState::Opening);
                self.send_connection_method(Method::ConnectionOpen {
                    vhost: self.options.vhost.clone(),
                })
            }

            Method::ConnectionOpenOk => {
                if self.state.get() != ConnectionState::Opening {
                    return Err(Error::protocol("connection.open-ok out of sequence"));
                }
                self.state.set(ConnectionState::Connected);
                let held = self.held.borrow_mut().split();
                if !held.is_empty() {
                    self.outgoing.borrow_mut().extend_from_slice(&held);
                    self.pump();
                }
                debug!("connection open");
                self.with_handler(|handler| handler.on_connected());
                Ok(())
            }

            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            } => {
                warn!("server closed connection: {} {}", reply_code, reply_text);
                let _ = self.send_connection_method(Method::ConnectionCloseOk);
                self.teardown(Some(&Error::connection(reply_code, reply_text)));
                Ok(())
            }

            Method::ConnectionCloseOk => {
                if self.state.get() != ConnectionState::Closing {
                    return Err(Error::protocol("connection.close-ok out of sequence"));
                }
                let deferred = self.close_deferred.borrow_mut().take();
                self.state.set(ConnectionState::Closed);
                if let Some(deferred) = deferred {
                    deferred.resolve(());
                }
                self.with_handler(|handler| handler.on_closed());
                Ok(())
            }

            Method::ConnectionBlocked { reason } => {
                *self.blocked.borrow_mut() = Some(reason.clone());
                self.with_handler(|handler| handler.on_blocked(&reason));
                Ok(())
            }

            Method::ConnectionUnblocked => {
                self.blocked.borrow_mut().take();
                self.with_handler(|handler| handler.on_unblocked());
                Ok(())
            }

            other => Err(Error::protocol(format!(
                "unexpected connection method {}/{}",
                other.class_id(),
                other.method_id()
            ))),
        }
    }

    /// Send one method frame on channel 0.
    fn send_connection_method(&self, method: Method) -> Result<()> {
        if self.state.get() == ConnectionState::Closed {
            return Err(Error::usage("connection is closed"));
        }
        let mut bytes = BytesMut::new();
        Frame::Method { channel: 0, method }.encode(&mut bytes)?;
        self.outgoing.borrow_mut().extend_from_slice(&bytes);
        self.pump();
        Ok(())
    }

    /// Queue already-encoded channel frames for sending. Before the open
    /// handshake completes they wait in a holding buffer.
    pub(crate) fn send_channel_frames(&self, bytes: &[u8]) -> Result<()> {
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(Error::usage("connection is closing or closed"))
            }
            ConnectionState::Connected => {
                self.outgoing.borrow_mut().extend_from_slice(bytes);
                self.pump();
                Ok(())
            }
            _ => {
                self.held.borrow_mut().extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Hand everything queued to the handler. Reentrant sends from inside
    /// the handler or from user callbacks just extend the queue; one pump
    /// frame on the stack drains it all.
    fn pump(&self) {
        if self.pumping.get() {
            return;
        }
        self.pumping.set(true);
        loop {
            let chunk = {
                let mut outgoing = self.outgoing.borrow_mut();
                if outgoing.is_empty() {
                    break;
                }
                outgoing.split()
            };
            self.last_outbound.set(Instant::now());
            self.handler.borrow_mut().on_data(&chunk);
        }
        self.pumping.set(false);
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.frame_max.get()
    }

    fn allocate_channel_id(&self) -> Result<u16> {
        let channels = self.channels.borrow();
        let max = match self.channel_max.get() {
            0 => u16::MAX,
            n => n,
        };
        let mut candidate = self.next_channel.get();
        for _ in 0..max {
            if candidate == 0 || candidate > max {
                candidate = 1;
            }
            if !channels.contains_key(&candidate) {
                self.next_channel.set(candidate.wrapping_add(1));
                return Ok(candidate);
            }
            candidate = candidate.wrapping_add(1);
        }
        Err(Error::usage("every channel id is in use"))
    }

    pub(crate) fn forget_channel(&self, id: u16) {
        self.channels.borrow_mut().remove(&id);
    }

    fn fail_channels(&self, error: &Error) {
        let channels = std::mem::take(&mut *self.channels.borrow_mut());
        for (_, channel) in channels {
            channel.fail(error);
        }
    }

    /// A fatal error: fail everything, notify, and go dark.
    pub(crate) fn fatal(&self, error: &Error) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        self.teardown(Some(error));
    }

    fn teardown(&self, error: Option<&Error>) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        self.state.set(ConnectionState::Closed);

        let close_deferred = self.close_deferred.borrow_mut().take();
        let failure = error
            .cloned()
            .unwrap_or_else(|| Error::connection(0, "connection closed"));
        self.fail_channels(&failure);

        if let Some(error) = error {
            self.with_handler(|handler| handler.on_error(error));
        }
        if let Some(deferred) = close_deferred {
            // the connection is down either way; a close in flight is done
            deferred.resolve(());
        }
        self.with_handler(|handler| handler.on_closed());
    }
}

fn negotiate<T: Copy + Ord + Default + PartialEq>(client: T, server: T) -> T {
    let zero = T::default();
    if client == zero {
        server
    } else if server == zero {
        client
    } else {
        client.min(server)
    }
}

fn negotiate_heartbeat(client: u16, server: u16) -> u16 {
    if client == 0 || server == 0 {
        0
    } else {
        client.min(server)
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Method { .. } => "method frame",
        Frame::Header { .. } => "header frame",
        Frame::Body { .. } => "body frame",
        Frame::Heartbeat => "heartbeat",
    }
}
