//! AMQP 0-9-1 Method Arguments
//!
//! Every method frame payload starts with a 2-byte class id and a 2-byte
//! method id, followed by arguments whose layout is dictated by that pair.
//! This module defines the [`Method`] tagged union over every class/method
//! the client speaks (connection, channel, exchange, queue, basic, confirm,
//! tx) and the argument codec for each variant.
//!
//! Consecutive boolean arguments pack into a single octet, least significant
//! bit first, as the protocol grammar requires.

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::types::FieldTable;

/// Class ids.
pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}

/// A decoded method frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    // connection (class 10)
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: Vec<u8>,
        locales: Vec<u8>,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    ConnectionSecure {
        challenge: Vec<u8>,
    },
    ConnectionSecureOk {
        response: Vec<u8>,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        vhost: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        failing_class: u16,
        failing_method: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,

    // channel (class 20)
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        failing_class: u16,
        failing_method: u16,
    },
    ChannelCloseOk,

    // exchange (class 40)
    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeBindOk,
    ExchangeUnbind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeUnbindOk,

    // queue (class 50)
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    // basic (class 60)
    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicGet {
        queue: String,
        no_ack: bool,
    },
    BasicGetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    BasicGetEmpty,
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecoverAsync {
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },

    // confirm (class 85)
    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,

    // tx (class 90)
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

impl Method {
    /// The wire class id.
    pub fn class_id(&self) -> u16 {
        use Method::*;
        match self {
            ConnectionStart { .. } | ConnectionStartOk { .. } | ConnectionSecure { .. }
            | ConnectionSecureOk { .. } | ConnectionTune { .. } | ConnectionTuneOk { .. }
            | ConnectionOpen { .. } | ConnectionOpenOk | ConnectionClose { .. }
            | ConnectionCloseOk | ConnectionBlocked { .. } | ConnectionUnblocked => {
                class::CONNECTION
            }
            ChannelOpen | ChannelOpenOk | ChannelFlow { .. } | ChannelFlowOk { .. }
            | ChannelClose { .. } | ChannelCloseOk => class::CHANNEL,
            ExchangeDeclare { .. } | ExchangeDeclareOk | ExchangeDelete { .. }
            | ExchangeDeleteOk | ExchangeBind { .. } | ExchangeBindOk
            | ExchangeUnbind { .. } | ExchangeUnbindOk => class::EXCHANGE,
            QueueDeclare { .. } | QueueDeclareOk { .. } | QueueBind { .. } | QueueBindOk
            | QueuePurge { .. } | QueuePurgeOk { .. } | QueueDelete { .. }
            | QueueDeleteOk { .. } | QueueUnbind { .. } | QueueUnbindOk => class::QUEUE,
            BasicQos { .. } | BasicQosOk | BasicConsume { .. } | BasicConsumeOk { .. }
            | BasicCancel { .. } | BasicCancelOk { .. } | BasicPublish { .. }
            | BasicReturn { .. } | BasicDeliver { .. } | BasicGet { .. }
            | BasicGetOk { .. } | BasicGetEmpty | BasicAck { .. } | BasicReject { .. }
            | BasicRecoverAsync { .. } | BasicRecover { .. } | BasicRecoverOk
            | BasicNack { .. } => class::BASIC,
            ConfirmSelect { .. } | ConfirmSelectOk => class::CONFIRM,
            TxSelect | TxSelectOk | TxCommit | TxCommitOk | TxRollback | TxRollbackOk => {
                class::TX
            }
        }
    }

    /// The wire method id within the class.
    pub fn method_id(&self) -> u16 {
        use Method::*;
        match self {
            ConnectionStart { .. } => 10,
            ConnectionStartOk { .. } => 11,
            ConnectionSecure { .. } => 20,
            ConnectionSecureOk { .. } => 21,
            ConnectionTune { .. } => 30,
            ConnectionTuneOk { .. } => 31,
            ConnectionOpen { .. } => 40,
            ConnectionOpenOk => 41,
            ConnectionClose { .. } => 50,
            ConnectionCloseOk => 51,
            ConnectionBlocked { .. } => 60,
            ConnectionUnblocked => 61,

            ChannelOpen => 10,
            ChannelOpenOk => 11,
            ChannelFlow { .. } => 20,
            ChannelFlowOk { .. } => 21,
            ChannelClose { .. } => 40,
            ChannelCloseOk => 41,

            ExchangeDeclare { .. } => 10,
            ExchangeDeclareOk => 11,
            ExchangeDelete { .. } => 20,
            ExchangeDeleteOk => 21,
            ExchangeBind { .. } => 30,
            ExchangeBindOk => 31,
            ExchangeUnbind { .. } => 40,
            ExchangeUnbindOk => 51,

            QueueDeclare { .. } => 10,
            QueueDeclareOk { .. } => 11,
            QueueBind { .. } => 20,
            QueueBindOk => 21,
            QueuePurge { .. } => 30,
            QueuePurgeOk { .. } => 31,
            QueueDelete { .. } => 40,
            QueueDeleteOk { .. } => 41,
            QueueUnbind { .. } => 50,
            QueueUnbindOk => 51,

            BasicQos { .. } => 10,
            BasicQosOk => 11,
            BasicConsume { .. } => 20,
            BasicConsumeOk { .. } => 21,
            BasicCancel { .. } => 30,
            BasicCancelOk { .. } => 31,
            BasicPublish { .. } => 40,
            BasicReturn { .. } => 50,
            BasicDeliver { .. } => 60,
            BasicGet { .. } => 70,
            BasicGetOk { .. } => 71,
            BasicGetEmpty => 72,
            BasicAck { .. } => 80,
            BasicReject { .. } => 90,
            BasicRecoverAsync { .. } => 100,
            BasicRecover { .. } => 110,
            BasicRecoverOk => 111,
            BasicNack { .. } => 120,

            ConfirmSelect { .. } => 10,
            ConfirmSelectOk => 11,

            TxSelect => 10,
            TxSelectOk => 11,
            TxCommit => 20,
            TxCommitOk => 21,
            TxRollback => 30,
            TxRollbackOk => 31,
        }
    }

    /// Whether a header frame and body frames follow this method on the same
    /// channel.
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. }
                | Method::BasicReturn { .. }
                | Method::BasicDeliver { .. }
                | Method::BasicGetOk { .. }
        )
    }

    /// Encode class id, method id and arguments.
    pub fn encode(&self, encoder: &mut Encoder) -> Result<()> {
        encoder.put_u16(self.class_id());
        encoder.put_u16(self.method_id());
        self.encode_arguments(encoder)
    }

    fn encode_arguments(&self, e: &mut Encoder) -> Result<()> {
        use Method::*;
        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                e.put_u8(*version_major);
                e.put_u8(*version_minor);
                e.put_table(server_properties)?;
                e.put_long_string(mechanisms);
                e.put_long_string(locales);
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                e.put_table(client_properties)?;
                e.put_short_string(mechanism)?;
                e.put_long_string(response);
                e.put_short_string(locale)?;
            }
            ConnectionSecure { challenge } => e.put_long_string(challenge),
            ConnectionSecureOk { response } => e.put_long_string(response),
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                e.put_u16(*channel_max);
                e.put_u32(*frame_max);
                e.put_u16(*heartbeat);
            }
            ConnectionOpen { vhost } => {
                e.put_short_string(vhost)?;
                e.put_short_string("")?;
                e.put_u8(0);
            }
            ConnectionOpenOk => e.put_short_string("")?,
            ConnectionClose {
                reply_code,
                reply_text,
                failing_class,
                failing_method,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                failing_class,
                failing_method,
            } => {
                e.put_u16(*reply_code);
                e.put_short_string(reply_text)?;
                e.put_u16(*failing_class);
                e.put_u16(*failing_method);
            }
            ConnectionCloseOk | ConnectionUnblocked | ChannelCloseOk | ExchangeDeclareOk
            | ExchangeDeleteOk | ExchangeBindOk | ExchangeUnbindOk | QueueBindOk
            | QueueUnbindOk | BasicQosOk | BasicGetEmpty | BasicRecoverOk | ConfirmSelectOk
            | TxSelect | TxSelectOk | TxCommit | TxCommitOk | TxRollback | TxRollbackOk => {
                if matches!(self, BasicGetEmpty) {
                    e.put_short_string("")?;
                }
            }
            ConnectionBlocked { reason } => e.put_short_string(reason)?,

            ChannelOpen => e.put_short_string("")?,
            ChannelOpenOk => e.put_long_string(&[]),
            ChannelFlow { active } | ChannelFlowOk { active } => e.put_u8(u8::from(*active)),

            ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(exchange)?;
                e.put_short_string(kind)?;
                e.put_u8(pack_bits(&[*passive, *durable, *auto_delete, *internal, *no_wait]));
                e.put_table(arguments)?;
            }
            ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            } => {
                e.put_u16(0);
                e.put_short_string(exchange)?;
                e.put_u8(pack_bits(&[*if_unused, *no_wait]));
            }
            ExchangeBind {
                destination,
                source,
                routing_key,
                no_wait,
                arguments,
            }
            | ExchangeUnbind {
                destination,
                source,
                routing_key,
                no_wait,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(destination)?;
                e.put_short_string(source)?;
                e.put_short_string(routing_key)?;
                e.put_u8(u8::from(*no_wait));
                e.put_table(arguments)?;
            }

            QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_u8(pack_bits(&[*passive, *durable, *exclusive, *auto_delete, *no_wait]));
                e.put_table(arguments)?;
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                e.put_short_string(queue)?;
                e.put_u32(*message_count);
                e.put_u32(*consumer_count);
            }
            QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
                e.put_u8(u8::from(*no_wait));
                e.put_table(arguments)?;
            }
            QueuePurge { queue, no_wait } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_u8(u8::from(*no_wait));
            }
            QueuePurgeOk { message_count } | QueueDeleteOk { message_count } => {
                e.put_u32(*message_count);
            }
            QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_u8(pack_bits(&[*if_unused, *if_empty, *no_wait]));
            }
            QueueUnbind {
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
                e.put_table(arguments)?;
            }

            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                e.put_u32(*prefetch_size);
                e.put_u16(*prefetch_count);
                e.put_u8(u8::from(*global));
            }
            BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_short_string(consumer_tag)?;
                e.put_u8(pack_bits(&[*no_local, *no_ack, *exclusive, *no_wait]));
                e.put_table(arguments)?;
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                e.put_short_string(consumer_tag)?;
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                e.put_short_string(consumer_tag)?;
                e.put_u8(u8::from(*no_wait));
            }
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                e.put_u16(0);
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
                e.put_u8(pack_bits(&[*mandatory, *immediate]));
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                e.put_u16(*reply_code);
                e.put_short_string(reply_text)?;
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                e.put_short_string(consumer_tag)?;
                e.put_u64(*delivery_tag);
                e.put_u8(u8::from(*redelivered));
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
            }
            BasicGet { queue, no_ack } => {
                e.put_u16(0);
                e.put_short_string(queue)?;
                e.put_u8(u8::from(*no_ack));
            }
            BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                e.put_u64(*delivery_tag);
                e.put_u8(u8::from(*redelivered));
                e.put_short_string(exchange)?;
                e.put_short_string(routing_key)?;
                e.put_u32(*message_count);
            }
            BasicAck {
                delivery_tag,
                multiple,
            } => {
                e.put_u64(*delivery_tag);
                e.put_u8(u8::from(*multiple));
            }
            BasicReject {
                delivery_tag,
                requeue,
            } => {
                e.put_u64(*delivery_tag);
                e.put_u8(u8::from(*requeue));
            }
            BasicRecoverAsync { requeue } | BasicRecover { requeue } => {
                e.put_u8(u8::from(*requeue));
            }
            BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                e.put_u64(*delivery_tag);
                e.put_u8(pack_bits(&[*multiple, *requeue]));
            }

            ConfirmSelect { no_wait } => e.put_u8(u8::from(*no_wait)),
        }
        Ok(())
    }

    /// Decode a method payload (class id, method id, arguments).
    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Method> {
        let class_id = decoder.read_u16()?;
        let method_id = decoder.read_u16()?;
        Self::decode_arguments(class_id, method_id, decoder)
    }

    fn decode_arguments(class_id: u16, method_id: u16, d: &mut Decoder<'_>) -> Result<Method> {
        let method = match (class_id, method_id) {
            (class::CONNECTION, 10) => Method::ConnectionStart {
                version_major: d.read_u8()?,
                version_minor: d.read_u8()?,
                server_properties: d.read_table()?,
                mechanisms: d.read_long_string()?,
                locales: d.read_long_string()?,
            },
            (class::CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: d.read_table()?,
                mechanism: d.read_short_string()?,
                response: d.read_long_string()?,
                locale: d.read_short_string()?,
            },
            (class::CONNECTION, 20) => Method::ConnectionSecure {
                challenge: d.read_long_string()?,
            },
            (class::CONNECTION, 21) => Method::ConnectionSecureOk {
                response: d.read_long_string()?,
            },
            (class::CONNECTION, 30) => Method::ConnectionTune {
                channel_max: d.read_u16()?,
                frame_max: d.read_u32()?,
                heartbeat: d.read_u16()?,
            },
            (class::CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: d.read_u16()?,
                frame_max: d.read_u32()?,
                heartbeat: d.read_u16()?,
            },
            (class::CONNECTION, 40) => {
                let vhost = d.read_short_string()?;
                let _reserved = d.read_short_string()?;
                let _reserved_bit = d.read_u8()?;
                Method::ConnectionOpen { vhost }
            }
            (class::CONNECTION, 41) => {
                let _reserved = d.read_short_string()?;
                Method::ConnectionOpenOk
            }
            (class::CONNECTION, 50) => Method::ConnectionClose {
                reply_code: d.read_u16()?,
                reply_text: d.read_short_string()?,
                failing_class: d.read_u16()?,
                failing_method: d.read_u16()?,
            },
            (class::CONNECTION, 51) => Method::ConnectionCloseOk,
            (class::CONNECTION, 60) => Method::ConnectionBlocked {
                reason: d.read_short_string()?,
            },
            (class::CONNECTION, 61) => Method::ConnectionUnblocked,

            (class::CHANNEL, 10) => {
                let _reserved = d.read_short_string()?;
                Method::ChannelOpen
            }
            (class::CHANNEL, 11) => {
                let _reserved = d.read_long_string()?;
                Method::ChannelOpenOk
            }
            (class::CHANNEL, 20) => Method::ChannelFlow {
                active: d.read_u8()? != 0,
            },
            (class::CHANNEL, 21) => Method::ChannelFlowOk {
                active: d.read_u8()? != 0,
            },
            (class::CHANNEL, 40) => Method::ChannelClose {
                reply_code: d.read_u16()?,
                reply_text: d.read_short_string()?,
                failing_class: d.read_u16()?,
                failing_method: d.read_u16()?,
            },
            (class::CHANNEL, 41) => Method::ChannelCloseOk,

            (class::EXCHANGE, 10) => {
                let _ticket = d.read_u16()?;
                let exchange = d.read_short_string()?;
                let kind = d.read_short_string()?;
                let bits = d.read_u8()?;
                let arguments = d.read_table()?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bit(bits, 0),
                    durable: bit(bits, 1),
                    auto_delete: bit(bits, 2),
                    internal: bit(bits, 3),
                    no_wait: bit(bits, 4),
                    arguments,
                }
            }
            (class::EXCHANGE, 11) => Method::ExchangeDeclareOk,
            (class::EXCHANGE, 20) => {
                let _ticket = d.read_u16()?;
                let exchange = d.read_short_string()?;
                let bits = d.read_u8()?;
                Method::ExchangeDelete {
                    exchange,
                    if_unused: bit(bits, 0),
                    no_wait: bit(bits, 1),
                }
            }
            (class::EXCHANGE, 21) => Method::ExchangeDeleteOk,
            (class::EXCHANGE, 30) | (class::EXCHANGE, 40) => {
                let _ticket = d.read_u16()?;
                let destination = d.read_short_string()?;
                let source = d.read_short_string()?;
                let routing_key = d.read_short_string()?;
                let no_wait = d.read_u8()? != 0;
                let arguments = d.read_table()?;
                if method_id == 30 {
                    Method::ExchangeBind {
                        destination,
                        source,
                        routing_key,
                        no_wait,
                        arguments,
                    }
                } else {
                    Method::ExchangeUnbind {
                        destination,
                        source,
                        routing_key,
                        no_wait,
                        arguments,
                    }
                }
            }
            (class::EXCHANGE, 31) => Method::ExchangeBindOk,
            (class::EXCHANGE, 51) => Method::ExchangeUnbindOk,

            (class::QUEUE, 10) => {
                let _ticket = d.read_u16()?;
                let queue = d.read_short_string()?;
                let bits = d.read_u8()?;
                let arguments = d.read_table()?;
                Method::QueueDeclare {
                    queue,
                    passive: bit(bits, 0),
                    durable: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    auto_delete: bit(bits, 3),
                    no_wait: bit(bits, 4),
                    arguments,
                }
            }
            (class::QUEUE, 11) => Method::QueueDeclareOk {
                queue: d.read_short_string()?,
                message_count: d.read_u32()?,
                consumer_count: d.read_u32()?,
            },
            (class::QUEUE, 20) => {
                let _ticket = d.read_u16()?;
                Method::QueueBind {
                    queue: d.read_short_string()?,
                    exchange: d.read_short_string()?,
                    routing_key: d.read_short_string()?,
                    no_wait: d.read_u8()? != 0,
                    arguments: d.read_table()?,
                }
            }
            (class::QUEUE, 21) => Method::QueueBindOk,
            (class::QUEUE, 30) => {
                let _ticket = d.read_u16()?;
                Method::QueuePurge {
                    queue: d.read_short_string()?,
                    no_wait: d.read_u8()? != 0,
                }
            }
            (class::QUEUE, 31) => Method::QueuePurgeOk {
                message_count: d.read_u32()?,
            },
            (class::QUEUE, 40) => {
                let _ticket = d.read_u16()?;
                let queue = d.read_short_string()?;
                let bits = d.read_u8()?;
                Method::QueueDelete {
                    queue,
                    if_unused: bit(bits, 0),
                    if_empty: bit(bits, 1),
                    no_wait: bit(bits, 2),
                }
            }
            (class::QUEUE, 41) => Method::QueueDeleteOk {
                message_count: d.read_u32()?,
            },
            (class::QUEUE, 50) => {
                let _ticket = d.read_u16()?;
                Method::QueueUnbind {
                    queue: d.read_short_string()?,
                    exchange: d.read_short_string()?,
                    routing_key: d.read_short_string()?,
                    arguments: d.read_table()?,
                }
            }
            (class::QUEUE, 51) => Method::QueueUnbindOk,

            (class::BASIC, 10) => Method::BasicQos {
                prefetch_size: d.read_u32()?,
                prefetch_count: d.read_u16()?,
                global: d.read_u8()? != 0,
            },
            (class::BASIC, 11) => Method::BasicQosOk,
            (class::BASIC, 20) => {
                let _ticket = d.read_u16()?;
                let queue = d.read_short_string()?;
                let consumer_tag = d.read_short_string()?;
                let bits = d.read_u8()?;
                let arguments = d.read_table()?;
                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bit(bits, 0),
                    no_ack: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    no_wait: bit(bits, 3),
                    arguments,
                }
            }
            (class::BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: d.read_short_string()?,
            },
            (class::BASIC, 30) => Method::BasicCancel {
                consumer_tag: d.read_short_string()?,
                no_wait: d.read_u8()? != 0,
            },
            (class::BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: d.read_short_string()?,
            },
            (class::BASIC, 40) => {
                let _ticket = d.read_u16()?;
                let exchange = d.read_short_string()?;
                let routing_key = d.read_short_string()?;
                let bits = d.read_u8()?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bit(bits, 0),
                    immediate: bit(bits, 1),
                }
            }
            (class::BASIC, 50) => Method::BasicReturn {
                reply_code: d.read_u16()?,
                reply_text: d.read_short_string()?,
                exchange: d.read_short_string()?,
                routing_key: d.read_short_string()?,
            },
            (class::BASIC, 60) => Method::BasicDeliver {
                consumer_tag: d.read_short_string()?,
                delivery_tag: d.read_u64()?,
                redelivered: d.read_u8()? != 0,
                exchange: d.read_short_string()?,
                routing_key: d.read_short_string()?,
            },
            (class::BASIC, 70) => {
                let _ticket = d.read_u16()?;
                Method::BasicGet {
                    queue: d.read_short_string()?,
                    no_ack: d.read_u8()? != 0,
                }
            }
            (class::BASIC, 71) => Method::BasicGetOk {
                delivery_tag: d.read_u64()?,
                redelivered: d.read_u8()? != 0,
                exchange: d.read_short_string()?,
                routing_key: d.read_short_string()?,
                message_count: d.read_u32()?,
            },
            (class::BASIC, 72) => {
                let _reserved = d.read_short_string()?;
                Method::BasicGetEmpty
            }
            (class::BASIC, 80) => Method::BasicAck {
                delivery_tag: d.read_u64()?,
                multiple: d.read_u8()? != 0,
            },
            (class::BASIC, 90) => Method::BasicReject {
                delivery_tag: d.read_u64()?,
                requeue: d.read_u8()? != 0,
            },
            (class::BASIC, 100) => Method::BasicRecoverAsync {
                requeue: d.read_u8()? != 0,
            },
            (class::BASIC, 110) => Method::BasicRecover {
                requeue: d.read_u8()? != 0,
            },
            (class::BASIC, 111) => Method::BasicRecoverOk,
            (class::BASIC, 120) => {
                let delivery_tag = d.read_u64()?;
                let bits = d.read_u8()?;
                Method::BasicNack {
                    delivery_tag,
                    multiple: bit(bits, 0),
                    requeue: bit(bits, 1),
                }
            }

            (class::CONFIRM, 10) => Method::ConfirmSelect {
                no_wait: d.read_u8()? != 0,
            },
            (class::CONFIRM, 11) => Method::ConfirmSelectOk,

            (class::TX, 10) => Method::TxSelect,
            (class::TX, 11) => Method::TxSelectOk,
            (class::TX, 20) => Method::TxCommit,
            (class::TX, 21) => Method::TxCommitOk,
            (class::TX, 30) => Method::TxRollback,
            (class::TX, 31) => Method::TxRollbackOk,

            _ => {
                return Err(Error::codec(format!(
                    "unknown class/method pair {}/{}",
                    class_id, method_id
                )))
            }
        };
        Ok(method)
    }
}

fn pack_bits(bits: &[bool]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, b)| acc | (u8::from(*b) << i))
}

fn bit(byte: u8, index: u8) -> bool {
    byte & (1 << index) != 0
}
