// All messages exchanged between clients, pilots and control towers.
//
// Messages are internal to the system and can change between releases;
// applications interact through the client crate instead. Several decoders
// accept missing trailing fields and default them, so that newer senders
// can add fields without breaking older receivers.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cascade_common::{GapKind, NamespaceId, SequenceNumber, StreamId, SubscriptionId, TenantId, Topic};
use uuid::Uuid;

use crate::coding::{
    get_fixed16, get_fixed64, get_length_prefixed, get_string, get_topic_id, get_varint64,
    put_fixed16, put_fixed64, put_length_prefixed, put_string, put_topic_id, put_varint64,
};
use crate::{Error, Result};

/// Single-byte message type tag leading every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    Publish = 2,
    // 3 was a deprecated metadata message and must not be reused.
    DataAck = 4,
    Gap = 5,
    Deliver = 6,
    Goodbye = 7,
    Subscribe = 8,
    Unsubscribe = 9,
    DeliverGap = 10,
    DeliverData = 11,
    FindTailSeqno = 12,
    TailSeqno = 13,
    DeliverBatch = 14,
    Heartbeat = 15,
    HeartbeatDelta = 16,
    BacklogQuery = 17,
    BacklogFill = 18,
    Introduction = 19,
    SubAck = 20,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Ping,
            2 => Self::Publish,
            4 => Self::DataAck,
            5 => Self::Gap,
            6 => Self::Deliver,
            7 => Self::Goodbye,
            8 => Self::Subscribe,
            9 => Self::Unsubscribe,
            10 => Self::DeliverGap,
            11 => Self::DeliverData,
            12 => Self::FindTailSeqno,
            13 => Self::TailSeqno,
            14 => Self::DeliverBatch,
            15 => Self::Heartbeat,
            16 => Self::HeartbeatDelta,
            17 => Self::BacklogQuery,
            18 => Self::BacklogFill,
            19 => Self::Introduction,
            20 => Self::SubAck,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PingKind {
    Request = 0,
    Response = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoodbyeCode {
    /// The peer is closing the stream deliberately.
    Graceful = 0,
    /// The stream is closing because the connection failed.
    SocketError = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OriginKind {
    Server = 0,
    Client = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnsubscribeReason {
    RequestedByUser = 0,
    /// Subscription parameters could not be honored.
    Invalid = 1,
    /// The server asks the subscriber to resubscribe later.
    BackOff = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Success = 0,
    Failure = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FillResult {
    Success = 0,
    OutOfRange = 1,
}

fn put_prefix(out: &mut BytesMut, mtype: MessageType, tenant: TenantId) {
    out.put_u8(mtype as u8);
    put_fixed16(out, tenant);
}

fn gap_kind_to_u8(kind: GapKind) -> u8 {
    match kind {
        GapKind::Benign => 0,
        GapKind::Retention => 1,
        GapKind::DataLoss => 2,
    }
}

fn gap_kind_from_u8(value: u8) -> Result<GapKind> {
    Ok(match value {
        0 => GapKind::Benign,
        1 => GapKind::Retention,
        2 => GapKind::DataLoss,
        _ => return Err(Error::BadField("gap type")),
    })
}

/// Acknowledgement of a single published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
    pub message_id: Uuid,
    pub seqno: SequenceNumber,
}

/// Position on a topic used when (re)subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub source: String,
    pub seqno: SequenceNumber,
}

/// Payload of a Publish or Deliver message.
///
/// The storage section (tenant, topic identity, message ID, payload) is
/// exactly what the pilot appends to the log; the tailer decodes the same
/// bytes back out of each log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub tenant: TenantId,
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub message_id: Uuid,
    pub payload: Bytes,
    pub seqno_prev: SequenceNumber,
    pub seqno: SequenceNumber,
}

impl DataMessage {
    pub fn encode_storage(&self, out: &mut BytesMut) {
        put_fixed16(out, self.tenant);
        put_topic_id(out, &self.namespace, &self.topic);
        put_length_prefixed(out, self.message_id.as_bytes());
        put_length_prefixed(out, &self.payload);
    }

    /// Decodes the storage section of a log record. Sequence numbers are
    /// not stored in the record; the caller supplies them from the log.
    pub fn decode_storage(
        input: &mut Bytes,
        seqno_prev: SequenceNumber,
        seqno: SequenceNumber,
    ) -> Result<Self> {
        let tenant = get_fixed16(input)?;
        let (namespace, topic) = get_topic_id(input)?;
        let message_id = get_message_id(input)?;
        let payload = get_length_prefixed(input)?;
        Ok(Self {
            tenant,
            namespace,
            topic,
            message_id,
            payload,
            seqno_prev,
            seqno,
        })
    }
}

/// Record delivery bound to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeliverData {
    pub tenant: TenantId,
    pub sub_id: SubscriptionId,
    pub seqno_prev: SequenceNumber,
    pub seqno: SequenceNumber,
    pub message_id: Uuid,
    pub payload: Bytes,
    pub namespace: NamespaceId,
    pub topic: Topic,
}

impl MessageDeliverData {
    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(MessageType::DeliverData as u8);
        put_fixed16(out, self.tenant);
        put_deliver_prefix(out, self.sub_id, self.seqno_prev, self.seqno);
        put_length_prefixed(out, self.message_id.as_bytes());
        put_length_prefixed(out, &self.payload);
        put_topic_id(out, &self.namespace, &self.topic);
    }

    fn decode_body(tenant: TenantId, input: &mut Bytes) -> Result<Self> {
        let (sub_id, seqno_prev, seqno) = get_deliver_prefix(input)?;
        let message_id = get_message_id(input)?;
        let payload = get_length_prefixed(input)?;
        // Topic identity is a newer trailing field; default when absent.
        let (namespace, topic) = get_topic_id(input).unwrap_or_default();
        Ok(Self {
            tenant,
            sub_id,
            seqno_prev,
            seqno,
            message_id,
            payload,
            namespace,
            topic,
        })
    }
}

fn put_deliver_prefix(
    out: &mut BytesMut,
    sub_id: SubscriptionId,
    seqno_prev: SequenceNumber,
    seqno: SequenceNumber,
) {
    debug_assert!(seqno >= seqno_prev);
    put_varint64(out, sub_id);
    put_varint64(out, seqno_prev);
    // Deliveries compress the pair on the wire as previous + delta.
    put_varint64(out, seqno - seqno_prev);
}

fn get_deliver_prefix(input: &mut Bytes) -> Result<(SubscriptionId, SequenceNumber, SequenceNumber)> {
    let sub_id = get_varint64(input)?;
    let seqno_prev = get_varint64(input)?;
    let delta = get_varint64(input)?;
    let seqno = seqno_prev
        .checked_add(delta)
        .ok_or(Error::BadField("sequence number delta"))?;
    Ok((sub_id, seqno_prev, seqno))
}

fn get_message_id(input: &mut Bytes) -> Result<Uuid> {
    let raw = get_length_prefixed(input)?;
    if raw.len() < 16 {
        return Err(Error::BadField("message id"));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw[..16]);
    Ok(Uuid::from_bytes(bytes))
}

fn put_cursors(out: &mut BytesMut, cursors: &[Cursor]) {
    put_varint64(out, cursors.len() as u64);
    for cursor in cursors {
        put_string(out, &cursor.source);
    }
    for cursor in cursors {
        put_varint64(out, cursor.seqno);
    }
}

fn get_cursors(input: &mut Bytes) -> Result<Vec<Cursor>> {
    let count = get_varint64(input)? as usize;
    let mut sources = Vec::with_capacity(count);
    for _ in 0..count {
        sources.push(get_string(input)?);
    }
    let mut cursors = Vec::with_capacity(count);
    for source in sources {
        let seqno = get_varint64(input)?;
        cursors.push(Cursor { source, seqno });
    }
    Ok(cursors)
}

fn put_properties(out: &mut BytesMut, properties: &[(String, String)]) {
    put_varint64(out, properties.len() as u64);
    for (key, value) in properties {
        put_string(out, key);
        put_string(out, value);
    }
}

fn get_properties(input: &mut Bytes) -> Result<Vec<(String, String)>> {
    let count = get_varint64(input)? as usize;
    let mut properties = Vec::with_capacity(count);
    for _ in 0..count {
        let key = get_string(input)?;
        let value = get_string(input)?;
        properties.push((key, value));
    }
    Ok(properties)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping {
        tenant: TenantId,
        ping: PingKind,
        cookie: Bytes,
    },
    Publish(DataMessage),
    Deliver(DataMessage),
    DataAck {
        tenant: TenantId,
        acks: Vec<Ack>,
    },
    Gap {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
    },
    Goodbye {
        tenant: TenantId,
        code: GoodbyeCode,
        origin: OriginKind,
    },
    Subscribe {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        start_seqno: SequenceNumber,
        sub_id: SubscriptionId,
        cursors: Vec<Cursor>,
    },
    Unsubscribe {
        tenant: TenantId,
        sub_id: SubscriptionId,
        reason: UnsubscribeReason,
        namespace: NamespaceId,
        topic: Topic,
    },
    DeliverGap {
        tenant: TenantId,
        sub_id: SubscriptionId,
        seqno_prev: SequenceNumber,
        seqno: SequenceNumber,
        kind: GapKind,
        namespace: NamespaceId,
        topic: Topic,
    },
    DeliverData(MessageDeliverData),
    FindTailSeqno {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
    },
    TailSeqno {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        seqno: SequenceNumber,
    },
    DeliverBatch {
        tenant: TenantId,
        messages: Vec<MessageDeliverData>,
    },
    Heartbeat {
        tenant: TenantId,
        timestamp_ms: u64,
        healthy_streams: Vec<StreamId>,
    },
    HeartbeatDelta {
        tenant: TenantId,
        timestamp_ms: u64,
        added: Vec<StreamId>,
        removed: Vec<StreamId>,
    },
    BacklogQuery {
        tenant: TenantId,
        sub_id: SubscriptionId,
        namespace: NamespaceId,
        topic: Topic,
        source: String,
        seqno: SequenceNumber,
    },
    BacklogFill {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        source: String,
        prev_seqno: SequenceNumber,
        next_seqno: SequenceNumber,
        result: FillResult,
        info: String,
    },
    Introduction {
        tenant: TenantId,
        stream_properties: Vec<(String, String)>,
        client_properties: Vec<(String, String)>,
    },
    SubAck {
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        sub_id: SubscriptionId,
        cursors: Vec<Cursor>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Ping { .. } => MessageType::Ping,
            Message::Publish(_) => MessageType::Publish,
            Message::Deliver(_) => MessageType::Deliver,
            Message::DataAck { .. } => MessageType::DataAck,
            Message::Gap { .. } => MessageType::Gap,
            Message::Goodbye { .. } => MessageType::Goodbye,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::DeliverGap { .. } => MessageType::DeliverGap,
            Message::DeliverData(_) => MessageType::DeliverData,
            Message::FindTailSeqno { .. } => MessageType::FindTailSeqno,
            Message::TailSeqno { .. } => MessageType::TailSeqno,
            Message::DeliverBatch { .. } => MessageType::DeliverBatch,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatDelta { .. } => MessageType::HeartbeatDelta,
            Message::BacklogQuery { .. } => MessageType::BacklogQuery,
            Message::BacklogFill { .. } => MessageType::BacklogFill,
            Message::Introduction { .. } => MessageType::Introduction,
            Message::SubAck { .. } => MessageType::SubAck,
        }
    }

    pub fn tenant(&self) -> TenantId {
        match self {
            Message::Ping { tenant, .. }
            | Message::DataAck { tenant, .. }
            | Message::Gap { tenant, .. }
            | Message::Goodbye { tenant, .. }
            | Message::Subscribe { tenant, .. }
            | Message::Unsubscribe { tenant, .. }
            | Message::DeliverGap { tenant, .. }
            | Message::FindTailSeqno { tenant, .. }
            | Message::TailSeqno { tenant, .. }
            | Message::DeliverBatch { tenant, .. }
            | Message::Heartbeat { tenant, .. }
            | Message::HeartbeatDelta { tenant, .. }
            | Message::BacklogQuery { tenant, .. }
            | Message::BacklogFill { tenant, .. }
            | Message::Introduction { tenant, .. }
            | Message::SubAck { tenant, .. } => *tenant,
            Message::Publish(data) | Message::Deliver(data) => data.tenant,
            Message::DeliverData(data) => data.tenant,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Message::Ping { tenant, ping, cookie } => {
                put_prefix(out, MessageType::Ping, *tenant);
                out.put_u8(*ping as u8);
                put_length_prefixed(out, cookie);
            }
            Message::Publish(data) | Message::Deliver(data) => {
                out.put_u8(self.message_type() as u8);
                put_varint64(out, data.seqno_prev);
                put_varint64(out, data.seqno);
                data.encode_storage(out);
            }
            Message::DataAck { tenant, acks } => {
                put_prefix(out, MessageType::DataAck, *tenant);
                put_varint64(out, acks.len() as u64);
                for ack in acks {
                    out.put_u8(ack.status as u8);
                    out.extend_from_slice(ack.message_id.as_bytes());
                    put_varint64(out, ack.seqno);
                }
            }
            Message::Gap {
                tenant,
                namespace,
                topic,
                kind,
                from,
                to,
            } => {
                put_prefix(out, MessageType::Gap, *tenant);
                put_topic_id(out, namespace, topic);
                out.put_u8(gap_kind_to_u8(*kind));
                put_varint64(out, *from);
                put_varint64(out, *to);
            }
            Message::Goodbye { tenant, code, origin } => {
                put_prefix(out, MessageType::Goodbye, *tenant);
                out.put_u8(*code as u8);
                out.put_u8(*origin as u8);
            }
            Message::Subscribe {
                tenant,
                namespace,
                topic,
                start_seqno,
                sub_id,
                cursors,
            } => {
                put_prefix(out, MessageType::Subscribe, *tenant);
                put_topic_id(out, namespace, topic);
                put_varint64(out, *start_seqno);
                put_varint64(out, *sub_id);
                put_cursors(out, cursors);
            }
            Message::Unsubscribe {
                tenant,
                sub_id,
                reason,
                namespace,
                topic,
            } => {
                put_prefix(out, MessageType::Unsubscribe, *tenant);
                put_varint64(out, *sub_id);
                out.put_u8(*reason as u8);
                put_topic_id(out, namespace, topic);
            }
            Message::DeliverGap {
                tenant,
                sub_id,
                seqno_prev,
                seqno,
                kind,
                namespace,
                topic,
            } => {
                put_prefix(out, MessageType::DeliverGap, *tenant);
                put_deliver_prefix(out, *sub_id, *seqno_prev, *seqno);
                out.put_u8(gap_kind_to_u8(*kind));
                put_topic_id(out, namespace, topic);
            }
            Message::DeliverData(data) => data.encode_into(out),
            Message::FindTailSeqno {
                tenant,
                namespace,
                topic,
            } => {
                put_prefix(out, MessageType::FindTailSeqno, *tenant);
                put_topic_id(out, namespace, topic);
            }
            Message::TailSeqno {
                tenant,
                namespace,
                topic,
                seqno,
            } => {
                put_prefix(out, MessageType::TailSeqno, *tenant);
                put_topic_id(out, namespace, topic);
                put_varint64(out, *seqno);
            }
            Message::DeliverBatch { tenant, messages } => {
                put_prefix(out, MessageType::DeliverBatch, *tenant);
                put_varint64(out, messages.len() as u64);
                for message in messages {
                    let mut one = BytesMut::new();
                    message.encode_into(&mut one);
                    put_length_prefixed(out, &one);
                }
            }
            Message::Heartbeat {
                tenant,
                timestamp_ms,
                healthy_streams,
            } => {
                put_prefix(out, MessageType::Heartbeat, *tenant);
                put_fixed64(out, *timestamp_ms);
                debug_assert!(healthy_streams.windows(2).all(|w| w[0] < w[1]));
                for stream in healthy_streams {
                    put_varint64(out, *stream);
                }
            }
            Message::HeartbeatDelta {
                tenant,
                timestamp_ms,
                added,
                removed,
            } => {
                put_prefix(out, MessageType::HeartbeatDelta, *tenant);
                put_fixed64(out, *timestamp_ms);
                debug_assert!(added.windows(2).all(|w| w[0] < w[1]));
                debug_assert!(removed.windows(2).all(|w| w[0] < w[1]));
                put_varint64(out, added.len() as u64);
                for stream in added {
                    put_varint64(out, *stream);
                }
                put_varint64(out, removed.len() as u64);
                for stream in removed {
                    put_varint64(out, *stream);
                }
            }
            Message::BacklogQuery {
                tenant,
                sub_id,
                namespace,
                topic,
                source,
                seqno,
            } => {
                put_prefix(out, MessageType::BacklogQuery, *tenant);
                put_varint64(out, *sub_id);
                put_topic_id(out, namespace, topic);
                put_string(out, source);
                put_varint64(out, *seqno);
            }
            Message::BacklogFill {
                tenant,
                namespace,
                topic,
                source,
                prev_seqno,
                next_seqno,
                result,
                info,
            } => {
                put_prefix(out, MessageType::BacklogFill, *tenant);
                put_topic_id(out, namespace, topic);
                put_string(out, source);
                put_varint64(out, *prev_seqno);
                put_varint64(out, *next_seqno);
                out.put_u8(*result as u8);
                put_string(out, info);
            }
            Message::Introduction {
                tenant,
                stream_properties,
                client_properties,
            } => {
                put_prefix(out, MessageType::Introduction, *tenant);
                put_properties(out, stream_properties);
                put_properties(out, client_properties);
            }
            Message::SubAck {
                tenant,
                namespace,
                topic,
                sub_id,
                cursors,
            } => {
                put_prefix(out, MessageType::SubAck, *tenant);
                put_topic_id(out, namespace, topic);
                put_varint64(out, *sub_id);
                put_cursors(out, cursors);
            }
        }
    }

    pub fn decode(input: &mut Bytes) -> Result<Message> {
        if !input.has_remaining() {
            return Err(Error::Truncated);
        }
        let mtype = MessageType::from_u8(input.get_u8())?;
        match mtype {
            MessageType::Publish | MessageType::Deliver => {
                let seqno_prev = get_varint64(input)?;
                let seqno = get_varint64(input)?;
                let data = DataMessage::decode_storage(input, seqno_prev, seqno)?;
                Ok(match mtype {
                    MessageType::Publish => Message::Publish(data),
                    _ => Message::Deliver(data),
                })
            }
            _ => {
                let tenant = get_fixed16(input)?;
                Self::decode_body(mtype, tenant, input)
            }
        }
    }

    fn decode_body(mtype: MessageType, tenant: TenantId, input: &mut Bytes) -> Result<Message> {
        Ok(match mtype {
            MessageType::Publish | MessageType::Deliver => unreachable!("handled in decode"),
            MessageType::Ping => {
                if !input.has_remaining() {
                    return Err(Error::BadField("ping type"));
                }
                let ping = match input.get_u8() {
                    0 => PingKind::Request,
                    1 => PingKind::Response,
                    _ => return Err(Error::BadField("ping type")),
                };
                let cookie = get_length_prefixed(input)?;
                Message::Ping { tenant, ping, cookie }
            }
            MessageType::DataAck => {
                let count = get_varint64(input)? as usize;
                let mut acks = Vec::with_capacity(count);
                for _ in 0..count {
                    if !input.has_remaining() {
                        return Err(Error::BadField("ack status"));
                    }
                    let status = match input.get_u8() {
                        0 => AckStatus::Success,
                        1 => AckStatus::Failure,
                        _ => return Err(Error::BadField("ack status")),
                    };
                    if input.remaining() < 16 {
                        return Err(Error::BadField("ack message id"));
                    }
                    let mut id = [0u8; 16];
                    input.copy_to_slice(&mut id);
                    let seqno = get_varint64(input)?;
                    acks.push(Ack {
                        status,
                        message_id: Uuid::from_bytes(id),
                        seqno,
                    });
                }
                Message::DataAck { tenant, acks }
            }
            MessageType::Gap => {
                let (namespace, topic) = get_topic_id(input)?;
                if !input.has_remaining() {
                    return Err(Error::BadField("gap type"));
                }
                let kind = gap_kind_from_u8(input.get_u8())?;
                let from = get_varint64(input)?;
                let to = get_varint64(input)?;
                Message::Gap {
                    tenant,
                    namespace,
                    topic,
                    kind,
                    from,
                    to,
                }
            }
            MessageType::Goodbye => {
                if input.remaining() < 2 {
                    return Err(Error::BadField("goodbye"));
                }
                let code = match input.get_u8() {
                    0 => GoodbyeCode::Graceful,
                    1 => GoodbyeCode::SocketError,
                    _ => return Err(Error::BadField("goodbye code")),
                };
                let origin = match input.get_u8() {
                    0 => OriginKind::Server,
                    1 => OriginKind::Client,
                    _ => return Err(Error::BadField("goodbye origin")),
                };
                Message::Goodbye { tenant, code, origin }
            }
            MessageType::Subscribe => {
                let (namespace, topic) = get_topic_id(input)?;
                let start_seqno = get_varint64(input)?;
                let sub_id = get_varint64(input)?;
                // The cursor section is newer than the start seqno; older
                // senders omit it entirely.
                let cursors = get_cursors(input).unwrap_or_default();
                Message::Subscribe {
                    tenant,
                    namespace,
                    topic,
                    start_seqno,
                    sub_id,
                    cursors,
                }
            }
            MessageType::Unsubscribe => {
                let sub_id = get_varint64(input)?;
                if !input.has_remaining() {
                    return Err(Error::BadField("unsubscribe reason"));
                }
                let reason = match input.get_u8() {
                    0 => UnsubscribeReason::RequestedByUser,
                    1 => UnsubscribeReason::Invalid,
                    2 => UnsubscribeReason::BackOff,
                    _ => return Err(Error::BadField("unsubscribe reason")),
                };
                let (namespace, topic) = get_topic_id(input).unwrap_or_default();
                Message::Unsubscribe {
                    tenant,
                    sub_id,
                    reason,
                    namespace,
                    topic,
                }
            }
            MessageType::DeliverGap => {
                let (sub_id, seqno_prev, seqno) = get_deliver_prefix(input)?;
                if !input.has_remaining() {
                    return Err(Error::BadField("gap type"));
                }
                let kind = gap_kind_from_u8(input.get_u8())?;
                let (namespace, topic) = get_topic_id(input).unwrap_or_default();
                Message::DeliverGap {
                    tenant,
                    sub_id,
                    seqno_prev,
                    seqno,
                    kind,
                    namespace,
                    topic,
                }
            }
            MessageType::DeliverData => {
                Message::DeliverData(MessageDeliverData::decode_body(tenant, input)?)
            }
            MessageType::FindTailSeqno => {
                let (namespace, topic) = get_topic_id(input)?;
                Message::FindTailSeqno {
                    tenant,
                    namespace,
                    topic,
                }
            }
            MessageType::TailSeqno => {
                let (namespace, topic) = get_topic_id(input)?;
                let seqno = get_varint64(input)?;
                Message::TailSeqno {
                    tenant,
                    namespace,
                    topic,
                    seqno,
                }
            }
            MessageType::DeliverBatch => {
                let count = get_varint64(input)? as usize;
                let mut messages = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut one = get_length_prefixed(input)?;
                    if !one.has_remaining() || one.get_u8() != MessageType::DeliverData as u8 {
                        return Err(Error::BadField("batched message type"));
                    }
                    let inner_tenant = get_fixed16(&mut one)?;
                    messages.push(MessageDeliverData::decode_body(inner_tenant, &mut one)?);
                }
                Message::DeliverBatch { tenant, messages }
            }
            MessageType::Heartbeat => {
                // An empty body is a legacy heartbeat with no stream set.
                if !input.has_remaining() {
                    return Ok(Message::Heartbeat {
                        tenant,
                        timestamp_ms: 0,
                        healthy_streams: Vec::new(),
                    });
                }
                let timestamp_ms = get_fixed64(input)?;
                let mut healthy_streams = Vec::new();
                while input.has_remaining() {
                    healthy_streams.push(get_varint64(input)?);
                }
                Message::Heartbeat {
                    tenant,
                    timestamp_ms,
                    healthy_streams,
                }
            }
            MessageType::HeartbeatDelta => {
                let timestamp_ms = get_fixed64(input)?;
                let num_added = get_varint64(input)? as usize;
                let mut added = Vec::with_capacity(num_added);
                for _ in 0..num_added {
                    added.push(get_varint64(input)?);
                }
                let num_removed = get_varint64(input)? as usize;
                let mut removed = Vec::with_capacity(num_removed);
                for _ in 0..num_removed {
                    removed.push(get_varint64(input)?);
                }
                Message::HeartbeatDelta {
                    tenant,
                    timestamp_ms,
                    added,
                    removed,
                }
            }
            MessageType::BacklogQuery => {
                let sub_id = get_varint64(input)?;
                let (namespace, topic) = get_topic_id(input)?;
                let source = get_string(input)?;
                let seqno = get_varint64(input)?;
                Message::BacklogQuery {
                    tenant,
                    sub_id,
                    namespace,
                    topic,
                    source,
                    seqno,
                }
            }
            MessageType::BacklogFill => {
                let (namespace, topic) = get_topic_id(input)?;
                let source = get_string(input)?;
                let prev_seqno = get_varint64(input)?;
                let next_seqno = get_varint64(input)?;
                if !input.has_remaining() {
                    return Err(Error::BadField("fill result"));
                }
                let result = match input.get_u8() {
                    0 => FillResult::Success,
                    1 => FillResult::OutOfRange,
                    _ => return Err(Error::BadField("fill result")),
                };
                // Info may not be there for older senders.
                let info = get_string(input).unwrap_or_default();
                Message::BacklogFill {
                    tenant,
                    namespace,
                    topic,
                    source,
                    prev_seqno,
                    next_seqno,
                    result,
                    info,
                }
            }
            MessageType::Introduction => {
                let stream_properties = get_properties(input)?;
                let client_properties = get_properties(input)?;
                Message::Introduction {
                    tenant,
                    stream_properties,
                    client_properties,
                }
            }
            MessageType::SubAck => {
                let (namespace, topic) = get_topic_id(input)?;
                let sub_id = get_varint64(input)?;
                let cursors = get_cursors(input).unwrap_or_default();
                Message::SubAck {
                    tenant,
                    namespace,
                    topic,
                    sub_id,
                    cursors,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let mut bytes = message.encode();
        let decoded = Message::decode(&mut bytes).expect("decode");
        assert!(!bytes.has_remaining(), "trailing bytes after decode");
        decoded
    }

    #[test]
    fn deliver_data_round_trip_preserves_delta_encoding() {
        let message = Message::DeliverData(MessageDeliverData {
            tenant: 102,
            sub_id: 9,
            seqno_prev: 41,
            seqno: 44,
            message_id: Uuid::new_v4(),
            payload: Bytes::from_static(b"test_message"),
            namespace: "102".into(),
            topic: "test_topic".into(),
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn deliver_delta_overflow_is_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(MessageType::DeliverGap as u8);
        put_fixed16(&mut out, 1);
        put_varint64(&mut out, 5); // sub id
        put_varint64(&mut out, u64::MAX); // seqno_prev
        put_varint64(&mut out, 2); // delta overflows
        out.put_u8(0);
        let mut bytes = out.freeze();
        let err = Message::decode(&mut bytes).expect_err("overflow");
        assert_eq!(err, Error::BadField("sequence number delta"));
    }

    #[test]
    fn publish_round_trip_and_storage_section() {
        let data = DataMessage {
            tenant: 102,
            namespace: "102".into(),
            topic: "orders".into(),
            message_id: Uuid::new_v4(),
            payload: Bytes::from_static(b"payload"),
            seqno_prev: 0,
            seqno: 0,
        };
        let decoded = round_trip(Message::Publish(data.clone()));
        assert_eq!(decoded, Message::Publish(data.clone()));

        // The storage section alone must round-trip with caller seqnos.
        let mut storage = BytesMut::new();
        data.encode_storage(&mut storage);
        let mut bytes = storage.freeze();
        let restored = DataMessage::decode_storage(&mut bytes, 6, 7).expect("storage");
        assert_eq!(restored.seqno_prev, 6);
        assert_eq!(restored.seqno, 7);
        assert_eq!(restored.topic, "orders");
        assert_eq!(restored.payload, data.payload);
    }

    #[test]
    fn subscribe_without_cursor_section_defaults_to_empty() {
        // Encode an old-format subscribe by hand: topic id, seqno, sub id.
        let mut out = BytesMut::new();
        out.put_u8(MessageType::Subscribe as u8);
        put_fixed16(&mut out, 7);
        put_topic_id(&mut out, "ns", "topic");
        put_varint64(&mut out, 42);
        put_varint64(&mut out, 3);
        let mut bytes = out.freeze();
        let decoded = Message::decode(&mut bytes).expect("decode");
        match decoded {
            Message::Subscribe {
                start_seqno,
                sub_id,
                cursors,
                ..
            } => {
                assert_eq!(start_seqno, 42);
                assert_eq!(sub_id, 3);
                assert!(cursors.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unsubscribe_without_topic_defaults_to_empty() {
        let mut out = BytesMut::new();
        out.put_u8(MessageType::Unsubscribe as u8);
        put_fixed16(&mut out, 7);
        put_varint64(&mut out, 11);
        out.put_u8(1); // Invalid
        let mut bytes = out.freeze();
        match Message::decode(&mut bytes).expect("decode") {
            Message::Unsubscribe {
                sub_id,
                reason,
                namespace,
                topic,
                ..
            } => {
                assert_eq!(sub_id, 11);
                assert_eq!(reason, UnsubscribeReason::Invalid);
                assert!(namespace.is_empty());
                assert!(topic.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_round_trip() {
        let message = Message::Heartbeat {
            tenant: 1,
            timestamp_ms: 123_456,
            healthy_streams: vec![1, 2, 3, 900],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn heartbeat_delta_round_trip() {
        let message = Message::HeartbeatDelta {
            tenant: 1,
            timestamp_ms: 99,
            added: vec![4],
            removed: vec![2],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn legacy_empty_heartbeat_decodes() {
        let mut out = BytesMut::new();
        out.put_u8(MessageType::Heartbeat as u8);
        put_fixed16(&mut out, 1);
        let mut bytes = out.freeze();
        match Message::decode(&mut bytes).expect("decode") {
            Message::Heartbeat {
                timestamp_ms,
                healthy_streams,
                ..
            } => {
                assert_eq!(timestamp_ms, 0);
                assert!(healthy_streams.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn deliver_batch_round_trip() {
        let one = MessageDeliverData {
            tenant: 5,
            sub_id: 1,
            seqno_prev: 9,
            seqno: 10,
            message_id: Uuid::new_v4(),
            payload: Bytes::from_static(b"a"),
            namespace: "ns".into(),
            topic: "t".into(),
        };
        let two = MessageDeliverData {
            seqno_prev: 10,
            seqno: 11,
            payload: Bytes::from_static(b"b"),
            ..one.clone()
        };
        let message = Message::DeliverBatch {
            tenant: 5,
            messages: vec![one, two],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn goodbye_and_gap_round_trip() {
        let goodbye = Message::Goodbye {
            tenant: 1,
            code: GoodbyeCode::SocketError,
            origin: OriginKind::Client,
        };
        assert_eq!(round_trip(goodbye.clone()), goodbye);

        let gap = Message::Gap {
            tenant: 1,
            namespace: "ns".into(),
            topic: "t".into(),
            kind: GapKind::DataLoss,
            from: 42,
            to: 42,
        };
        assert_eq!(round_trip(gap.clone()), gap);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = Bytes::from_static(&[3u8, 0, 0]);
        assert_eq!(
            Message::decode(&mut bytes),
            Err(Error::UnknownMessageType(3))
        );
    }

    #[test]
    fn introduction_round_trip() {
        let message = Message::Introduction {
            tenant: 1,
            stream_properties: vec![("shard".into(), "4".into())],
            client_properties: vec![("host".into(), "client:9000a".into())],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn sub_ack_round_trip() {
        let message = Message::SubAck {
            tenant: 1,
            namespace: "ns".into(),
            topic: "t".into(),
            sub_id: 8,
            cursors: vec![Cursor {
                source: String::new(),
                seqno: 17,
            }],
        };
        assert_eq!(round_trip(message.clone()), message);
    }
}
