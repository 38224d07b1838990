// Publish path: a lazily opened stream to the pilot with acks correlated
// by message ID.
use cascade_common::{SequenceNumber, Status};
use cascade_msg::{Flow, StreamKey, WorkerCtx};
use cascade_wire::{Ack, AckStatus, DataMessage, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::ClientOptions;

pub(crate) type PublishReply = oneshot::Sender<cascade_common::Result<SequenceNumber>>;

pub(crate) struct PublisherState {
    options: Arc<ClientOptions>,
    pilot_stream: Option<StreamKey>,
    pending: HashMap<Uuid, PublishReply>,
}

impl PublisherState {
    pub fn new(options: Arc<ClientOptions>) -> Self {
        Self {
            options,
            pilot_stream: None,
            pending: HashMap::new(),
        }
    }

    pub fn publish(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow, data: DataMessage, reply: PublishReply) {
        let Some(pilot_addr) = self.options.pilot_addr else {
            let _ = reply.send(Err(Status::NotSupported("no pilot configured".into())));
            return;
        };
        let stream = match self.pilot_stream {
            Some(stream) => stream,
            None => {
                let stream = ctx.open_stream(pilot_addr, self.options.tenant);
                self.pilot_stream = Some(stream);
                stream
            }
        };
        self.pending.insert(data.message_id, reply);
        metrics::counter!("client_publishes").increment(1);
        ctx.write_stream(flow, stream, &Message::Publish(data));
    }

    pub fn on_data_ack(&mut self, acks: Vec<Ack>) {
        for ack in acks {
            let Some(reply) = self.pending.remove(&ack.message_id) else {
                continue;
            };
            let result = match ack.status {
                AckStatus::Success => Ok(ack.seqno),
                AckStatus::Failure => Err(Status::IoError("publish rejected".into())),
            };
            let _ = reply.send(result);
        }
    }

    /// A stream on this worker closed; if it was the pilot stream, every
    /// in-flight publish fails and the next publish reconnects.
    pub fn on_stream_down(&mut self, origin: StreamKey) {
        if self.pilot_stream != Some(origin) {
            return;
        }
        self.pilot_stream = None;
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(Status::IoError("pilot connection lost".into())));
        }
    }
}
