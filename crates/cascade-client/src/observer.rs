// Application-facing delivery callbacks.
use bytes::Bytes;
use cascade_common::{GapKind, NamespaceId, SequenceNumber, Topic};
use cascade_wire::UnsubscribeReason;

/// A record delivered on a subscription.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub seqno: SequenceNumber,
    pub payload: Bytes,
}

/// A range of sequence numbers that will never be delivered.
#[derive(Debug, Clone, Copy)]
pub struct DataLossInfo {
    pub kind: GapKind,
    pub from: SequenceNumber,
    pub to: SequenceNumber,
}

/// Receives subscription events on the subscription's worker.
///
/// Callbacks run on a single worker task and see records at most once per
/// sequence number, in ascending order. They must not block: a blocking
/// observer stalls every stream on the worker and eventually trips
/// socket-level back-pressure.
pub trait Observer: Send + 'static {
    fn on_message_received(&mut self, message: &MessageReceived);

    /// The server acknowledged the subscription; delivery starts at
    /// `start_seqno`. May fire again after a silent resubscribe.
    fn on_subscription_established(&mut self, start_seqno: SequenceNumber) {
        let _ = start_seqno;
    }

    fn on_data_loss(&mut self, loss: &DataLossInfo) {
        let _ = loss;
    }

    /// The subscription ended for a reason other than a local
    /// unsubscribe.
    fn on_subscription_ended(&mut self, reason: UnsubscribeReason) {
        let _ = reason;
    }
}
