// Per-subscription client state.
use cascade_common::{NamespaceId, SequenceNumber, SubscriptionId, TenantId, Topic};
use cascade_wire::UnsubscribeReason;
use std::collections::HashMap;

use crate::observer::{DataLossInfo, MessageReceived, Observer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionStatus {
    /// Waiting for the subscribe to be sent or acknowledged.
    PendingSubscribe,
    Active,
}

pub(crate) struct SubscriptionState {
    pub tenant: TenantId,
    pub namespace: NamespaceId,
    pub topic: Topic,
    /// Requested start in wire encoding (zero means the tail).
    pub start_seqno: SequenceNumber,
    /// Next sequence number this subscription has not yet seen. Never
    /// decreases.
    pub expected_seqno: SequenceNumber,
    pub status: SubscriptionStatus,
    pub observer: ObserverSlot,
}

impl SubscriptionState {
    /// Returns `true` iff the record arrived in order and is not a
    /// duplicate. Accepting advances the expected position.
    pub fn accept_delivery(&mut self, seqno: SequenceNumber) -> bool {
        if seqno < self.expected_seqno {
            metrics::counter!("client_records_out_of_order").increment(1);
            return false;
        }
        self.expected_seqno = seqno + 1;
        true
    }
}

/// Where accepted deliveries go: straight to the application observer, or
/// through a fan-out when tail-collapsing serves several downstream
/// subscriptions from one upstream.
pub(crate) enum ObserverSlot {
    Direct(Box<dyn Observer>),
    Fanout(FanoutObserver),
}

impl ObserverSlot {
    pub fn on_message(&mut self, message: &MessageReceived) {
        match self {
            ObserverSlot::Direct(observer) => observer.on_message_received(message),
            ObserverSlot::Fanout(fanout) => fanout.on_message(message),
        }
    }

    pub fn on_data_loss(&mut self, loss: &DataLossInfo, advance_to: SequenceNumber) {
        match self {
            ObserverSlot::Direct(observer) => observer.on_data_loss(loss),
            ObserverSlot::Fanout(fanout) => fanout.on_data_loss(loss, advance_to),
        }
    }

    pub fn on_established(&mut self, start_seqno: SequenceNumber) {
        match self {
            ObserverSlot::Direct(observer) => observer.on_subscription_established(start_seqno),
            ObserverSlot::Fanout(fanout) => fanout.on_established(start_seqno),
        }
    }

    pub fn on_ended(&mut self, reason: UnsubscribeReason) {
        match self {
            ObserverSlot::Direct(observer) => observer.on_subscription_ended(reason),
            ObserverSlot::Fanout(fanout) => fanout.on_ended(reason),
        }
    }
}

pub(crate) struct FanoutDownstream {
    /// Next sequence number this downstream has not yet seen.
    pub expected_seqno: SequenceNumber,
    pub observer: Box<dyn Observer>,
}

/// Fans one upstream subscription out to its downstream observers, each
/// filtered by its own expected position.
#[derive(Default)]
pub(crate) struct FanoutObserver {
    downstreams: HashMap<SubscriptionId, FanoutDownstream>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        sub_id: SubscriptionId,
        start_seqno: SequenceNumber,
        observer: Box<dyn Observer>,
    ) {
        self.downstreams.insert(
            sub_id,
            FanoutDownstream {
                expected_seqno: start_seqno,
                observer,
            },
        );
    }

    pub fn remove(&mut self, sub_id: SubscriptionId) -> bool {
        self.downstreams.remove(&sub_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.downstreams.is_empty()
    }

    fn on_message(&mut self, message: &MessageReceived) {
        for downstream in self.downstreams.values_mut() {
            if downstream.expected_seqno <= message.seqno {
                downstream.observer.on_message_received(message);
                downstream.expected_seqno = message.seqno + 1;
            }
        }
    }

    fn on_data_loss(&mut self, loss: &DataLossInfo, advance_to: SequenceNumber) {
        for downstream in self.downstreams.values_mut() {
            if downstream.expected_seqno <= advance_to {
                downstream.observer.on_data_loss(loss);
                downstream.expected_seqno = advance_to + 1;
            }
        }
    }

    fn on_ended(&mut self, reason: UnsubscribeReason) {
        for downstream in self.downstreams.values_mut() {
            downstream.observer.on_subscription_ended(reason);
        }
    }

    fn on_established(&mut self, start_seqno: SequenceNumber) {
        for downstream in self.downstreams.values_mut() {
            downstream.observer.on_subscription_established(start_seqno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;

    struct Recorder(mpsc::Sender<SequenceNumber>);

    impl Observer for Recorder {
        fn on_message_received(&mut self, message: &MessageReceived) {
            self.0.send(message.seqno).expect("send");
        }
    }

    fn state() -> SubscriptionState {
        let (tx, _rx) = mpsc::channel();
        SubscriptionState {
            tenant: 1,
            namespace: "ns".into(),
            topic: "t".into(),
            start_seqno: 5,
            expected_seqno: 5,
            status: SubscriptionStatus::PendingSubscribe,
            observer: ObserverSlot::Direct(Box::new(Recorder(tx))),
        }
    }

    fn message(seqno: SequenceNumber) -> MessageReceived {
        MessageReceived {
            namespace: "ns".into(),
            topic: "t".into(),
            seqno,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn expected_seqno_is_monotonic() {
        let mut state = state();
        assert!(state.accept_delivery(5));
        assert_eq!(state.expected_seqno, 6);
        // Duplicates and stale records are dropped without regressing.
        assert!(!state.accept_delivery(5));
        assert!(!state.accept_delivery(3));
        assert_eq!(state.expected_seqno, 6);
        // Jumping forward is fine; the tower filtered for us.
        assert!(state.accept_delivery(9));
        assert_eq!(state.expected_seqno, 10);
    }

    #[test]
    fn fanout_filters_per_downstream() {
        let mut fanout = FanoutObserver::new();
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        fanout.add(1, 5, Box::new(Recorder(tx_a)));
        fanout.add(2, 7, Box::new(Recorder(tx_b)));

        for seqno in 5..=8 {
            fanout.on_message(&message(seqno));
        }
        let a: Vec<_> = rx_a.try_iter().collect();
        let b: Vec<_> = rx_b.try_iter().collect();
        assert_eq!(a, vec![5, 6, 7, 8]);
        assert_eq!(b, vec![7, 8]);
    }

    #[test]
    fn fanout_remove_reports_last_downstream() {
        let (tx, _rx) = mpsc::channel();
        let mut fanout = FanoutObserver::new();
        fanout.add(1, 0, Box::new(Recorder(tx)));
        assert!(!fanout.is_empty());
        assert!(fanout.remove(1));
        assert!(fanout.is_empty());
        assert!(!fanout.remove(1));
    }
}
