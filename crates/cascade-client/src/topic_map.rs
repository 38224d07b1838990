// Topic -> subscription index used by the tail-collapsing adaptor.
//
// Open-addressed linear-probing table keyed by (namespace, topic). The
// table stores only subscription IDs; keys are recovered through a
// resolver so entries stay one word each. Subscription ID zero marks an
// empty slot. Removal shifts collided entries leftward so no element is
// ever separated from its optimal slot by a gap.
use cascade_common::{NamespaceId, SubscriptionId, Topic, RESERVED_SUBSCRIPTION_ID};
use xxhash_rust::xxh3::Xxh3;

const HASH_SEED: u64 = 0x57933c4a28a735b0;

const MIN_SIZE: usize = 16;
const LOAD_FACTOR_LOW: f64 = 0.25;
const LOAD_FACTOR_HIGH: f64 = 0.5;
const LOAD_FACTOR_OPT: f64 = (LOAD_FACTOR_LOW + LOAD_FACTOR_HIGH) / 2.0;

/// Resolves a stored subscription ID back to its topic identity.
pub(crate) trait Resolver {
    fn resolve(&self, sub_id: SubscriptionId) -> Option<(NamespaceId, Topic)>;
}

impl<F> Resolver for F
where
    F: Fn(SubscriptionId) -> Option<(NamespaceId, Topic)>,
{
    fn resolve(&self, sub_id: SubscriptionId) -> Option<(NamespaceId, Topic)> {
        self(sub_id)
    }
}

#[derive(Debug, Default)]
pub(crate) struct TopicToSubscriptionMap {
    vector: Vec<SubscriptionId>,
    sub_count: usize,
    /// Cached load band; falling outside it triggers a rehash.
    sub_count_low: usize,
    sub_count_high: usize,
}

impl TopicToSubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sub_count
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.vector.len()
    }

    pub fn find(&self, namespace: &str, topic: &str, resolver: &impl Resolver) -> Option<SubscriptionId> {
        if self.vector.is_empty() {
            return None;
        }
        let optimal_position = self.optimal_position(namespace, topic);
        let mut position = optimal_position;
        loop {
            let sub_id = self.vector[position];
            if sub_id == RESERVED_SUBSCRIPTION_ID {
                // Reached the gap: the key is absent.
                return None;
            }
            let (candidate_namespace, candidate_topic) =
                resolver.resolve(sub_id).expect("stored subscription resolvable");
            if candidate_namespace == namespace && candidate_topic == topic {
                return Some(sub_id);
            }
            position = (position + 1) % self.vector.len();
            if position == optimal_position {
                return None;
            }
        }
    }

    pub fn insert(
        &mut self,
        namespace: &str,
        topic: &str,
        sub_id: SubscriptionId,
        resolver: &impl Resolver,
    ) {
        self.rehash(resolver);
        self.insert_internal(namespace, topic, sub_id);
    }

    /// Removes an entry. Returns `false` when the subscription was not in
    /// the map under this key.
    pub fn remove(
        &mut self,
        namespace: &str,
        topic: &str,
        sub_id: SubscriptionId,
        resolver: &impl Resolver,
    ) -> bool {
        debug_assert_ne!(sub_id, RESERVED_SUBSCRIPTION_ID);
        if self.vector.is_empty() {
            return false;
        }
        let optimal_position = self.optimal_position(namespace, topic);
        let mut position = optimal_position;
        loop {
            if self.vector[position] == RESERVED_SUBSCRIPTION_ID || self.vector[position] == sub_id {
                break;
            }
            position = (position + 1) % self.vector.len();
            if position == optimal_position {
                break;
            }
        }
        if self.vector[position] != sub_id {
            return false;
        }
        self.sub_count -= 1;

        // Ensure no element ends up separated from its optimal position
        // by a gap: shift collided entries back over the hole. Only the
        // run between the removed slot and the next gap can be affected.
        let mut current_position = position;
        loop {
            self.vector[position] = RESERVED_SUBSCRIPTION_ID;
            current_position = (current_position + 1) % self.vector.len();
            let current_id = self.vector[current_position];
            if current_id == RESERVED_SUBSCRIPTION_ID {
                break;
            }
            let (current_namespace, current_topic) =
                resolver.resolve(current_id).expect("stored subscription resolvable");
            let optimal = self.optimal_position(&current_namespace, &current_topic);
            let in_run = if position <= current_position {
                position < optimal && optimal <= current_position
            } else {
                position < optimal || optimal <= current_position
            };
            if in_run {
                continue;
            }
            self.vector[position] = current_id;
            position = current_position;
        }

        self.rehash(resolver);
        true
    }

    fn insert_internal(&mut self, namespace: &str, topic: &str, sub_id: SubscriptionId) {
        debug_assert_ne!(sub_id, RESERVED_SUBSCRIPTION_ID);
        debug_assert!(self.sub_count < self.sub_count_high);

        let optimal_position = self.optimal_position(namespace, topic);
        let mut position = optimal_position;
        loop {
            debug_assert_ne!(self.vector[position], sub_id, "duplicate insertion");
            if self.vector[position] == RESERVED_SUBSCRIPTION_ID {
                self.vector[position] = sub_id;
                self.sub_count += 1;
                return;
            }
            position = (position + 1) % self.vector.len();
            if position == optimal_position {
                unreachable!("rehash must leave room for one more element");
            }
        }
    }

    fn optimal_position(&self, namespace: &str, topic: &str) -> usize {
        debug_assert!(!self.vector.is_empty());
        let mut hasher = Xxh3::with_seed(HASH_SEED);
        hasher.update(namespace.as_bytes());
        hasher.update(topic.as_bytes());
        (hasher.digest() % self.vector.len() as u64) as usize
    }

    fn needs_rehash(&self) -> bool {
        self.sub_count_low > self.sub_count || self.sub_count >= self.sub_count_high
    }

    fn rehash(&mut self, resolver: &impl Resolver) {
        if !self.needs_rehash() {
            return;
        }
        let mut new_size = (self.sub_count as f64 / LOAD_FACTOR_OPT) as usize;
        self.sub_count_low = (new_size as f64 * LOAD_FACTOR_LOW) as usize;
        if new_size <= MIN_SIZE {
            new_size = MIN_SIZE;
            self.sub_count_low = 0;
        }
        self.sub_count_high = (new_size as f64 * LOAD_FACTOR_HIGH) as usize;

        let old_vector = std::mem::replace(
            &mut self.vector,
            vec![RESERVED_SUBSCRIPTION_ID; new_size],
        );
        self.sub_count = 0;
        for sub_id in old_vector {
            if sub_id != RESERVED_SUBSCRIPTION_ID {
                let (namespace, topic) =
                    resolver.resolve(sub_id).expect("stored subscription resolvable");
                self.insert_internal(&namespace, &topic, sub_id);
            }
        }
        debug_assert!(!self.needs_rehash());
        debug_assert!(self.sub_count < self.sub_count_high);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Keys(HashMap<SubscriptionId, (NamespaceId, Topic)>);

    impl Keys {
        fn new() -> Self {
            Keys(HashMap::new())
        }

        fn resolver(&self) -> impl Resolver + '_ {
            |sub_id: SubscriptionId| self.0.get(&sub_id).cloned()
        }
    }

    fn key(i: u64) -> (String, String) {
        ("ns".to_string(), format!("topic-{i}"))
    }

    #[test]
    fn insert_find_remove() {
        let mut keys = Keys::new();
        let mut map = TopicToSubscriptionMap::new();
        let (namespace, topic) = key(1);
        keys.0.insert(10, (namespace.clone(), topic.clone()));
        map.insert(&namespace, &topic, 10, &keys.resolver());
        assert_eq!(map.find(&namespace, &topic, &keys.resolver()), Some(10));
        assert_eq!(map.find(&namespace, "other", &keys.resolver()), None);
        assert!(map.remove(&namespace, &topic, 10, &keys.resolver()));
        assert_eq!(map.find(&namespace, &topic, &keys.resolver()), None);
        assert!(!map.remove(&namespace, &topic, 10, &keys.resolver()));
    }

    #[test]
    fn probe_runs_never_cross_a_gap() {
        // After any insert/remove sequence, every present key must be
        // reachable from its optimal slot without passing an empty slot.
        let mut keys = Keys::new();
        let mut map = TopicToSubscriptionMap::new();
        for i in 1..=64u64 {
            let (namespace, topic) = key(i);
            keys.0.insert(i, (namespace.clone(), topic.clone()));
            map.insert(&namespace, &topic, i, &keys.resolver());
        }
        // Remove a scattering of entries to force shifts.
        for i in (1..=64u64).step_by(3) {
            let (namespace, topic) = key(i);
            assert!(map.remove(&namespace, &topic, i, &keys.resolver()));
            keys.0.remove(&i);
        }
        for (&sub_id, (namespace, topic)) in &keys.0 {
            assert_eq!(
                map.find(namespace, topic, &keys.resolver()),
                Some(sub_id),
                "lost subscription {sub_id}"
            );
        }
    }

    #[test]
    fn load_factor_stays_inside_band() {
        let mut keys = Keys::new();
        let mut map = TopicToSubscriptionMap::new();
        for i in 1..=1000u64 {
            let (namespace, topic) = key(i);
            keys.0.insert(i, (namespace.clone(), topic.clone()));
            map.insert(&namespace, &topic, i, &keys.resolver());
            let load = map.len() as f64 / map.capacity() as f64;
            assert!(load <= LOAD_FACTOR_HIGH, "load {load} too high at {i}");
        }
        for i in (1..=1000u64).rev() {
            let (namespace, topic) = key(i);
            map.remove(&namespace, &topic, i, &keys.resolver());
            keys.0.remove(&i);
            if map.capacity() > MIN_SIZE {
                let load = map.len() as f64 / map.capacity() as f64;
                assert!(load <= LOAD_FACTOR_HIGH);
            }
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn rehash_respects_minimum_size() {
        let mut keys = Keys::new();
        let mut map = TopicToSubscriptionMap::new();
        let (namespace, topic) = key(1);
        keys.0.insert(1, (namespace.clone(), topic.clone()));
        map.insert(&namespace, &topic, 1, &keys.resolver());
        assert_eq!(map.capacity(), MIN_SIZE);
    }
}
