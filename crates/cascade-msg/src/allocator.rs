// Stream ID allocation.
//
// The ID space is partitioned across workers at bring-up: worker `i` of
// `n` allocates IDs congruent to `i` modulo `n`. The shared allocator is
// behind a coarse mutex; it is only touched when opening outbound streams.
use cascade_common::StreamId;

#[derive(Debug)]
pub struct StreamIdAllocator {
    num_workers: u64,
    next: Vec<StreamId>,
}

impl StreamIdAllocator {
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0);
        Self {
            num_workers: num_workers as u64,
            // Start above zero so stream ID 0 never appears on the wire.
            next: (0..num_workers as u64).map(|i| i + 1).collect(),
        }
    }

    pub fn allocate(&mut self, worker_index: usize) -> StreamId {
        let id = self.next[worker_index];
        self.next[worker_index] = id + self.num_workers;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn partitions_are_disjoint() {
        let mut allocator = StreamIdAllocator::new(4);
        let mut seen = HashSet::new();
        for worker in 0..4 {
            for _ in 0..100 {
                let id = allocator.allocate(worker);
                assert!(seen.insert(id), "duplicate stream id {id}");
                assert_eq!((id - 1) % 4, worker as u64);
            }
        }
    }

    #[test]
    fn ids_start_above_zero() {
        let mut allocator = StreamIdAllocator::new(1);
        assert_eq!(allocator.allocate(0), 1);
        assert_eq!(allocator.allocate(0), 2);
    }
}
