//! Per-worker backlog of deliveries waiting for an apply slot.
//!
//! Lowest sequence first; arrival order breaks ties.

use std::{cmp::Ordering, collections::BinaryHeap};

use super::Delivery;

struct Queued {
  key: (i64, u64),
  delivery: Delivery,
}

impl PartialEq for Queued {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
  }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Queued {
  // Reversed: BinaryHeap is a max-heap
  fn cmp(&self, other: &Self) -> Ordering {
    other.key.cmp(&self.key)
  }
}

#[derive(Default)]
pub(crate) struct LocalQueue {
  heap: BinaryHeap<Queued>,
  arrivals: u64,
}

impl LocalQueue {
  pub fn push(&mut self, delivery: Delivery) {
    let key = (delivery.sequence, self.arrivals);
    self.arrivals += 1;
    self.heap.push(Queued { key, delivery });
  }

  pub fn pop(&mut self) -> Option<Delivery> {
    self.heap.pop().map(|queued| queued.delivery)
  }

  pub fn len(&self) -> usize {
    self.heap.len()
  }

  pub fn is_empty(&self) -> bool {
    self.heap.is_empty()
  }
}
